//! notify-relay daemon - broker consumer, dispatcher and WebSocket gateway
//!
//! This crate provides the relay pipeline:
//! - `consumer` - Pulls messages from the broker queue into the internal channel
//! - `channel` - Bounded handoff queue providing backpressure
//! - `dispatcher` - Routes each message to a broadcast or a targeted send
//! - `registry` - Identity-keyed directory of live connections, plus token auth
//! - `gateway` - WebSocket accept loop and per-connection handling
//! - `supervisor` - Builds the pipeline from config and drives its lifecycle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────────┐   ┌──────────────┐
//! │  broker  │──▶│ Consumer  │──▶│  channel   │──▶│  Dispatcher  │
//! │  queue   │   │ (lapin)   │   │ (bounded)  │   │              │
//! └──────────┘   └───────────┘   └────────────┘   └──────┬───────┘
//!                                                        │ broadcast /
//!                                                        │ targeted_send
//!                ┌───────────┐   register/release ┌──────▼───────┐
//!  clients ◀────▶│  Gateway  │───────────────────▶│ClientRegistry│
//!   (ws)         │           │                    │              │
//!                └───────────┘                    └──────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod gateway;
pub mod registry;
pub mod service;
pub mod supervisor;
