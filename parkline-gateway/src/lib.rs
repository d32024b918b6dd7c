// Parkline Gateway - Edge buffering and batch sync
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Parkline Gateway - Edge buffering and batch sync
//!
//! Sits between occupancy sensors and the Parkline coordinator. Events are
//! accepted without touching the network, held in a bounded buffer and
//! forwarded in idempotent batches that survive coordinator outages.
//!
//! ## Features
//!
//! - **Non-blocking ingest**: producers only take the buffer lock
//! - **Bounded buffer**: overflow evicts the oldest event and reports the gap
//! - **Stable batch ids**: an unacknowledged batch is resent unchanged, so a
//!   lost ack never causes a double merge
//! - **Exponential backoff**: retries forever, capped at a maximum delay
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ingest   ┌──────────────────────────────┐  SyncBatch  ┌─────────────┐
//! │ Sensors  │ ────────► │ EdgeGateway                  │ ──────────► │ Coordinator │
//! └──────────┘           │  EdgeBuffer ─► sender task   │ ◄────────── │             │
//!                        └──────────────────────────────┘   BatchAck  └─────────────┘
//! ```

mod buffer;
mod config;
mod error;
mod gateway;
mod retry;
mod transport;

// Public API
pub use buffer::{BufferCounters, EdgeBuffer};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{EdgeGateway, GatewayStats};
pub use retry::Backoff;
pub use transport::{LocalTransport, SyncTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
