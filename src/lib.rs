//! lorawan-coord - Redis-backed coordination substrate for a LoRaWAN stack.
//!
//! Network, application and join servers share device state, work queues
//! and transient correlation state through one key/value store. This crate
//! is that shared layer: every operation is a batch of store commands, made
//! atomic with transactions, watched keys or scripts, so any number of
//! server processes can run side by side.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   registry (devices, indices, uplink matching)                  │
//! │   queue (scheduled tasks, application uplinks)                  │
//! │   downlink (TX acknowledgment matching)                         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   store: typed records │ mutex │ dedup │ schema │ cleanup       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Backend: RedisBackend (RESP2, pooled)  │  MemoryBackend       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::context`] - Deadlines and cancellation
//! - [`core::runtime`] - Worker supervision
//! - [`core::error`] - Error types and categories
//!
//! ## Store
//! - [`redis`] - RESP2 codec and pooled client
//! - [`store`] - Backend seam, records, mutex, dedup, schema, cleanup
//!
//! ## Components
//! - [`queue`] - Task queue and application uplink queue
//! - [`registry`] - Network server device registry
//! - [`downlink`] - Scheduled downlink matcher
//! - [`ids`] / [`messages`] - Identifiers and message shapes
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations

// Core infrastructure
pub mod core;

// Wire protocol and store seam
pub mod redis;
pub mod store;

// Components
pub mod downlink;
pub mod ids;
pub mod messages;
pub mod queue;
pub mod registry;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, context, error, runtime, time};
pub use self::core::context::Context;
pub use self::core::error::{ErrorCategory, StoreError, StoreResult};
