//! Scheduled work queues.
//!
//! # Modules
//!
//! - [`task`] - Time-scheduled, consumer-group task queue
//! - [`app_uplink`] - Per-application uplink streams activated through a task queue

pub mod app_uplink;
pub mod task;

pub use app_uplink::{ApplicationUplinkQueue, Drain};
pub use task::{Task, TaskQueue};
