//! Core runtime infrastructure.
//!
//! This module contains the pieces every component builds on:
//! - [`config`] - Configuration parsing and validation
//! - [`context`] - Deadlines and cancellation
//! - [`runtime`] - Worker supervision
//! - [`time`] - Timestamp and duration helpers
//! - [`error`] - Error types and category mapping

pub mod config;
pub mod context;
pub mod error;
pub mod runtime;
pub mod time;
