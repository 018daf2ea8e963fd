//! Scheduled downlink matching.
//!
//! Downlinks handed to a gateway are stored under their transmission
//! correlation ID (`ns:transmission:<id>`) for a short TTL. The gateway's TX
//! acknowledgment carries the same ID and takes the downlink back exactly
//! once.

pub mod matcher;

pub use matcher::{transmission_id, ScheduledDownlinkMatcher};
