//! Network server end device registry.
//!
//! ```text
//!   <root>:uid:<app>.<dev>                 record
//!   <root>:eui:<JoinEUI>:<DevEUI>          -> uid
//!   <root>:addr:<DevAddr>:current          zset uid -> last FCnt & 0xFFFF
//!   <root>:addr:<DevAddr>:current:fields   hash uid -> CurrentProjection
//!   <root>:addr:<DevAddr>:pending          zset uid -> indexed at (ns)
//!   <root>:addr:<DevAddr>:pending:fields   hash uid -> PendingProjection
//!   <root>:relay:rules:<servedUID>         -> serving uid
//! ```
//!
//! # Modules
//!
//! - [`model`] - End device records
//! - [`fieldmask`] - Field mask validation, projection and merging
//! - [`projection`] - Compact session projections for uplink matching
//! - [`index`] - Index key layout and index deltas
//! - [`device`] - The registry
//! - [`maintenance`] - Schema migrations and orphan cleanup

pub mod device;
pub mod fieldmask;
pub mod index;
pub mod maintenance;
pub mod model;
pub mod projection;

pub use device::{DeviceKeyIter, DeviceRegistry, PruneReport, UplinkMatchCandidate};
pub use index::RegistryKeys;
pub use maintenance::NETWORK_SERVER_SCHEMA_VERSION;
pub use model::{EndDevice, MacVersion};
