//! EmberCache Core - Placement core for a content-addressed edge cache
//!
//! A bin-based content-placement engine using:
//! - 65536 fixed bins keyed by the low 16 bits of a content hash
//! - near-balanced incremental assignment under membership changes
//! - tombstoned assignments so in-flight content stays reachable
//! - a self-describing snapshot codec for persistence and hand-off

pub mod bin_manager;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod location;
pub mod ordering;

pub use bin_manager::{
    BIN_COUNT, BinManager, bin_for_hash, bin_for_key, compute_hash, verify_hash,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{BinAssignment, BinMappings};
pub use config::{Config, PruneConfig, ReplicationConfig};
pub use error::{EmberError, Result};
pub use location::LocationId;
