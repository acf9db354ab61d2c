//! tabletgrid-health — tablet health classification.
//!
//! Given a tablet's replicas, its desired replication factor, placement
//! constraints and the current membership view, [`classify`] returns a
//! [`TabletHealthStatus`] and a suggested [`Priority`]. Colocated tablets
//! are classified against their required backend set with
//! [`classify_colocate`]. Both are pure functions.

pub mod classifier;
pub mod location;
pub mod status;

pub use classifier::{ClassifyInput, classify, classify_colocate};
pub use location::{covered_locations, is_location_match};
pub use status::{Priority, TabletHealthStatus};
