//! tabletgrid-placement — cluster load statistics.
//!
//! A [`ClusterLoadStatistic`] is an immutable snapshot of per-backend,
//! per-path utilization built from membership and the catalog. The
//! scheduler rebuilds it on the statistics interval and swaps it in
//! whole; destination choice and balancing read whichever snapshot was
//! current when they ran.
//!
//! # Load score
//!
//! ```text
//! score(be, medium) = c * used%(be) / avg used%
//!                   + (1 - c) * replicas(be) / avg replicas
//! c = clamp(2 * cluster used% - 0.5, 0.5, 1.0)
//! ```
//!
//! Disk usage dominates as the cluster fills up.

pub mod cluster;
pub mod load;

pub use cluster::ClusterLoadStatistic;
pub use load::{BackendLoadStatistic, FitLimits, RootPathLoadStatistic};
