//! tabletgrid-state — catalog model and collaborator interfaces.
//!
//! Everything the tablet scheduler knows about the outside world comes
//! through this crate:
//!
//! ```text
//! Catalog            databases, tables, partitions, indexes, tablets, replicas
//! ClusterInfo        backends, disks, hosts, locations
//! TransactionManager watermark checks for two-phase replica deletes
//! EditLog            append-only replica add/update/delete records
//! ```
//!
//! `memory` provides in-process implementations used by the daemon's
//! simulated cluster and by tests. `JournalStore` persists the edit log
//! in [redb](https://docs.rs/redb) and can replay it onto a catalog.

pub mod catalog;
pub mod error;
pub mod journal;
pub mod memory;
pub mod tables;
pub mod types;

pub use catalog::{Catalog, ClusterInfo, DbLock, RecycledObject, TransactionManager};
pub use error::{StateError, StateResult};
pub use journal::{EditLog, JournalStore, ReplicaOp, ReplicaPersistInfo};
pub use memory::{MemoryCatalog, MemoryCluster, MemoryTxnManager};
pub use types::*;
