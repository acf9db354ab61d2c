//! Catalog and cluster domain types.
//!
//! These types mirror the metadata the scheduler reads from the catalog
//! (databases, tables, partitions, indexes, tablets and their replicas)
//! and from cluster membership (backends and their disks). All of them
//! are plain serializable snapshots; the source of truth lives behind the
//! collaborator traits in [`crate::catalog`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub type DbId = u64;
pub type TableId = u64;
pub type PartitionId = u64;
pub type IndexId = u64;
pub type TabletId = u64;
pub type ReplicaId = u64;
pub type BackendId = u64;
pub type PathHash = u64;
pub type TxnId = u64;
pub type ColocateGroupId = u64;

// ── Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageMedium {
    Hdd,
    Ssd,
}

impl StorageMedium {
    pub const ALL: [StorageMedium; 2] = [StorageMedium::Hdd, StorageMedium::Ssd];
}

impl fmt::Display for StorageMedium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMedium::Hdd => write!(f, "HDD"),
            StorageMedium::Ssd => write!(f, "SSD"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskState {
    #[default]
    Online,
    Offline,
    Decommissioned,
}

/// One storage root path on a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskInfo {
    pub root_path: String,
    /// Unset until the backend has reported the path.
    pub path_hash: Option<PathHash>,
    pub medium: StorageMedium,
    #[serde(default)]
    pub state: DiskState,
    pub total_capacity_bytes: u64,
    pub available_capacity_bytes: u64,
    #[serde(default)]
    pub data_used_capacity_bytes: u64,
}

impl DiskInfo {
    pub fn used_capacity_bytes(&self) -> u64 {
        self.total_capacity_bytes
            .saturating_sub(self.available_capacity_bytes)
    }
}

// ── Backend ────────────────────────────────────────────────────

/// A single-level location label, e.g. `rack:r1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub key: String,
    pub value: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// Allowed location values per key. A value list containing `*` accepts
/// every value of that key.
pub type LocationRequirement = BTreeMap<String, BTreeSet<String>>;

/// A storage node as reported by cluster membership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backend {
    pub id: BackendId,
    pub host: String,
    pub alive: bool,
    #[serde(default)]
    pub decommissioned: bool,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub disks: Vec<DiskInfo>,
}

impl Backend {
    /// Alive and not being decommissioned.
    pub fn is_available(&self) -> bool {
        self.alive && !self.decommissioned
    }

    /// True once every disk has reported its path hash.
    pub fn has_path_hash(&self) -> bool {
        !self.disks.is_empty() && self.disks.iter().all(|d| d.path_hash.is_some())
    }

    pub fn disk(&self, path_hash: PathHash) -> Option<&DiskInfo> {
        self.disks.iter().find(|d| d.path_hash == Some(path_hash))
    }

    pub fn path_hashes(&self) -> Vec<PathHash> {
        self.disks.iter().filter_map(|d| d.path_hash).collect()
    }

    pub fn is_disk_decommissioned(&self, path_hash: PathHash) -> bool {
        self.disk(path_hash)
            .is_some_and(|d| d.state == DiskState::Decommissioned)
    }

    pub fn has_medium(&self, medium: StorageMedium) -> bool {
        self.disks.iter().any(|d| d.medium == medium)
    }
}

// ── Catalog objects ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Database {
    pub id: DbId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    #[default]
    Normal,
    Rollup,
    SchemaChange,
    Restore,
    WaitingStable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeysType {
    #[default]
    Duplicate,
    Aggregate,
    Unique,
    Primary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Table {
    pub id: TableId,
    pub db_id: DbId,
    pub name: String,
    #[serde(default)]
    pub state: TableState,
    #[serde(default)]
    pub keys_type: KeysType,
    #[serde(default)]
    pub colocate_group: Option<ColocateGroupId>,
    #[serde(default)]
    pub location: Option<LocationRequirement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    #[default]
    Normal,
    Restore,
}

/// Logical partition: carries the replication properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Partition {
    pub id: PartitionId,
    pub table_id: TableId,
    pub name: String,
    #[serde(default)]
    pub state: PartitionState,
    pub replication_num: u16,
    pub storage_medium: StorageMedium,
}

/// Physical partition: carries the version state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhysicalPartition {
    pub id: PartitionId,
    pub parent_id: PartitionId,
    pub table_id: TableId,
    pub visible_version: u64,
    #[serde(default)]
    pub visible_version_time_ms: u64,
    pub committed_version: u64,
    #[serde(default)]
    pub visible_txn_id: TxnId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaterializedIndex {
    pub id: IndexId,
    pub physical_partition_id: PartitionId,
    pub schema_hash: u32,
    /// Tablets in bucket order.
    pub tablets: Vec<TabletId>,
}

impl MaterializedIndex {
    /// Bucket position of a tablet, used to address colocate backend sets.
    pub fn tablet_order_idx(&self, tablet_id: TabletId) -> Option<usize> {
        self.tablets.iter().position(|t| *t == tablet_id)
    }
}

/// Placement of a tablet inside the catalog hierarchy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabletMeta {
    pub db_id: DbId,
    pub table_id: TableId,
    pub physical_partition_id: PartitionId,
    pub index_id: IndexId,
}

// ── Tablet / Replica ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    #[default]
    Normal,
    Clone,
    Alter,
    SchemaChange,
    Decommission,
}

impl ReplicaState {
    /// States that can still receive load transactions.
    pub fn can_load(self) -> bool {
        matches!(
            self,
            ReplicaState::Normal | ReplicaState::Alter | ReplicaState::SchemaChange
        )
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicaState::Normal => "NORMAL",
            ReplicaState::Clone => "CLONE",
            ReplicaState::Alter => "ALTER",
            ReplicaState::SchemaChange => "SCHEMA_CHANGE",
            ReplicaState::Decommission => "DECOMMISSION",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Replica {
    pub id: ReplicaId,
    pub backend_id: BackendId,
    #[serde(default)]
    pub path_hash: Option<PathHash>,
    pub version: u64,
    #[serde(default)]
    pub last_failed_version: Option<u64>,
    #[serde(default)]
    pub last_success_version: u64,
    #[serde(default)]
    pub data_size: u64,
    #[serde(default)]
    pub row_count: u64,
    #[serde(default)]
    pub state: ReplicaState,
    #[serde(default)]
    pub bad: bool,
    /// Fence set before a two-phase delete.
    #[serde(default)]
    pub watermark_txn_id: Option<TxnId>,
    #[serde(default)]
    pub need_further_repair: bool,
}

impl Replica {
    pub fn new(id: ReplicaId, backend_id: BackendId, path_hash: Option<PathHash>, version: u64) -> Self {
        Self {
            id,
            backend_id,
            path_hash,
            version,
            last_failed_version: None,
            last_success_version: version,
            data_size: 0,
            row_count: 0,
            state: ReplicaState::Normal,
            bad: false,
            watermark_txn_id: None,
            need_further_repair: false,
        }
    }

    pub fn check_version_catch_up(&self, visible_version: u64) -> bool {
        self.version >= visible_version
    }

    /// Caught up and without a recorded failed version.
    pub fn is_version_complete(&self, visible_version: u64) -> bool {
        self.last_failed_version.is_none() && self.check_version_catch_up(visible_version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tablet {
    pub id: TabletId,
    pub replicas: Vec<Replica>,
}

impl Tablet {
    pub fn replica(&self, replica_id: ReplicaId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.id == replica_id)
    }

    pub fn replica_by_backend(&self, backend_id: BackendId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.backend_id == backend_id)
    }

    pub fn backend_ids(&self) -> BTreeSet<BackendId> {
        self.replicas.iter().map(|r| r.backend_id).collect()
    }

    /// Largest replica data size, used to estimate copy cost.
    pub fn data_size(&self) -> u64 {
        self.replicas.iter().map(|r| r.data_size).max().unwrap_or(0)
    }

    /// Compact human-readable replica list for logs and introspection.
    pub fn replica_infos(&self) -> String {
        let parts: Vec<String> = self
            .replicas
            .iter()
            .map(|r| {
                format!(
                    "{}:{}:v{}:{}{}",
                    r.backend_id,
                    r.id,
                    r.version,
                    r.state,
                    if r.bad { ":bad" } else { "" }
                )
            })
            .collect();
        parts.join(",")
    }
}
