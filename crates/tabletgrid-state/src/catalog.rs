//! Collaborator interfaces consumed by the scheduler.
//!
//! The scheduler never owns catalog or membership state. It receives
//! handles implementing these traits at construction and reaches every
//! piece of external state through them.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::StateResult;
use crate::types::*;

/// Coarse per-database lock guarding multi-step catalog reads and writes.
pub type DbLock = Arc<RwLock<()>>;

/// Objects that can sit in the recycle bin before being purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecycledObject {
    Database(DbId),
    Table(TableId),
    Partition(PartitionId),
}

/// Read-mostly metadata store: the source of truth for tablets.
pub trait Catalog: Send + Sync {
    fn db_lock(&self, db_id: DbId) -> Option<DbLock>;

    fn database(&self, db_id: DbId) -> Option<Database>;
    fn table(&self, db_id: DbId, table_id: TableId) -> Option<Table>;
    fn physical_partition(
        &self,
        table_id: TableId,
        physical_partition_id: PartitionId,
    ) -> Option<PhysicalPartition>;
    fn partition(&self, table_id: TableId, partition_id: PartitionId) -> Option<Partition>;
    fn index(&self, physical_partition_id: PartitionId, index_id: IndexId) -> Option<MaterializedIndex>;
    fn tablet(&self, tablet_id: TabletId) -> Option<Tablet>;
    fn tablet_meta(&self, tablet_id: TabletId) -> Option<TabletMeta>;
    fn tablet_ids(&self) -> Vec<TabletId>;

    /// Every replica hosted on a backend, with its tablet id.
    fn replicas_on_backend(&self, backend_id: BackendId) -> Vec<(TabletId, Replica)>;

    /// Required backend set for one bucket of a colocate group.
    fn colocate_backends(&self, group: ColocateGroupId, bucket_idx: usize) -> Option<BTreeSet<BackendId>>;

    /// True when the object is in the recycle bin and will be purged
    /// too soon for scheduling work on it to be worthwhile.
    fn erase_soon(&self, object: RecycledObject, now_ms: u64) -> bool;

    fn add_replica(&self, tablet_id: TabletId, replica: Replica) -> bool;
    fn update_replica(
        &self,
        tablet_id: TabletId,
        replica_id: ReplicaId,
        f: &mut dyn FnMut(&mut Replica),
    ) -> bool;
    /// Remove the replica hosted on `backend_id`, returning it.
    fn delete_replica(&self, tablet_id: TabletId, backend_id: BackendId) -> Option<Replica>;
    fn next_id(&self) -> u64;
}

/// Cluster membership and disk topology.
pub trait ClusterInfo: Send + Sync {
    fn backends(&self) -> Vec<Backend>;
    fn backend(&self, backend_id: BackendId) -> Option<Backend>;

    fn alive_backend_ids(&self) -> Vec<BackendId> {
        self.backends()
            .into_iter()
            .filter(|b| b.alive)
            .map(|b| b.id)
            .collect()
    }

    fn available_backends(&self) -> Vec<Backend> {
        self.backends()
            .into_iter()
            .filter(|b| b.is_available())
            .collect()
    }

    fn backend_map(&self) -> HashMap<BackendId, Backend> {
        self.backends().into_iter().map(|b| (b.id, b)).collect()
    }
}

pub trait TransactionManager: Send + Sync {
    fn next_transaction_id(&self) -> TxnId;

    /// Whether every transaction on the given tables that started before
    /// `watermark` has finished.
    fn is_previous_transactions_finished(
        &self,
        watermark: TxnId,
        db_id: DbId,
        table_ids: &[TableId],
    ) -> StateResult<bool>;
}
