//! In-memory implementations of the collaborator traits.
//!
//! Used by the daemon's simulated cluster and by tests. The catalog keeps
//! all objects in hash maps behind one `RwLock`; the per-database locks
//! handed out by [`Catalog::db_lock`] are separate and only order
//! multi-step operations of callers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::catalog::*;
use crate::error::{StateError, StateResult};
use crate::types::*;

/// Recycle-bin entries closer than this to their purge time count as
/// "erase soon".
pub const MIN_ERASE_LATENCY_MS: u64 = 10 * 60 * 1_000;

// ── Catalog ────────────────────────────────────────────────────

#[derive(Default)]
struct CatalogData {
    databases: HashMap<DbId, Database>,
    tables: HashMap<TableId, Table>,
    partitions: HashMap<PartitionId, Partition>,
    physical_partitions: HashMap<PartitionId, PhysicalPartition>,
    indexes: HashMap<IndexId, MaterializedIndex>,
    tablets: BTreeMap<TabletId, Tablet>,
    tablet_meta: HashMap<TabletId, TabletMeta>,
    colocate: HashMap<ColocateGroupId, Vec<BTreeSet<BackendId>>>,
    recycle: HashMap<RecycledObject, u64>,
}

pub struct MemoryCatalog {
    data: RwLock<CatalogData>,
    db_locks: Mutex<HashMap<DbId, DbLock>>,
    next_id: AtomicU64,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(CatalogData::default()),
            db_locks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(100_000),
        }
    }

    pub fn add_database(&self, db: Database) {
        self.db_locks
            .lock()
            .expect("db lock map")
            .entry(db.id)
            .or_insert_with(|| Arc::new(RwLock::new(())));
        self.data.write().expect("catalog lock").databases.insert(db.id, db);
    }

    pub fn add_table(&self, table: Table) {
        self.data.write().expect("catalog lock").tables.insert(table.id, table);
    }

    pub fn add_partition(&self, partition: Partition) {
        self.data
            .write()
            .expect("catalog lock")
            .partitions
            .insert(partition.id, partition);
    }

    pub fn add_physical_partition(&self, partition: PhysicalPartition) {
        self.data
            .write()
            .expect("catalog lock")
            .physical_partitions
            .insert(partition.id, partition);
    }

    pub fn add_index(&self, index: MaterializedIndex) {
        self.data.write().expect("catalog lock").indexes.insert(index.id, index);
    }

    /// Register a tablet under an existing index, appending it to the
    /// index's bucket order.
    pub fn add_tablet(&self, meta: TabletMeta, tablet: Tablet) {
        let mut data = self.data.write().expect("catalog lock");
        if let Some(index) = data.indexes.get_mut(&meta.index_id) {
            if !index.tablets.contains(&tablet.id) {
                index.tablets.push(tablet.id);
            }
        }
        data.tablet_meta.insert(tablet.id, meta);
        data.tablets.insert(tablet.id, tablet);
    }

    pub fn remove_table(&self, table_id: TableId) {
        self.data.write().expect("catalog lock").tables.remove(&table_id);
    }

    pub fn set_table_state(&self, table_id: TableId, state: TableState) {
        if let Some(table) = self.data.write().expect("catalog lock").tables.get_mut(&table_id) {
            table.state = state;
        }
    }

    pub fn set_colocate_backends(&self, group: ColocateGroupId, buckets: Vec<BTreeSet<BackendId>>) {
        self.data.write().expect("catalog lock").colocate.insert(group, buckets);
    }

    /// Place an object in the recycle bin with its purge deadline.
    pub fn recycle(&self, object: RecycledObject, erase_at_ms: u64) {
        self.data
            .write()
            .expect("catalog lock")
            .recycle
            .insert(object, erase_at_ms);
    }

    /// Make sure `next_id` never hands out an id at or below `used`.
    pub fn reserve_ids_through(&self, used: u64) {
        self.next_id.fetch_max(used + 1, Ordering::SeqCst);
    }

    /// Publish a new visible version for a physical partition.
    pub fn set_visible_version(&self, physical_partition_id: PartitionId, version: u64, time_ms: u64) {
        let mut data = self.data.write().expect("catalog lock");
        if let Some(pp) = data.physical_partitions.get_mut(&physical_partition_id) {
            pp.visible_version = version;
            pp.visible_version_time_ms = time_ms;
            pp.committed_version = pp.committed_version.max(version);
        }
    }
}

impl Catalog for MemoryCatalog {
    fn db_lock(&self, db_id: DbId) -> Option<DbLock> {
        self.db_locks.lock().expect("db lock map").get(&db_id).cloned()
    }

    fn database(&self, db_id: DbId) -> Option<Database> {
        self.data.read().expect("catalog lock").databases.get(&db_id).cloned()
    }

    fn table(&self, db_id: DbId, table_id: TableId) -> Option<Table> {
        let data = self.data.read().expect("catalog lock");
        data.tables
            .get(&table_id)
            .filter(|t| t.db_id == db_id)
            .cloned()
    }

    fn physical_partition(
        &self,
        table_id: TableId,
        physical_partition_id: PartitionId,
    ) -> Option<PhysicalPartition> {
        let data = self.data.read().expect("catalog lock");
        data.physical_partitions
            .get(&physical_partition_id)
            .filter(|p| p.table_id == table_id)
            .cloned()
    }

    fn partition(&self, table_id: TableId, partition_id: PartitionId) -> Option<Partition> {
        let data = self.data.read().expect("catalog lock");
        data.partitions
            .get(&partition_id)
            .filter(|p| p.table_id == table_id)
            .cloned()
    }

    fn index(&self, physical_partition_id: PartitionId, index_id: IndexId) -> Option<MaterializedIndex> {
        let data = self.data.read().expect("catalog lock");
        data.indexes
            .get(&index_id)
            .filter(|i| i.physical_partition_id == physical_partition_id)
            .cloned()
    }

    fn tablet(&self, tablet_id: TabletId) -> Option<Tablet> {
        self.data.read().expect("catalog lock").tablets.get(&tablet_id).cloned()
    }

    fn tablet_meta(&self, tablet_id: TabletId) -> Option<TabletMeta> {
        self.data.read().expect("catalog lock").tablet_meta.get(&tablet_id).copied()
    }

    fn tablet_ids(&self) -> Vec<TabletId> {
        self.data.read().expect("catalog lock").tablets.keys().copied().collect()
    }

    fn replicas_on_backend(&self, backend_id: BackendId) -> Vec<(TabletId, Replica)> {
        let data = self.data.read().expect("catalog lock");
        data.tablets
            .values()
            .filter_map(|t| t.replica_by_backend(backend_id).map(|r| (t.id, r.clone())))
            .collect()
    }

    fn colocate_backends(&self, group: ColocateGroupId, bucket_idx: usize) -> Option<BTreeSet<BackendId>> {
        let data = self.data.read().expect("catalog lock");
        data.colocate.get(&group).and_then(|b| b.get(bucket_idx)).cloned()
    }

    fn erase_soon(&self, object: RecycledObject, now_ms: u64) -> bool {
        let data = self.data.read().expect("catalog lock");
        match data.recycle.get(&object) {
            Some(erase_at) => erase_at.saturating_sub(now_ms) < MIN_ERASE_LATENCY_MS,
            None => false,
        }
    }

    fn add_replica(&self, tablet_id: TabletId, replica: Replica) -> bool {
        let mut data = self.data.write().expect("catalog lock");
        let Some(tablet) = data.tablets.get_mut(&tablet_id) else {
            return false;
        };
        if tablet.replica_by_backend(replica.backend_id).is_some() {
            return false;
        }
        debug!(tablet_id, replica_id = replica.id, backend_id = replica.backend_id, "replica added");
        tablet.replicas.push(replica);
        true
    }

    fn update_replica(
        &self,
        tablet_id: TabletId,
        replica_id: ReplicaId,
        f: &mut dyn FnMut(&mut Replica),
    ) -> bool {
        let mut data = self.data.write().expect("catalog lock");
        let replica = data
            .tablets
            .get_mut(&tablet_id)
            .and_then(|t| t.replicas.iter_mut().find(|r| r.id == replica_id));
        match replica {
            Some(replica) => {
                f(replica);
                true
            }
            None => false,
        }
    }

    fn delete_replica(&self, tablet_id: TabletId, backend_id: BackendId) -> Option<Replica> {
        let mut data = self.data.write().expect("catalog lock");
        let tablet = data.tablets.get_mut(&tablet_id)?;
        let pos = tablet.replicas.iter().position(|r| r.backend_id == backend_id)?;
        let removed = tablet.replicas.remove(pos);
        debug!(tablet_id, replica_id = removed.id, backend_id, "replica deleted");
        Some(removed)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

// ── Cluster ────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCluster {
    backends: RwLock<BTreeMap<BackendId, Backend>>,
}

impl MemoryCluster {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends: RwLock::new(backends.into_iter().map(|b| (b.id, b)).collect()),
        }
    }

    pub fn upsert(&self, backend: Backend) {
        self.backends.write().expect("cluster lock").insert(backend.id, backend);
    }

    pub fn remove(&self, backend_id: BackendId) -> Option<Backend> {
        self.backends.write().expect("cluster lock").remove(&backend_id)
    }

    /// Apply a change to one backend in place.
    pub fn modify(&self, backend_id: BackendId, f: impl FnOnce(&mut Backend)) -> bool {
        match self.backends.write().expect("cluster lock").get_mut(&backend_id) {
            Some(backend) => {
                f(backend);
                true
            }
            None => false,
        }
    }
}

impl ClusterInfo for MemoryCluster {
    fn backends(&self) -> Vec<Backend> {
        self.backends.read().expect("cluster lock").values().cloned().collect()
    }

    fn backend(&self, backend_id: BackendId) -> Option<Backend> {
        self.backends.read().expect("cluster lock").get(&backend_id).cloned()
    }
}

// ── Transactions ───────────────────────────────────────────────

struct RunningTxn {
    db_id: DbId,
    table_ids: Vec<TableId>,
}

/// Transaction manager tracking running transactions in memory.
pub struct MemoryTxnManager {
    next_id: AtomicU64,
    running: Mutex<BTreeMap<TxnId, RunningTxn>>,
    failure: Mutex<Option<String>>,
}

impl Default for MemoryTxnManager {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryTxnManager {
    pub fn new(first_txn_id: TxnId) -> Self {
        Self {
            next_id: AtomicU64::new(first_txn_id),
            running: Mutex::new(BTreeMap::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn begin(&self, db_id: DbId, table_ids: Vec<TableId>) -> TxnId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.running
            .lock()
            .expect("txn lock")
            .insert(id, RunningTxn { db_id, table_ids });
        id
    }

    pub fn finish(&self, txn_id: TxnId) {
        self.running.lock().expect("txn lock").remove(&txn_id);
    }

    /// Make every watermark check fail with the given message.
    pub fn set_failure(&self, message: Option<String>) {
        *self.failure.lock().expect("txn lock") = message;
    }
}

impl TransactionManager for MemoryTxnManager {
    fn next_transaction_id(&self) -> TxnId {
        self.next_id.load(Ordering::SeqCst)
    }

    fn is_previous_transactions_finished(
        &self,
        watermark: TxnId,
        db_id: DbId,
        table_ids: &[TableId],
    ) -> StateResult<bool> {
        if let Some(message) = self.failure.lock().expect("txn lock").clone() {
            return Err(StateError::TxnManager(message));
        }
        let running = self.running.lock().expect("txn lock");
        let blocked = running.range(..watermark).any(|(_, txn)| {
            txn.db_id == db_id && txn.table_ids.iter().any(|t| table_ids.contains(t))
        });
        Ok(!blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_are_skipped() {
        let catalog = MemoryCatalog::new();
        catalog.reserve_ids_through(200_000);
        assert_eq!(catalog.next_id(), 200_001);
        catalog.reserve_ids_through(10);
        assert_eq!(catalog.next_id(), 200_002);
    }

    fn seeded_catalog() -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        catalog.add_database(Database { id: 1, name: "db1".to_string() });
        catalog.add_table(Table {
            id: 2,
            db_id: 1,
            name: "t".to_string(),
            state: TableState::Normal,
            keys_type: KeysType::Duplicate,
            colocate_group: None,
            location: None,
        });
        catalog.add_index(MaterializedIndex {
            id: 4,
            physical_partition_id: 3,
            schema_hash: 1,
            tablets: vec![],
        });
        let meta = TabletMeta { db_id: 1, table_id: 2, physical_partition_id: 3, index_id: 4 };
        catalog.add_tablet(
            meta,
            Tablet { id: 10, replicas: vec![Replica::new(11, 1, Some(100), 5)] },
        );
        catalog
    }

    #[test]
    fn lookups_respect_parent_ids() {
        let catalog = seeded_catalog();
        assert!(catalog.table(1, 2).is_some());
        assert!(catalog.table(9, 2).is_none());
        assert_eq!(catalog.index(3, 4).unwrap().tablets, vec![10]);
        assert!(catalog.index(99, 4).is_none());
        assert!(catalog.db_lock(1).is_some());
        assert!(catalog.db_lock(2).is_none());
    }

    #[test]
    fn replica_mutations() {
        let catalog = seeded_catalog();
        assert!(catalog.add_replica(10, Replica::new(12, 2, Some(200), 0)));
        // One replica per backend.
        assert!(!catalog.add_replica(10, Replica::new(13, 2, Some(200), 0)));
        assert!(catalog.update_replica(10, 12, &mut |r| r.version = 5));
        assert_eq!(catalog.tablet(10).unwrap().replica(12).unwrap().version, 5);
        assert_eq!(catalog.replicas_on_backend(2).len(), 1);
        assert_eq!(catalog.delete_replica(10, 2).map(|r| r.id), Some(12));
        assert!(catalog.delete_replica(10, 2).is_none());
    }

    #[test]
    fn recycle_bin_erase_soon() {
        let catalog = seeded_catalog();
        let obj = RecycledObject::Table(2);
        assert!(!catalog.erase_soon(obj, 0));
        catalog.recycle(obj, 1_000);
        assert!(catalog.erase_soon(obj, 0));
        catalog.recycle(obj, 2 * MIN_ERASE_LATENCY_MS);
        assert!(!catalog.erase_soon(obj, 0));
    }

    #[test]
    fn txn_watermark_blocks_until_earlier_txns_finish() {
        let txns = MemoryTxnManager::new(1);
        let t1 = txns.begin(1, vec![2]);
        let watermark = txns.next_transaction_id();
        assert!(!txns.is_previous_transactions_finished(watermark, 1, &[2]).unwrap());
        // Unrelated tables are not blocked.
        assert!(txns.is_previous_transactions_finished(watermark, 1, &[3]).unwrap());
        // Later transactions do not matter.
        let later = txns.begin(1, vec![2]);
        txns.finish(t1);
        assert!(txns.is_previous_transactions_finished(watermark, 1, &[2]).unwrap());
        txns.finish(later);
        txns.set_failure(Some("boom".to_string()));
        assert!(txns.is_previous_transactions_finished(watermark, 1, &[2]).is_err());
    }

    #[test]
    fn cluster_membership() {
        let cluster = MemoryCluster::new(vec![Backend {
            id: 1,
            host: "h1".to_string(),
            alive: true,
            decommissioned: false,
            location: None,
            disks: vec![],
        }]);
        assert_eq!(cluster.alive_backend_ids(), vec![1]);
        cluster.modify(1, |b| b.decommissioned = true);
        assert!(cluster.available_backends().is_empty());
        assert!(cluster.remove(1).is_some());
        assert!(cluster.backend(1).is_none());
    }
}
