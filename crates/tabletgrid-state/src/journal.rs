//! JournalStore — redb-backed edit log of scheduler decisions.
//!
//! Every replica mutation the scheduler commits (a clone that finished, an
//! empty replica that was created, a redundant replica that was dropped)
//! is appended as a [`ReplicaPersistInfo`]. Followers replay the records
//! in sequence order onto their own catalog; replay reproduces the
//! mutation without running any scheduling logic.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaOp {
    Add,
    Update,
    Delete,
}

/// One committed replica mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaPersistInfo {
    pub op: ReplicaOp,
    pub db_id: DbId,
    pub table_id: TableId,
    pub physical_partition_id: PartitionId,
    pub index_id: IndexId,
    pub tablet_id: TabletId,
    pub backend_id: BackendId,
    pub replica_id: ReplicaId,
    pub path_hash: Option<PathHash>,
    pub version: u64,
    pub data_size: u64,
    pub row_count: u64,
    pub last_failed_version: Option<u64>,
    pub last_success_version: u64,
}

impl ReplicaPersistInfo {
    pub fn new(op: ReplicaOp, meta: TabletMeta, tablet_id: TabletId, replica: &Replica) -> Self {
        Self {
            op,
            db_id: meta.db_id,
            table_id: meta.table_id,
            physical_partition_id: meta.physical_partition_id,
            index_id: meta.index_id,
            tablet_id,
            backend_id: replica.backend_id,
            replica_id: replica.id,
            path_hash: replica.path_hash,
            version: replica.version,
            data_size: replica.data_size,
            row_count: replica.row_count,
            last_failed_version: replica.last_failed_version,
            last_success_version: replica.last_success_version,
        }
    }

    fn copy_into(&self, replica: &mut Replica) {
        replica.path_hash = self.path_hash;
        replica.version = self.version;
        replica.data_size = self.data_size;
        replica.row_count = self.row_count;
        replica.last_failed_version = self.last_failed_version;
        replica.last_success_version = self.last_success_version;
        replica.state = ReplicaState::Normal;
    }

    /// Re-apply this record to a catalog. Returns false when the target
    /// tablet or replica no longer exists.
    pub fn apply(&self, catalog: &dyn Catalog) -> bool {
        match self.op {
            ReplicaOp::Add | ReplicaOp::Update => {
                let existing = catalog
                    .tablet(self.tablet_id)
                    .and_then(|t| t.replica_by_backend(self.backend_id).map(|r| r.id));
                match existing {
                    Some(replica_id) => {
                        catalog.update_replica(self.tablet_id, replica_id, &mut |r| self.copy_into(r))
                    }
                    None => {
                        let mut replica = Replica::new(self.replica_id, self.backend_id, None, 0);
                        self.copy_into(&mut replica);
                        catalog.add_replica(self.tablet_id, replica)
                    }
                }
            }
            ReplicaOp::Delete => catalog
                .delete_replica(self.tablet_id, self.backend_id)
                .is_some(),
        }
    }
}

/// Append-only sink for committed scheduler decisions.
pub trait EditLog: Send + Sync {
    fn log_replica(&self, info: &ReplicaPersistInfo) -> StateResult<()>;
}

/// Thread-safe journal backed by redb.
#[derive(Clone)]
pub struct JournalStore {
    db: Arc<Database>,
}

impl JournalStore {
    /// Open (or create) a persistent journal at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "journal opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory journal (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory journal opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(REPLICA_JOURNAL).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Append a record, returning its sequence number.
    pub fn append(&self, info: &ReplicaPersistInfo) -> StateResult<u64> {
        let value = serde_json::to_vec(info).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut table = txn.open_table(REPLICA_JOURNAL).map_err(map_err!(Table))?;
            let last = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(k, _)| k.value());
            seq = last.map_or(1, |s| s + 1);
            table
                .insert(seq, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(seq, tablet_id = info.tablet_id, op = ?info.op, "journal record appended");
        Ok(seq)
    }

    /// Records with a sequence number strictly greater than `after`.
    pub fn records_since(&self, after: u64) -> StateResult<Vec<(u64, ReplicaPersistInfo)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPLICA_JOURNAL).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range((after + 1)..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let info: ReplicaPersistInfo =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push((key.value(), info));
        }
        Ok(results)
    }

    pub fn len(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPLICA_JOURNAL).map_err(map_err!(Table))?;
        table.len().map_err(map_err!(Read))
    }

    pub fn is_empty(&self) -> StateResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Re-apply every record onto `catalog`, returning how many applied.
    pub fn replay(&self, catalog: &dyn Catalog) -> StateResult<usize> {
        let records = self.records_since(0)?;
        let total = records.len();
        let applied = records.iter().filter(|(_, info)| info.apply(catalog)).count();
        info!(total, applied, "journal replayed");
        Ok(applied)
    }
}

impl EditLog for JournalStore {
    fn log_replica(&self, info: &ReplicaPersistInfo) -> StateResult<()> {
        self.append(info).map(|_| ())
    }
}
