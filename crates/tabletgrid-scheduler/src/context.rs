//! SchedulingContext — the unit of scheduling work.
//!
//! One context tracks one tablet from admission to its terminal state:
//! the catalog snapshot taken at the start of each attempt, the chosen
//! source and destination, the slots and catalog objects it holds, and
//! the counters and timestamps that drive priority and timeout handling.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use tabletgrid_core::SchedulerConfig;
use tabletgrid_health::{Priority, TabletHealthStatus};
use tabletgrid_state::{
    Backend, BackendId, Catalog, ColocateGroupId, DbId, IndexId, LocationRequirement,
    PartitionId, PathHash, Replica, ReplicaId, ReplicaState, StorageMedium, TableId, Tablet,
    TabletId, TabletMeta, TxnId,
};

use crate::error::{SchedError, SchedResult};
use crate::slot::BackendSlots;
use crate::task::{AgentTask, CloneTask, CreateReplicaTask, TabletSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedType {
    Repair,
    Balance,
}

impl fmt::Display for SchedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedType::Repair => "REPAIR",
            SchedType::Balance => "BALANCE",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedState {
    Pending,
    Running,
    Finished,
    Cancelled,
    Unexpected,
}

impl SchedState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SchedState::Finished | SchedState::Cancelled | SchedState::Unexpected)
    }
}

impl fmt::Display for SchedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedState::Pending => "PENDING",
            SchedState::Running => "RUNNING",
            SchedState::Finished => "FINISHED",
            SchedState::Cancelled => "CANCELLED",
            SchedState::Unexpected => "UNEXPECTED",
        })
    }
}

/// A backend path chosen as clone source or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub backend_id: BackendId,
    pub path_hash: PathHash,
}

/// Move proposed by a balance strategy before slots are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceMove {
    pub src_backend: BackendId,
    pub src_replica: ReplicaId,
    pub dest_backend: BackendId,
}

#[derive(Debug, Clone)]
pub struct SchedulingContext {
    pub(crate) sched_type: SchedType,
    pub(crate) state: SchedState,
    pub(crate) status: TabletHealthStatus,
    pub(crate) orig_priority: Priority,
    pub(crate) dynamic_priority: Priority,

    pub(crate) db_id: DbId,
    pub(crate) table_id: TableId,
    pub(crate) physical_partition_id: PartitionId,
    /// Logical partition, known once the catalog has been read.
    pub(crate) partition_id: Option<PartitionId>,
    pub(crate) index_id: IndexId,
    pub(crate) tablet_id: TabletId,

    pub(crate) schema_hash: u32,
    pub(crate) storage_medium: Option<StorageMedium>,
    pub(crate) replication_num: usize,
    pub(crate) required_location: Option<LocationRequirement>,
    pub(crate) colocate_group: Option<ColocateGroupId>,
    pub(crate) colocate_backends: Option<BTreeSet<BackendId>>,
    pub(crate) tablet_order_idx: Option<usize>,

    pub(crate) tablet: Option<Tablet>,
    pub(crate) tablet_size: u64,
    pub(crate) visible_version: u64,
    pub(crate) committed_version: u64,
    pub(crate) visible_txn_id: TxnId,

    pub(crate) src: Option<Endpoint>,
    pub(crate) src_replica_id: Option<ReplicaId>,
    pub(crate) dest: Option<Endpoint>,
    pub(crate) balance_move: Option<BalanceMove>,
    /// CLONE-state replica added by this context, removed on release.
    pub(crate) clone_replica_id: Option<ReplicaId>,
    /// Replica this context stamped DECOMMISSION.
    pub(crate) decommissioned_replica: Option<ReplicaId>,
    pub(crate) task_signature: Option<u64>,

    pub(crate) failed_sched_counter: u32,
    pub(crate) failed_running_counter: u32,

    pub(crate) create_time_ms: u64,
    pub(crate) last_sched_time_ms: u64,
    pub(crate) last_visited_time_ms: u64,
    pub(crate) finished_time_ms: u64,
    pub(crate) last_adjust_prio_time_ms: u64,
    pub(crate) timeout_ms: u64,

    pub(crate) copy_size: u64,
    pub(crate) copy_time_ms: u64,
    pub(crate) err_msg: Option<String>,
}

impl SchedulingContext {
    pub fn new(sched_type: SchedType, meta: TabletMeta, tablet_id: TabletId, now_ms: u64) -> Self {
        Self {
            sched_type,
            state: SchedState::Pending,
            status: TabletHealthStatus::Healthy,
            orig_priority: Priority::Normal,
            dynamic_priority: Priority::Normal,
            db_id: meta.db_id,
            table_id: meta.table_id,
            physical_partition_id: meta.physical_partition_id,
            partition_id: None,
            index_id: meta.index_id,
            tablet_id,
            schema_hash: 0,
            storage_medium: None,
            replication_num: 0,
            required_location: None,
            colocate_group: None,
            colocate_backends: None,
            tablet_order_idx: None,
            tablet: None,
            tablet_size: 0,
            visible_version: 0,
            committed_version: 0,
            visible_txn_id: 0,
            src: None,
            src_replica_id: None,
            dest: None,
            balance_move: None,
            clone_replica_id: None,
            decommissioned_replica: None,
            task_signature: None,
            failed_sched_counter: 0,
            failed_running_counter: 0,
            create_time_ms: now_ms,
            last_sched_time_ms: 0,
            last_visited_time_ms: 0,
            finished_time_ms: 0,
            last_adjust_prio_time_ms: 0,
            timeout_ms: 0,
            copy_size: 0,
            copy_time_ms: 0,
            err_msg: None,
        }
    }

    /// Repair context as admitted by the health checker.
    pub fn repair(
        meta: TabletMeta,
        tablet_id: TabletId,
        status: TabletHealthStatus,
        priority: Priority,
        now_ms: u64,
    ) -> Self {
        let mut ctx = Self::new(SchedType::Repair, meta, tablet_id, now_ms);
        ctx.status = status;
        ctx.set_orig_priority(priority);
        ctx
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn db_id(&self) -> DbId {
        self.db_id
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn physical_partition_id(&self) -> PartitionId {
        self.physical_partition_id
    }

    pub fn partition_id(&self) -> Option<PartitionId> {
        self.partition_id
    }

    pub fn sched_type(&self) -> SchedType {
        self.sched_type
    }

    pub fn state(&self) -> SchedState {
        self.state
    }

    pub fn status(&self) -> TabletHealthStatus {
        self.status
    }

    pub fn orig_priority(&self) -> Priority {
        self.orig_priority
    }

    pub fn dynamic_priority(&self) -> Priority {
        self.dynamic_priority
    }

    pub fn colocate_group(&self) -> Option<ColocateGroupId> {
        self.colocate_group
    }

    pub fn src(&self) -> Option<Endpoint> {
        self.src
    }

    pub fn dest(&self) -> Option<Endpoint> {
        self.dest
    }

    pub fn balance_move(&self) -> Option<BalanceMove> {
        self.balance_move
    }

    pub fn tablet(&self) -> Option<&Tablet> {
        self.tablet.as_ref()
    }

    pub fn tablet_size(&self) -> u64 {
        self.tablet_size
    }

    pub fn storage_medium(&self) -> Option<StorageMedium> {
        self.storage_medium
    }

    pub fn visible_version(&self) -> u64 {
        self.visible_version
    }

    pub fn err_msg(&self) -> Option<&str> {
        self.err_msg.as_deref()
    }

    pub fn failed_sched_counter(&self) -> u32 {
        self.failed_sched_counter
    }

    pub fn failed_running_counter(&self) -> u32 {
        self.failed_running_counter
    }

    pub fn last_visited_time_ms(&self) -> u64 {
        self.last_visited_time_ms
    }

    pub fn task_signature(&self) -> Option<u64> {
        self.task_signature
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn decommissioned_replica(&self) -> Option<ReplicaId> {
        self.decommissioned_replica
    }

    pub fn meta(&self) -> TabletMeta {
        TabletMeta {
            db_id: self.db_id,
            table_id: self.table_id,
            physical_partition_id: self.physical_partition_id,
            index_id: self.index_id,
        }
    }

    // ── Mutators ───────────────────────────────────────────────

    /// Sets both the original and the current priority.
    pub fn set_orig_priority(&mut self, priority: Priority) {
        self.orig_priority = priority;
        self.dynamic_priority = priority;
    }

    pub fn set_balance_move(&mut self, mv: BalanceMove) {
        self.balance_move = Some(mv);
    }

    pub fn set_colocate_group(&mut self, group: ColocateGroupId) {
        self.colocate_group = Some(group);
    }

    pub fn set_storage_medium(&mut self, medium: StorageMedium) {
        self.storage_medium = Some(medium);
    }

    pub fn set_src(&mut self, backend_id: BackendId, path_hash: PathHash, replica_id: ReplicaId) {
        self.src = Some(Endpoint { backend_id, path_hash });
        self.src_replica_id = Some(replica_id);
    }

    pub fn set_dest(&mut self, backend_id: BackendId, path_hash: PathHash) {
        self.dest = Some(Endpoint { backend_id, path_hash });
    }

    pub(crate) fn set_last_sched_time(&mut self, now_ms: u64) {
        self.last_sched_time_ms = now_ms;
        self.last_visited_time_ms = now_ms;
    }

    /// Clone timeout for the snapshotted tablet size.
    pub fn estimate_timeout_ms(tablet_size: u64, config: &SchedulerConfig) -> u64 {
        let secs = tablet_size / config.clone_bytes_per_sec.max(1);
        secs.clamp(config.min_clone_task_timeout_sec, config.max_clone_task_timeout_sec) * 1000
    }

    pub fn is_timeout(&self, now_ms: u64) -> bool {
        self.state == SchedState::Running
            && now_ms.saturating_sub(self.last_sched_time_ms) > self.timeout_ms
    }

    /// Dynamic priority adjustment. Returns true when the priority changed.
    ///
    /// The first call only records the time. Later calls run at most once
    /// per `interval_ms`: repeated failures downgrade, a long wait without
    /// being visited upgrades up to the original priority.
    pub fn adjust_priority(&mut self, now_ms: u64, failed_threshold: u32, interval_ms: u64) -> bool {
        if self.last_adjust_prio_time_ms == 0 {
            self.last_adjust_prio_time_ms = now_ms;
            return false;
        }
        if now_ms.saturating_sub(self.last_adjust_prio_time_ms) < interval_ms {
            return false;
        }
        self.last_adjust_prio_time_ms = now_ms;

        let before = self.dynamic_priority;
        if self.failed_sched_counter > failed_threshold {
            self.failed_sched_counter = 0;
            self.dynamic_priority = before.downgrade();
        } else if now_ms.saturating_sub(self.last_visited_time_ms) > interval_ms {
            self.dynamic_priority = before.upgrade_toward(self.orig_priority);
        }
        self.dynamic_priority != before
    }

    // ── Source / destination choice ────────────────────────────

    fn snapshot(&self) -> SchedResult<&Tablet> {
        self.tablet
            .as_ref()
            .ok_or_else(|| SchedError::Unexpected(format!("tablet {} was not loaded", self.tablet_id)))
    }

    /// Pick a healthy replica to copy from and take a slot on its path.
    pub(crate) fn choose_src_replica(
        &mut self,
        slots: &BackendSlots,
        backends: &HashMap<BackendId, Backend>,
    ) -> SchedResult<()> {
        let dest_backend = self.dest.map(|d| d.backend_id);
        let mut candidates: Vec<(bool, Replica)> = self
            .snapshot()?
            .replicas
            .iter()
            .filter(|r| Some(r.backend_id) != dest_backend)
            .filter(|r| !r.bad && r.state != ReplicaState::Clone && r.path_hash.is_some())
            .filter(|r| r.is_version_complete(self.visible_version))
            .filter_map(|r| {
                let backend = backends.get(&r.backend_id)?;
                backend.alive.then(|| (backend.is_available(), r.clone()))
            })
            .collect();
        if candidates.is_empty() {
            return Err(SchedError::unrecoverable("unable to find source replica"));
        }
        // Available backends first; decommissioning ones only as fallback.
        candidates.sort_by_key(|(available, r)| (!*available, r.id));

        for (_, replica) in candidates {
            let Some(path_hash) = replica.path_hash else {
                continue;
            };
            if slots.take(replica.backend_id, path_hash).is_some() {
                self.set_src(replica.backend_id, path_hash, replica.id);
                return Ok(());
            }
        }
        Err(SchedError::retry("unable to find source slot"))
    }

    /// Pick the replica to bring up to date. Returns true when the chosen
    /// replica was flagged for further repair.
    pub(crate) fn choose_dest_for_version_incomplete(
        &mut self,
        slots: &BackendSlots,
        backends: &HashMap<BackendId, Backend>,
    ) -> SchedResult<bool> {
        let visible = self.visible_version;
        let mut candidates: Vec<&Replica> = self
            .snapshot()?
            .replicas
            .iter()
            .filter(|r| backends.get(&r.backend_id).is_some_and(|b| b.alive))
            .filter(|r| {
                !r.bad && r.state != ReplicaState::Clone && r.state != ReplicaState::Decommission
            })
            .filter(|r| !r.is_version_complete(visible) || r.need_further_repair)
            .collect();
        candidates.sort_by_key(|r| {
            (
                !r.need_further_repair,
                r.version,
                r.last_failed_version.unwrap_or(0),
                r.id,
            )
        });
        let Some(chosen) = candidates.first().map(|r| (*r).clone()) else {
            return Err(SchedError::unrecoverable("unable to choose dest replica"));
        };
        let Some(path_hash) = chosen.path_hash else {
            return Err(SchedError::unrecoverable("dest replica has no path hash"));
        };
        if slots.take(chosen.backend_id, path_hash).is_none() {
            return Err(SchedError::retry("dest replica path is busy"));
        }
        self.set_dest(chosen.backend_id, path_hash);
        Ok(chosen.need_further_repair)
    }

    // ── Task creation ──────────────────────────────────────────

    /// Create the catalog-side CLONE replica if the destination holds none
    /// yet, then build the clone command.
    pub(crate) fn create_clone_replica_and_task(
        &mut self,
        catalog: &dyn Catalog,
        backends: &HashMap<BackendId, Backend>,
    ) -> SchedResult<AgentTask> {
        let (Some(src), Some(dest)) = (self.src, self.dest) else {
            return Err(SchedError::Unexpected("source or destination not chosen".to_string()));
        };
        let Some(src_backend) = backends.get(&src.backend_id) else {
            return Err(SchedError::unrecoverable(format!(
                "src backend {} does not exist",
                src.backend_id
            )));
        };
        let has_dest_replica = self.snapshot()?.replica_by_backend(dest.backend_id).is_some();
        if !has_dest_replica {
            let replica_id = catalog.next_id();
            let mut replica = Replica::new(replica_id, dest.backend_id, Some(dest.path_hash), 0);
            replica.state = ReplicaState::Clone;
            replica.last_success_version = 0;
            if !catalog.add_replica(self.tablet_id, replica.clone()) {
                return Err(SchedError::unrecoverable("failed to add clone replica"));
            }
            self.clone_replica_id = Some(replica_id);
            if let Some(tablet) = self.tablet.as_mut() {
                tablet.replicas.push(replica);
            }
        }

        let signature = catalog.next_id();
        let task = CloneTask {
            signature,
            db_id: self.db_id,
            table_id: self.table_id,
            physical_partition_id: self.physical_partition_id,
            index_id: self.index_id,
            tablet_id: self.tablet_id,
            schema_hash: self.schema_hash,
            storage_medium: self.storage_medium.unwrap_or(StorageMedium::Hdd),
            dest_backend_id: dest.backend_id,
            dest_path_hash: dest.path_hash,
            sources: vec![TabletSource {
                backend_id: src.backend_id,
                host: src_backend.host.clone(),
                path_hash: src.path_hash,
            }],
            visible_version: self.visible_version,
            timeout_ms: self.timeout_ms,
        };
        self.task_signature = Some(signature);
        self.state = SchedState::Running;
        Ok(AgentTask::Clone(task))
    }

    /// Add an empty CLONE replica at the visible version and build the
    /// create command for it.
    pub(crate) fn create_empty_replica_and_task(&mut self, catalog: &dyn Catalog) -> SchedResult<AgentTask> {
        let Some(dest) = self.dest else {
            return Err(SchedError::Unexpected("destination not chosen".to_string()));
        };
        let replica_id = catalog.next_id();
        let mut replica =
            Replica::new(replica_id, dest.backend_id, Some(dest.path_hash), self.visible_version);
        replica.state = ReplicaState::Clone;
        if !catalog.add_replica(self.tablet_id, replica) {
            return Err(SchedError::unrecoverable("failed to add empty replica"));
        }
        self.clone_replica_id = Some(replica_id);

        let signature = catalog.next_id();
        let task = CreateReplicaTask {
            signature,
            db_id: self.db_id,
            table_id: self.table_id,
            physical_partition_id: self.physical_partition_id,
            index_id: self.index_id,
            tablet_id: self.tablet_id,
            schema_hash: self.schema_hash,
            storage_medium: self.storage_medium.unwrap_or(StorageMedium::Hdd),
            backend_id: dest.backend_id,
            path_hash: dest.path_hash,
            version: self.visible_version,
        };
        self.task_signature = Some(signature);
        self.state = SchedState::Running;
        Ok(AgentTask::CreateReplica(task))
    }

    // ── Resource release ───────────────────────────────────────

    /// Give back slots and catalog objects held for the current attempt.
    ///
    /// `reserve_tablet` keeps the tablet snapshot for a follow-up handler
    /// in the same pass.
    pub(crate) fn release_resource(&mut self, slots: &BackendSlots, catalog: &dyn Catalog, reserve_tablet: bool) {
        if let Some(src) = self.src.take() {
            slots.free(src.backend_id, src.path_hash);
        }
        if let Some(dest) = self.dest.take() {
            slots.free(dest.backend_id, dest.path_hash);
            if let Some(replica_id) = self.clone_replica_id.take() {
                let still_clone = catalog
                    .tablet(self.tablet_id)
                    .and_then(|t| t.replica(replica_id).map(|r| r.state == ReplicaState::Clone))
                    .unwrap_or(false);
                if still_clone {
                    catalog.delete_replica(self.tablet_id, dest.backend_id);
                }
            }
        }
        self.src_replica_id = None;
        self.task_signature = None;
        if !reserve_tablet {
            self.tablet = None;
        }
    }

    /// Undo a DECOMMISSION stamp this context placed.
    pub(crate) fn reset_decommissioned_replica(&mut self, catalog: &dyn Catalog) {
        if let Some(replica_id) = self.decommissioned_replica.take() {
            catalog.update_replica(self.tablet_id, replica_id, &mut |r| {
                if r.state == ReplicaState::Decommission {
                    r.state = ReplicaState::Normal;
                    r.watermark_txn_id = None;
                }
            });
        }
    }

    pub(crate) fn finalize(&mut self, state: SchedState, reason: Option<String>, now_ms: u64) {
        self.state = state;
        self.finished_time_ms = now_ms;
        if reason.is_some() {
            self.err_msg = reason;
        }
    }

    // ── Introspection ──────────────────────────────────────────

    pub fn brief(&self) -> TabletBrief {
        let copy_secs = self.copy_time_ms / 1000;
        TabletBrief {
            tablet_id: self.tablet_id,
            sched_type: self.sched_type,
            status: self.status,
            state: self.state,
            orig_priority: self.orig_priority,
            dynamic_priority: self.dynamic_priority,
            db_id: self.db_id,
            table_id: self.table_id,
            partition_id: self.partition_id.unwrap_or(self.physical_partition_id),
            physical_partition_id: self.physical_partition_id,
            index_id: self.index_id,
            colocate_group: self.colocate_group,
            storage_medium: self.storage_medium,
            src_backend: self.src.map(|s| s.backend_id),
            src_path: self.src.map(|s| s.path_hash),
            dest_backend: self
                .dest
                .map(|d| d.backend_id)
                .or(self.balance_move.map(|m| m.dest_backend)),
            dest_path: self.dest.map(|d| d.path_hash),
            timeout_ms: self.timeout_ms,
            create_time_ms: self.create_time_ms,
            last_sched_time_ms: self.last_sched_time_ms,
            last_visited_time_ms: self.last_visited_time_ms,
            finished_time_ms: self.finished_time_ms,
            copy_size: self.copy_size,
            copy_time_ms: self.copy_time_ms,
            copy_rate: if copy_secs == 0 { 0 } else { self.copy_size / copy_secs },
            failed_sched: self.failed_sched_counter,
            failed_running: self.failed_running_counter,
            visible_version: self.visible_version,
            committed_version: self.committed_version,
            err_msg: self.err_msg.clone(),
        }
    }
}

impl fmt::Display for SchedulingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tablet id: {}, type: {}, status: {}, state: {}, priority: {}/{}",
            self.tablet_id,
            self.sched_type,
            self.status,
            self.state,
            self.orig_priority,
            self.dynamic_priority
        )?;
        if let Some(src) = self.src {
            write!(f, ", from backend: {} path: {}", src.backend_id, src.path_hash)?;
        }
        if let Some(dest) = self.dest {
            write!(f, ", to backend: {} path: {}", dest.backend_id, dest.path_hash)?;
        }
        if let Some(tablet) = &self.tablet {
            write!(f, ", replicas: {}", tablet.replica_infos())?;
        }
        if let Some(msg) = &self.err_msg {
            write!(f, ", err: {msg}")?;
        }
        Ok(())
    }
}

/// Serializable view of a context for introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletBrief {
    pub tablet_id: TabletId,
    pub sched_type: SchedType,
    pub status: TabletHealthStatus,
    pub state: SchedState,
    pub orig_priority: Priority,
    pub dynamic_priority: Priority,
    pub db_id: DbId,
    pub table_id: TableId,
    pub partition_id: PartitionId,
    pub physical_partition_id: PartitionId,
    pub index_id: IndexId,
    pub colocate_group: Option<ColocateGroupId>,
    pub storage_medium: Option<StorageMedium>,
    pub src_backend: Option<BackendId>,
    pub src_path: Option<PathHash>,
    pub dest_backend: Option<BackendId>,
    pub dest_path: Option<PathHash>,
    pub timeout_ms: u64,
    pub create_time_ms: u64,
    pub last_sched_time_ms: u64,
    pub last_visited_time_ms: u64,
    pub finished_time_ms: u64,
    pub copy_size: u64,
    pub copy_time_ms: u64,
    /// Bytes per second of the finished copy.
    pub copy_rate: u64,
    pub failed_sched: u32,
    pub failed_running: u32,
    pub visible_version: u64,
    pub committed_version: u64,
    pub err_msg: Option<String>,
}
