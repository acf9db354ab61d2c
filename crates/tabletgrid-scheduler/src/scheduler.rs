//! TabletScheduler — the scheduling engine.
//!
//! One tick of [`TabletScheduler::run_once`]:
//!
//! ```text
//! update slots ──▶ refresh load + priorities ──▶ schedule pending batch
//!                        (every stat interval)          │
//!                                                       ▼
//!         force clean ◀── select balance ◀── reap timed-out running
//! ```
//!
//! Contexts are popped from the pending queue under the queue lock and
//! processed outside it. Successful attempts move to `running` before
//! their commands reach the dispatcher; completion reports come back
//! through the `finish_*` callbacks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use tabletgrid_core::SchedulerConfig;
use tabletgrid_health::{ClassifyInput, Priority, TabletHealthStatus, classify, classify_colocate};
use tabletgrid_placement::ClusterLoadStatistic;
use tabletgrid_state::{
    ColocateGroupId, KeysType, PartitionId, PartitionState, RecycledObject, ReplicaOp,
    ReplicaPersistInfo, ReplicaState, TableState, TabletId,
};

use crate::context::{SchedState, SchedType, SchedulingContext, TabletBrief};
use crate::env::SchedEnv;
use crate::error::{SchedError, SchedResult, SchedStatus};
use crate::query::{AllowAll, PrivilegeChecker, ScheduleQuery};
use crate::queue::PendingQueue;
use crate::rebalancer::{BalanceOptions, LoadScoreRebalancer, Rebalancer};
use crate::slot::{BackendSlots, SlotInfo};
use crate::stat::{QueueGauges, SchedulerStat, StatSnapshot, render_prometheus};
use crate::task::{AgentTask, CloneTask, CreateReplicaTask, TaskResult, TaskStatus};

/// Cluster load is logged at most this often.
const LOAD_LOG_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    Added,
    AlreadyIn,
    LimitExceeded,
}

#[derive(Default)]
struct SchedQueues {
    pending: PendingQueue,
    running: HashMap<TabletId, SchedulingContext>,
    /// Ids of every pending or running context.
    all_ids: HashSet<TabletId>,
    history: VecDeque<SchedulingContext>,
}

#[derive(Default)]
struct TickState {
    last_stat_update_ms: u64,
    last_load_log_ms: u64,
    slot_num_per_path: i32,
}

pub struct TabletScheduler {
    pub(crate) env: SchedEnv,
    config: RwLock<SchedulerConfig>,
    queues: Mutex<SchedQueues>,
    pub(crate) slots: BackendSlots,
    load_statistic: RwLock<Option<Arc<ClusterLoadStatistic>>>,
    pub(crate) rebalancer: Arc<dyn Rebalancer>,
    privileges: Arc<dyn PrivilegeChecker>,
    pub(crate) stat: SchedulerStat,
    force_clean: AtomicBool,
    tick: Mutex<TickState>,
}

impl TabletScheduler {
    pub fn new(env: SchedEnv, config: SchedulerConfig, rebalancer: Arc<dyn Rebalancer>) -> Self {
        Self {
            env,
            config: RwLock::new(config),
            queues: Mutex::new(SchedQueues::default()),
            slots: BackendSlots::new(),
            load_statistic: RwLock::new(None),
            rebalancer,
            privileges: Arc::new(AllowAll),
            stat: SchedulerStat::default(),
            force_clean: AtomicBool::new(false),
            tick: Mutex::new(TickState::default()),
        }
    }

    /// Engine with the reference [`LoadScoreRebalancer`].
    pub fn with_load_score_rebalancer(env: SchedEnv, config: SchedulerConfig) -> Self {
        let rebalancer = Arc::new(LoadScoreRebalancer::new(env.clone(), BalanceOptions::from(&config)));
        Self::new(env, config, rebalancer)
    }

    pub fn with_privilege_checker(mut self, privileges: Arc<dyn PrivilegeChecker>) -> Self {
        self.privileges = privileges;
        self
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config.read().expect("config lock").clone()
    }

    /// Replace the configuration. A new per-path slot count is applied on
    /// the next tick.
    pub fn update_config(&self, config: SchedulerConfig) {
        self.rebalancer.update_config(&config);
        *self.config.write().expect("config lock") = config;
        info!("scheduler config updated");
    }

    pub fn slots(&self) -> &BackendSlots {
        &self.slots
    }

    pub fn rebalancer_name(&self) -> &'static str {
        self.rebalancer.name()
    }

    // ── Admission ──────────────────────────────────────────────

    pub fn add_tablet(&self, ctx: SchedulingContext, force: bool) -> AddResult {
        match self.try_add(ctx, force) {
            Ok(()) => AddResult::Added,
            Err((result, _)) => result,
        }
    }

    fn try_add(&self, ctx: SchedulingContext, force: bool) -> Result<(), (AddResult, SchedulingContext)> {
        let ceiling = self.config.read().expect("config lock").max_scheduling_tablets;
        let sched_type = ctx.sched_type;
        let tablet_id = ctx.tablet_id;
        let result = {
            let mut queues = self.queues.lock().expect("queue lock");
            Self::add_locked(&mut queues, ctx, force, ceiling)
        };
        match &result {
            Ok(()) => {
                let counter = match sched_type {
                    SchedType::Repair => &self.stat.unhealthy_tablet_added,
                    SchedType::Balance => &self.stat.balance_tablet_added,
                };
                SchedulerStat::inc(counter);
                debug!(tablet_id, %sched_type, "tablet added to scheduler");
            }
            Err((reason, _)) => {
                SchedulerStat::inc(&self.stat.tablet_not_added);
                debug!(tablet_id, ?reason, "tablet not added to scheduler");
            }
        }
        result
    }

    fn add_locked(
        queues: &mut SchedQueues,
        ctx: SchedulingContext,
        force: bool,
        ceiling: usize,
    ) -> Result<(), (AddResult, SchedulingContext)> {
        if queues.all_ids.contains(&ctx.tablet_id) {
            return Err((AddResult::AlreadyIn, ctx));
        }
        if ctx.sched_type != SchedType::Balance
            && !force
            && (queues.pending.len() > ceiling || queues.running.len() > ceiling)
        {
            return Err((AddResult::LimitExceeded, ctx));
        }
        queues.all_ids.insert(ctx.tablet_id);
        queues.pending.push(ctx);
        Ok(())
    }

    /// Admit while holding a database read lock. On a full queue the lock
    /// is released for `blocking_add_sleep_ms` and the add is retried until
    /// `max_wait` has passed.
    ///
    /// Returns whether the context was admitted, the total time waited in
    /// milliseconds and the re-acquired guard.
    pub fn blocking_add<'a>(
        &self,
        db_lock: &'a RwLock<()>,
        guard: RwLockReadGuard<'a, ()>,
        ctx: SchedulingContext,
        force: bool,
        max_wait: Duration,
    ) -> (bool, u64, RwLockReadGuard<'a, ()>) {
        let sleep_ms = self.config.read().expect("config lock").blocking_add_sleep_ms.max(1);
        let max_wait_ms = max_wait.as_millis() as u64;
        let mut guard = guard;
        let mut ctx = ctx;
        let mut waited_ms = 0;
        loop {
            match self.try_add(ctx, force) {
                Ok(()) => return (true, waited_ms, guard),
                Err((AddResult::LimitExceeded, back)) if waited_ms < max_wait_ms => {
                    ctx = back;
                    drop(guard);
                    std::thread::sleep(Duration::from_millis(sleep_ms));
                    waited_ms += sleep_ms;
                    guard = db_lock.read().expect("db lock");
                }
                Err(_) => return (false, waited_ms, guard),
            }
        }
    }

    /// Re-queue a retried context, bypassing the admission ceiling.
    fn add_back_to_pending(&self, ctx: SchedulingContext) {
        let ceiling = self.config.read().expect("config lock").max_scheduling_tablets;
        let mut queues = self.queues.lock().expect("queue lock");
        queues.all_ids.remove(&ctx.tablet_id);
        if let Err((reason, ctx)) = Self::add_locked(&mut queues, ctx, true, ceiling) {
            warn!(tablet_id = ctx.tablet_id, ?reason, "failed to re-queue tablet");
        }
    }

    // ── Control loop ───────────────────────────────────────────

    /// Tick on `schedule_interval_ms` until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(rebalancer = self.rebalancer.name(), "tablet scheduler started");
        loop {
            let interval = Duration::from_millis(self.config().schedule_interval_ms);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let scheduler = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || scheduler.run_once()).await {
                        tracing::error!(error = %e, "scheduling round failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("tablet scheduler shutting down");
                    break;
                }
            }
        }
    }

    pub fn run_once(&self) {
        if !self.update_working_slots() {
            debug!("some alive backends have no path hash yet, skip this round");
            return;
        }
        SchedulerStat::inc(&self.stat.schedule_rounds);
        let now = self.env.now_ms();

        let load_refreshed = self.update_cluster_load_and_priority(now);
        self.schedule_pending_tablets(now);
        self.handle_running_tablets(now);
        if load_refreshed {
            self.select_tablets_for_balance(now);
        }
        self.handle_force_clean(now);
    }

    /// Returns false when an alive backend has not reported every path.
    fn update_working_slots(&self) -> bool {
        let backends = self.env.cluster.backends();
        if backends.iter().any(|b| b.alive && !b.has_path_hash()) {
            return false;
        }
        let slot_num = self.config.read().expect("config lock").clamped_slot_num_per_path();
        {
            let mut tick = self.tick.lock().expect("tick lock");
            if tick.slot_num_per_path != 0 && tick.slot_num_per_path != slot_num {
                let delta = slot_num - tick.slot_num_per_path;
                self.slots.update_all(delta);
                info!(from = tick.slot_num_per_path, to = slot_num, "slot num per path changed");
            }
            tick.slot_num_per_path = slot_num;
        }
        self.slots.sync(&backends, slot_num);
        true
    }

    /// Rebuild the load snapshot and adjust priorities once per stat
    /// interval. Returns true when it ran.
    fn update_cluster_load_and_priority(&self, now: u64) -> bool {
        let config = self.config();
        {
            let tick = self.tick.lock().expect("tick lock");
            if tick.last_stat_update_ms != 0
                && now.saturating_sub(tick.last_stat_update_ms) < config.stat_update_interval_ms
            {
                return false;
            }
        }

        let statistic = Arc::new(ClusterLoadStatistic::build(
            self.env.cluster.as_ref(),
            self.env.catalog.as_ref(),
            now,
        ));
        {
            let mut tick = self.tick.lock().expect("tick lock");
            if tick.last_load_log_ms == 0 || now.saturating_sub(tick.last_load_log_ms) >= LOAD_LOG_INTERVAL_MS {
                info!(load = %statistic.brief(), "cluster load statistic");
                tick.last_load_log_ms = now;
            }
            tick.last_stat_update_ms = now;
        }
        *self.load_statistic.write().expect("statistic lock") = Some(Arc::clone(&statistic));
        self.rebalancer.update_load_statistic(statistic);

        let adjusted = self.adjust_priorities(now, &config);
        if adjusted > 0 {
            debug!(adjusted, "pending tablet priorities adjusted");
        }
        true
    }

    fn adjust_priorities(&self, now: u64, config: &SchedulerConfig) -> usize {
        let mut changed = 0;
        let mut queues = self.queues.lock().expect("queue lock");
        queues.pending.update_all(|ctx| {
            if ctx.adjust_priority(now, config.sched_failed_threshold, config.adjust_priority_interval_ms) {
                changed += 1;
            }
        });
        changed
    }

    fn is_erase_soon(&self, ctx: &SchedulingContext, now: u64) -> bool {
        let catalog = &self.env.catalog;
        if catalog.erase_soon(RecycledObject::Database(ctx.db_id), now)
            || catalog.erase_soon(RecycledObject::Table(ctx.table_id), now)
        {
            return true;
        }
        catalog
            .physical_partition(ctx.table_id, ctx.physical_partition_id)
            .is_some_and(|p| catalog.erase_soon(RecycledObject::Partition(p.parent_id), now))
    }

    fn schedule_pending_tablets(&self, now: u64) {
        let batch: Vec<SchedulingContext> = {
            let mut queues = self.queues.lock().expect("queue lock");
            let count = queues.pending.len();
            std::iter::from_fn(|| queues.pending.pop()).take(count).collect()
        };
        if batch.is_empty() {
            return;
        }

        let mut tasks = Vec::new();
        let mut scheduled = Vec::new();
        let mut retried = Vec::new();
        let mut deferred = Vec::new();

        for mut ctx in batch {
            if self.is_erase_soon(&ctx, now) {
                debug!(tablet_id = ctx.tablet_id, "tablet belongs to an object being erased, skip");
                deferred.push(ctx);
                continue;
            }
            SchedulerStat::inc(&self.stat.tablet_scheduled);
            ctx.err_msg = None;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.schedule_tablet(&mut ctx)));
            match outcome {
                Ok(Ok(task)) => {
                    SchedulerStat::inc(&self.stat.tablet_scheduled_succeeded);
                    match &task {
                        AgentTask::Clone(_) => SchedulerStat::inc(&self.stat.clone_task),
                        AgentTask::CreateReplica(_) => SchedulerStat::inc(&self.stat.create_replica_task),
                        AgentTask::DropReplica(_) => {}
                    }
                    debug!(tablet_id = ctx.tablet_id, task = task.kind(), "tablet scheduled");
                    tasks.push(task);
                    scheduled.push(ctx);
                }
                Ok(Err(e)) => {
                    if let Some(ctx) = self.handle_schedule_error(ctx, e) {
                        retried.push(ctx);
                    }
                }
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    self.finalize(ctx, SchedState::Unexpected, format!("scheduling panicked: {msg}"));
                }
            }
        }

        {
            let ceiling = self.config.read().expect("config lock").max_scheduling_tablets;
            let mut queues = self.queues.lock().expect("queue lock");
            for ctx in scheduled {
                queues.running.insert(ctx.tablet_id, ctx);
            }
            for ctx in retried {
                queues.all_ids.remove(&ctx.tablet_id);
                if let Err((reason, ctx)) = Self::add_locked(&mut queues, ctx, true, ceiling) {
                    warn!(tablet_id = ctx.tablet_id, ?reason, "failed to re-queue tablet");
                }
            }
            for ctx in deferred {
                queues.pending.push(ctx);
            }
        }

        if !tasks.is_empty() {
            debug!(count = tasks.len(), "submitting agent tasks");
            self.env.dispatcher.submit(tasks);
        }
    }

    /// Apply the retry policy of a failed attempt. Returns the context
    /// when it should be re-queued.
    fn handle_schedule_error(&self, mut ctx: SchedulingContext, e: SchedError) -> Option<SchedulingContext> {
        let msg = e.to_string();
        match e.status() {
            SchedStatus::ScheduleRetry => {
                ctx.failed_sched_counter += 1;
                let config = self.config.read().expect("config lock").clone();
                if ctx.sched_type == SchedType::Balance
                    && (config.disable_balance || ctx.failed_sched_counter > config.balance_max_failed_sched)
                {
                    SchedulerStat::inc(&self.stat.tablet_scheduled_discard);
                    self.finalize(ctx, SchedState::Cancelled, format!("give up balance: {msg}"));
                    return None;
                }
                SchedulerStat::inc(&self.stat.tablet_scheduled_failed);
                debug!(tablet_id = ctx.tablet_id, reason = %msg, "tablet scheduling will be retried");
                ctx.release_resource(&self.slots, self.env.catalog.as_ref(), false);
                ctx.state = SchedState::Pending;
                ctx.err_msg = Some(msg);
                Some(ctx)
            }
            SchedStatus::Finished => {
                SchedulerStat::inc(&self.stat.tablet_finished);
                self.finalize(ctx, SchedState::Finished, msg);
                None
            }
            SchedStatus::Unrecoverable => {
                SchedulerStat::inc(&self.stat.tablet_scheduled_discard);
                self.finalize(ctx, SchedState::Cancelled, msg);
                None
            }
            SchedStatus::Unexpected => {
                self.finalize(ctx, SchedState::Unexpected, msg);
                None
            }
        }
    }

    /// Release everything a context holds and move it to history.
    fn finalize(&self, mut ctx: SchedulingContext, state: SchedState, reason: String) {
        let catalog = self.env.catalog.as_ref();
        ctx.release_resource(&self.slots, catalog, false);
        if state != SchedState::Finished {
            ctx.reset_decommissioned_replica(catalog);
        }
        ctx.finalize(state, Some(reason), self.env.now_ms());
        self.rebalancer.on_finished(&ctx, state);

        match state {
            SchedState::Finished => info!(tablet_id = ctx.tablet_id, ctx = %ctx, "tablet schedule finished"),
            SchedState::Unexpected => {
                SchedulerStat::inc(&self.stat.unexpected_failure);
                warn!(tablet_id = ctx.tablet_id, ctx = %ctx, "tablet schedule failed unexpectedly");
            }
            _ => warn!(tablet_id = ctx.tablet_id, ctx = %ctx, "tablet schedule cancelled"),
        }

        let capacity = self.config.read().expect("config lock").history_capacity;
        let mut queues = self.queues.lock().expect("queue lock");
        queues.all_ids.remove(&ctx.tablet_id);
        queues.history.push_back(ctx);
        while queues.history.len() > capacity {
            queues.history.pop_front();
        }
    }

    // ── Per-context scheduling ─────────────────────────────────

    /// Re-read the catalog for one context and fill its snapshot fields.
    /// Returns the table and logical partition states.
    pub(crate) fn refresh_meta(&self, ctx: &mut SchedulingContext) -> SchedResult<(TableState, PartitionState, KeysType)> {
        let catalog = self.env.catalog.as_ref();
        catalog
            .database(ctx.db_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("db {} does not exist", ctx.db_id)))?;
        let table = catalog
            .table(ctx.db_id, ctx.table_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("table {} does not exist", ctx.table_id)))?;
        let physical = catalog
            .physical_partition(ctx.table_id, ctx.physical_partition_id)
            .ok_or_else(|| {
                SchedError::unrecoverable(format!(
                    "physical partition {} does not exist",
                    ctx.physical_partition_id
                ))
            })?;
        let partition = catalog
            .partition(ctx.table_id, physical.parent_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("partition {} does not exist", physical.parent_id)))?;
        let index = catalog
            .index(ctx.physical_partition_id, ctx.index_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("index {} does not exist", ctx.index_id)))?;
        let tablet = catalog
            .tablet(ctx.tablet_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("tablet {} does not exist", ctx.tablet_id)))?;
        let order_idx = index
            .tablet_order_idx(ctx.tablet_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("tablet {} does not exist in index", ctx.tablet_id)))?;

        ctx.partition_id = Some(partition.id);
        ctx.replication_num = partition.replication_num as usize;
        if ctx.storage_medium.is_none() {
            ctx.storage_medium = Some(partition.storage_medium);
        }
        ctx.schema_hash = index.schema_hash;
        ctx.tablet_order_idx = Some(order_idx);
        ctx.visible_version = physical.visible_version;
        ctx.committed_version = physical.committed_version;
        ctx.visible_txn_id = physical.visible_txn_id;
        ctx.required_location = table.location.clone();
        ctx.tablet_size = tablet.data_size();
        ctx.tablet = Some(tablet);

        ctx.colocate_group = table.colocate_group;
        ctx.colocate_backends = match table.colocate_group {
            Some(group) => Some(catalog.colocate_backends(group, order_idx).ok_or_else(|| {
                SchedError::unrecoverable(format!("colocate group {group} has no backend set for bucket {order_idx}"))
            })?),
            None => None,
        };
        Ok((table.state, partition.state, table.keys_type))
    }

    fn classify_ctx(&self, ctx: &SchedulingContext) -> SchedResult<(TabletHealthStatus, Priority)> {
        let Some(tablet) = ctx.tablet.as_ref() else {
            return Err(SchedError::Unexpected(format!("tablet {} was not loaded", ctx.tablet_id)));
        };
        let backends = self.env.cluster.backend_map();
        let input = ClassifyInput {
            replication_num: ctx.replication_num,
            visible_version: ctx.visible_version,
            location: ctx.required_location.as_ref(),
            backends: &backends,
        };
        Ok(match &ctx.colocate_backends {
            Some(set) => {
                let (status, _) = classify_colocate(tablet, set, &input);
                (status, Priority::High)
            }
            None => classify(tablet, &input),
        })
    }

    fn schedule_tablet(&self, ctx: &mut SchedulingContext) -> SchedResult<AgentTask> {
        let now = self.env.now_ms();
        ctx.set_last_sched_time(now);

        let db_lock = self
            .env
            .catalog
            .db_lock(ctx.db_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("db {} does not exist", ctx.db_id)))?;
        let (table_state, partition_state, status, priority) = {
            let _guard = db_lock.read().expect("db lock");
            let (table_state, partition_state, _) = self.refresh_meta(ctx)?;
            let (status, priority) = self.classify_ctx(ctx)?;
            (table_state, partition_state, status, priority)
        };

        if ctx.sched_type == SchedType::Balance && table_state != TableState::Normal {
            return Err(SchedError::unrecoverable("table's state is not NORMAL"));
        }
        if status != TabletHealthStatus::VersionIncomplete
            && (partition_state != PartitionState::Normal
                || !matches!(table_state, TableState::Normal | TableState::WaitingStable))
        {
            return Err(SchedError::unrecoverable(format!(
                "table is in alter process, but tablet status is {status}"
            )));
        }

        ctx.status = status;
        if status == TabletHealthStatus::Healthy && ctx.sched_type == SchedType::Repair {
            return Err(SchedError::finished("tablet is healthy"));
        }
        if ctx.sched_type == SchedType::Balance
            && status != TabletHealthStatus::Healthy
            && status != TabletHealthStatus::LocationMismatch
        {
            // The tablet needs repair first.
            self.rebalancer.on_finished(ctx, SchedState::Cancelled);
            ctx.release_resource(&self.slots, self.env.catalog.as_ref(), true);
            ctx.sched_type = SchedType::Repair;
            ctx.balance_move = None;
            ctx.set_orig_priority(priority);
            ctx.set_last_sched_time(now);
            debug!(tablet_id = ctx.tablet_id, %status, "balance tablet converted to repair");
        }

        let config = self.config.read().expect("config lock").clone();
        ctx.timeout_ms = SchedulingContext::estimate_timeout_ms(ctx.tablet_size, &config);

        match ctx.sched_type {
            SchedType::Repair => self.handle_tablet_by_status(ctx, &config),
            SchedType::Balance => self.rebalancer.create_balance_task(ctx, &self.slots),
        }
    }

    fn handle_tablet_by_status(&self, ctx: &mut SchedulingContext, config: &SchedulerConfig) -> SchedResult<AgentTask> {
        use TabletHealthStatus::*;
        let counter = match ctx.status {
            ReplicaMissing => &self.stat.replica_missing_err,
            VersionIncomplete | NeedFurtherRepair => &self.stat.replica_version_missing_err,
            ReplicaRelocating => &self.stat.replica_relocating_err,
            Redundant | ForceRedundant => &self.stat.replica_redundant_err,
            ColocateMismatch => &self.stat.replica_colocate_mismatch_err,
            ColocateRedundant => &self.stat.replica_colocate_redundant_err,
            DiskMigration => &self.stat.replica_disk_migration_err,
            LocationMismatch => &self.stat.replica_location_mismatch_err,
            Healthy => return Err(SchedError::finished("tablet is healthy")),
        };
        SchedulerStat::inc(counter);

        match ctx.status {
            ReplicaMissing => self.handle_replica_missing(ctx, config),
            VersionIncomplete | NeedFurtherRepair => self.handle_replica_version_incomplete(ctx),
            ReplicaRelocating | LocationMismatch => self.handle_replica_relocating(ctx, config),
            Redundant => self.handle_redundant_replica(ctx, false, config),
            ForceRedundant => self.handle_redundant_replica(ctx, true, config),
            ColocateMismatch => self.handle_colocate_mismatch(ctx, config),
            ColocateRedundant => self.handle_colocate_redundant(ctx, config),
            DiskMigration => self.handle_disk_migration(ctx, config),
            Healthy => Err(SchedError::finished("tablet is healthy")),
        }
    }

    fn handle_running_tablets(&self, now: u64) {
        let timed_out: Vec<SchedulingContext> = {
            let mut queues = self.queues.lock().expect("queue lock");
            let ids: Vec<TabletId> = queues
                .running
                .iter()
                .filter(|(_, ctx)| ctx.is_timeout(now))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| queues.running.remove(id)).collect()
        };
        for ctx in timed_out {
            SchedulerStat::inc(&self.stat.clone_task_timeout);
            self.finalize(ctx, SchedState::Cancelled, "timeout".to_string());
        }
    }

    fn select_tablets_for_balance(&self, now: u64) {
        if self.config.read().expect("config lock").disable_balance {
            debug!("balance is disabled");
            return;
        }
        if self.balance_tablets_num() > 0 {
            return;
        }
        let candidates = self.rebalancer.select_alternative_tablets();
        let quiet_ms = self.config.read().expect("config lock").primary_key_disk_schedule_time_sec * 1000;
        let mut added = 0;
        for ctx in candidates {
            if !self.is_schedulable(&ctx, now, quiet_ms) {
                self.rebalancer.on_finished(&ctx, SchedState::Cancelled);
                continue;
            }
            match self.try_add(ctx, false) {
                Ok(()) => added += 1,
                Err((_, ctx)) => self.rebalancer.on_finished(&ctx, SchedState::Cancelled),
            }
        }
        if added > 0 {
            info!(added, rebalancer = self.rebalancer.name(), "balance tablets added");
        }
    }

    /// False for same-node proposals on recently loaded primary-key tables.
    pub(crate) fn is_schedulable(&self, ctx: &SchedulingContext, now: u64, quiet_ms: u64) -> bool {
        let Some(mv) = ctx.balance_move else {
            return true;
        };
        if mv.src_backend != mv.dest_backend {
            return true;
        }
        let catalog = &self.env.catalog;
        match catalog.table(ctx.db_id, ctx.table_id) {
            Some(table) if table.keys_type != KeysType::Primary => true,
            Some(_) => catalog
                .physical_partition(ctx.table_id, ctx.physical_partition_id)
                .is_some_and(|p| now.saturating_sub(p.visible_version_time_ms) > quiet_ms),
            None => false,
        }
    }

    fn handle_force_clean(&self, now: u64) {
        if !self.force_clean.swap(false, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<SchedulingContext> = {
            let mut queues = self.queues.lock().expect("queue lock");
            let mut drained = queues.pending.drain();
            drained.extend(queues.running.drain().map(|(_, ctx)| ctx));
            drained
        };
        let count = drained.len();
        for ctx in drained {
            self.finalize(ctx, SchedState::Cancelled, "force clean".to_string());
        }
        info!(count, now, "scheduler queues force cleaned");
    }

    // ── Completion callbacks ───────────────────────────────────

    fn take_running(&self, tablet_id: TabletId, signature: u64) -> Option<SchedulingContext> {
        let mut queues = self.queues.lock().expect("queue lock");
        match queues.running.get(&tablet_id) {
            Some(ctx) if ctx.task_signature == Some(signature) => queues.running.remove(&tablet_id),
            Some(_) => {
                warn!(tablet_id, signature, "task report does not match the running context");
                None
            }
            None => {
                debug!(tablet_id, signature, "no running context for task report");
                None
            }
        }
    }

    pub fn finish_clone_task(&self, task: &CloneTask, result: &TaskResult) {
        let Some(mut ctx) = self.take_running(task.tablet_id, task.signature) else {
            return;
        };
        match self.apply_clone_result(&mut ctx, task, result) {
            Ok(()) => {
                SchedulerStat::inc(&self.stat.clone_task_succeeded);
                self.finalize(ctx, SchedState::Finished, "clone finished".to_string());
            }
            Err(e) => {
                let msg = e.to_string();
                match e.status() {
                    SchedStatus::ScheduleRetry => {
                        SchedulerStat::inc(&self.stat.clone_task_failed);
                        ctx.failed_running_counter += 1;
                        let threshold = self.config.read().expect("config lock").running_failed_threshold;
                        if ctx.failed_running_counter > threshold {
                            let reason = format!("{msg}, failed {} times", ctx.failed_running_counter);
                            self.finalize(ctx, SchedState::Cancelled, reason);
                        } else {
                            debug!(tablet_id = ctx.tablet_id, reason = %msg, "clone failed, back to pending");
                            ctx.release_resource(&self.slots, self.env.catalog.as_ref(), false);
                            ctx.state = SchedState::Pending;
                            ctx.err_msg = Some(msg);
                            self.add_back_to_pending(ctx);
                        }
                    }
                    SchedStatus::Finished => self.finalize(ctx, SchedState::Finished, msg),
                    SchedStatus::Unrecoverable => self.finalize(ctx, SchedState::Cancelled, msg),
                    SchedStatus::Unexpected => self.finalize(ctx, SchedState::Unexpected, msg),
                }
            }
        }
    }

    fn apply_clone_result(&self, ctx: &mut SchedulingContext, task: &CloneTask, result: &TaskResult) -> SchedResult<()> {
        if let TaskStatus::Failed(msg) = &result.status {
            return Err(SchedError::retry(format!("clone failed: {msg}")));
        }
        let reported = result
            .reported
            .ok_or_else(|| SchedError::retry("clone report carries no replica info"))?;

        let catalog = self.env.catalog.as_ref();
        let meta = catalog
            .tablet_meta(ctx.tablet_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("tablet {} does not exist", ctx.tablet_id)))?;
        let physical = catalog
            .physical_partition(ctx.table_id, ctx.physical_partition_id)
            .ok_or_else(|| SchedError::unrecoverable("partition does not exist"))?;
        let tablet = catalog
            .tablet(ctx.tablet_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("tablet {} does not exist", ctx.tablet_id)))?;
        let replica_id = tablet
            .replica_by_backend(task.dest_backend_id)
            .map(|r| r.id)
            .ok_or_else(|| SchedError::unrecoverable("clone replica does not exist"))?;
        if reported.version < task.visible_version {
            return Err(SchedError::retry(format!(
                "reported version {} is lower than visible version {}",
                reported.version, task.visible_version
            )));
        }

        // A flagged repair is the further repair; it clears the flag.
        let further_repair =
            ctx.status != TabletHealthStatus::NeedFurtherRepair && reported.version < ctx.committed_version;
        let mut updated = None;
        catalog.update_replica(ctx.tablet_id, replica_id, &mut |r| {
            r.version = reported.version;
            r.data_size = reported.data_size;
            r.row_count = reported.row_count;
            r.path_hash = Some(task.dest_path_hash);
            r.state = ReplicaState::Normal;
            r.last_success_version = reported.version;
            r.last_failed_version =
                (reported.version < physical.visible_version).then_some(physical.visible_version);
            r.need_further_repair = further_repair;
            updated = Some(r.clone());
        });
        let updated = updated.ok_or_else(|| SchedError::unrecoverable("clone replica does not exist"))?;

        let op = if ctx.clone_replica_id == Some(replica_id) { ReplicaOp::Add } else { ReplicaOp::Update };
        ctx.clone_replica_id = None;
        self.env
            .edit_log
            .log_replica(&ReplicaPersistInfo::new(op, meta, ctx.tablet_id, &updated))?;

        ctx.copy_size = result.copy_size;
        ctx.copy_time_ms = result.copy_time_ms;
        if let Some(slot) = self.slots.get(task.dest_backend_id) {
            slot.update_statistic(task.dest_path_hash, result.copy_size, result.copy_time_ms);
        }
        info!(
            tablet_id = ctx.tablet_id,
            replica_id,
            backend_id = task.dest_backend_id,
            version = reported.version,
            ?op,
            "clone replica committed"
        );
        Ok(())
    }

    pub fn finish_create_replica_task(&self, task: &CreateReplicaTask, result: &TaskResult) {
        let Some(mut ctx) = self.take_running(task.tablet_id, task.signature) else {
            return;
        };
        match self.apply_create_result(&mut ctx, task, result) {
            Ok(()) => self.finalize(ctx, SchedState::Finished, "empty replica created".to_string()),
            Err(SchedError::Unexpected(msg)) => {
                self.finalize(ctx, SchedState::Unexpected, format!("unexpected: {msg}"))
            }
            Err(e) => self.finalize(ctx, SchedState::Cancelled, e.to_string()),
        }
    }

    fn apply_create_result(
        &self,
        ctx: &mut SchedulingContext,
        task: &CreateReplicaTask,
        result: &TaskResult,
    ) -> SchedResult<()> {
        if let TaskStatus::Failed(msg) = &result.status {
            return Err(SchedError::unrecoverable(format!("create replica failed: {msg}")));
        }
        let catalog = self.env.catalog.as_ref();
        let meta = catalog
            .tablet_meta(ctx.tablet_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("tablet {} does not exist", ctx.tablet_id)))?;
        let replica_id = catalog
            .tablet(ctx.tablet_id)
            .and_then(|t| t.replica_by_backend(task.backend_id).map(|r| r.id))
            .ok_or_else(|| SchedError::unrecoverable("new replica does not exist"))?;

        let mut updated = None;
        catalog.update_replica(ctx.tablet_id, replica_id, &mut |r| {
            r.state = ReplicaState::Normal;
            r.version = task.version;
            r.last_success_version = task.version;
            r.last_failed_version = None;
            updated = Some(r.clone());
        });
        let updated = updated.ok_or_else(|| SchedError::unrecoverable("new replica does not exist"))?;
        ctx.clone_replica_id = None;
        self.env
            .edit_log
            .log_replica(&ReplicaPersistInfo::new(ReplicaOp::Add, meta, ctx.tablet_id, &updated))?;
        info!(tablet_id = ctx.tablet_id, replica_id, backend_id = task.backend_id, "empty replica committed");
        Ok(())
    }

    // ── Administration ─────────────────────────────────────────

    /// Raise matching pending contexts to VERY_HIGH. Returns how many
    /// were changed.
    pub fn change_tablets_priority_to_very_high(
        &self,
        db_id: u64,
        table_id: u64,
        partition_ids: &[PartitionId],
    ) -> usize {
        let mut changed = 0;
        let mut queues = self.queues.lock().expect("queue lock");
        queues.pending.update_all(|ctx| {
            let partition_match = partition_ids.contains(&ctx.physical_partition_id)
                || ctx.partition_id.is_some_and(|p| partition_ids.contains(&p));
            if ctx.db_id == db_id && ctx.table_id == table_id && partition_match {
                ctx.set_orig_priority(Priority::VeryHigh);
                changed += 1;
            }
        });
        changed
    }

    /// Cancel every pending and running context on the next tick.
    pub fn force_clean_sched_queue(&self) {
        self.force_clean.store(true, Ordering::SeqCst);
        info!("force clean of scheduler queues requested");
    }

    // ── Introspection ──────────────────────────────────────────

    pub fn pending_num(&self) -> usize {
        self.queues.lock().expect("queue lock").pending.len()
    }

    pub fn running_num(&self) -> usize {
        self.queues.lock().expect("queue lock").running.len()
    }

    pub fn history_num(&self) -> usize {
        self.queues.lock().expect("queue lock").history.len()
    }

    pub fn total_num(&self) -> usize {
        self.queues.lock().expect("queue lock").all_ids.len()
    }

    pub fn contains_tablet(&self, tablet_id: TabletId) -> bool {
        self.queues.lock().expect("queue lock").all_ids.contains(&tablet_id)
    }

    pub fn all_tablet_ids(&self) -> Vec<TabletId> {
        let mut ids: Vec<TabletId> = self.queues.lock().expect("queue lock").all_ids.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn pending_tablets_info(&self, limit: usize) -> Vec<TabletBrief> {
        let queues = self.queues.lock().expect("queue lock");
        queues.pending.sorted().into_iter().take(limit).map(|c| c.brief()).collect()
    }

    pub fn running_tablets_info(&self, limit: usize) -> Vec<TabletBrief> {
        let queues = self.queues.lock().expect("queue lock");
        let mut running: Vec<&SchedulingContext> = queues.running.values().collect();
        running.sort_by_key(|c| c.tablet_id);
        running.into_iter().take(limit).map(|c| c.brief()).collect()
    }

    /// Most recently finalized first.
    pub fn history_tablets_info(&self, limit: usize) -> Vec<TabletBrief> {
        let queues = self.queues.lock().expect("queue lock");
        queues.history.iter().rev().take(limit).map(|c| c.brief()).collect()
    }

    /// Running, then history, then pending contexts matching `query`.
    pub fn tablet_schedule(&self, query: &ScheduleQuery) -> Vec<TabletBrief> {
        let limit = query.limit.unwrap_or(usize::MAX);
        let queues = self.queues.lock().expect("queue lock");
        let mut running: Vec<&SchedulingContext> = queues.running.values().collect();
        running.sort_by_key(|c| c.tablet_id);
        running
            .into_iter()
            .chain(queues.history.iter().rev())
            .chain(queues.pending.sorted())
            .filter(|c| query.matches(c, self.privileges.as_ref()))
            .take(limit)
            .map(|c| c.brief())
            .collect()
    }

    /// Pending or running BALANCE contexts.
    pub fn balance_tablets_num(&self) -> usize {
        let queues = self.queues.lock().expect("queue lock");
        queues
            .pending
            .iter()
            .chain(queues.running.values())
            .filter(|c| c.sched_type == SchedType::Balance)
            .count()
    }

    pub fn tablets_in_sched_by_colocate_group(&self) -> HashMap<ColocateGroupId, usize> {
        let queues = self.queues.lock().expect("queue lock");
        let mut counts = HashMap::new();
        for group in queues
            .pending
            .iter()
            .chain(queues.running.values())
            .filter_map(|c| c.colocate_group)
        {
            *counts.entry(group).or_insert(0) += 1;
        }
        counts
    }

    pub fn slots_info(&self) -> Vec<SlotInfo> {
        self.slots.slot_info()
    }

    pub fn load_statistic(&self) -> Option<Arc<ClusterLoadStatistic>> {
        self.load_statistic.read().expect("statistic lock").clone()
    }

    pub fn cluster_load_brief(&self) -> Option<String> {
        self.load_statistic().map(|s| s.brief())
    }

    pub fn stat_snapshot(&self) -> StatSnapshot {
        self.stat.snapshot()
    }

    pub fn queue_gauges(&self) -> QueueGauges {
        let balance = self.balance_tablets_num();
        let queues = self.queues.lock().expect("queue lock");
        QueueGauges {
            pending: queues.pending.len(),
            running: queues.running.len(),
            history: queues.history.len(),
            balance,
        }
    }

    pub fn render_prometheus(&self) -> String {
        render_prometheus(&self.stat_snapshot(), &self.queue_gauges())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
