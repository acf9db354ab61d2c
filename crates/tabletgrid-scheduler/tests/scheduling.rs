//! End-to-end scheduling scenarios over the in-memory catalog.
//!
//! Each test builds a small cluster, admits contexts, drives the engine
//! tick by tick with a manual clock and plays the agent's part by calling
//! the completion callbacks.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tabletgrid_core::{ManualClock, SchedulerConfig};
use tabletgrid_health::{Priority, TabletHealthStatus};
use tabletgrid_placement::ClusterLoadStatistic;
use tabletgrid_scheduler::{
    AddResult, AgentTask, BackendSlots, BalanceOptions, CloneTask, LoadScoreRebalancer, Rebalancer, ReportedReplica, RecordingDispatcher,
    SchedEnv, SchedResult, SchedState, SchedType, ScheduleQuery, SchedulingContext, TabletScheduler,
    TaskResult,
};
use tabletgrid_state::{
    Backend, BackendId, Catalog, Database, DiskInfo, DiskState, JournalStore, KeysType,
    MaterializedIndex, MemoryCatalog, MemoryCluster, MemoryTxnManager, Partition, PartitionState,
    PhysicalPartition, RecycledObject, Replica, ReplicaId, ReplicaOp, ReplicaState, StorageMedium,
    Table, TableState, Tablet, TabletId, TabletMeta,
};

const GB: u64 = 1024 * 1024 * 1024;
const DB: u64 = 1;
const TABLE: u64 = 10;
const PARTITION: u64 = 20;
const PHYSICAL: u64 = 30;
const INDEX: u64 = 40;
const VISIBLE: u64 = 5;

fn meta() -> TabletMeta {
    TabletMeta { db_id: DB, table_id: TABLE, physical_partition_id: PHYSICAL, index_id: INDEX }
}

fn disk(path_hash: u64, used_gb: u64) -> DiskInfo {
    DiskInfo {
        root_path: format!("/data{path_hash}"),
        path_hash: Some(path_hash),
        medium: StorageMedium::Hdd,
        state: DiskState::Online,
        total_capacity_bytes: 100 * GB,
        available_capacity_bytes: (100 - used_gb) * GB,
        data_used_capacity_bytes: used_gb * GB,
    }
}

fn backend(id: BackendId, used_gb: u64) -> Backend {
    Backend {
        id,
        host: format!("host{id}"),
        alive: true,
        decommissioned: false,
        location: None,
        disks: vec![disk(id * 10, used_gb)],
    }
}

fn table(colocate_group: Option<u64>) -> Table {
    Table {
        id: TABLE,
        db_id: DB,
        name: "orders".to_string(),
        state: TableState::Normal,
        keys_type: KeysType::Duplicate,
        colocate_group,
        location: None,
    }
}

/// Repair work only; balance is exercised separately.
fn repair_config() -> SchedulerConfig {
    SchedulerConfig {
        stat_update_interval_ms: 0,
        disable_balance: true,
        ..SchedulerConfig::default()
    }
}

struct Harness {
    catalog: Arc<MemoryCatalog>,
    cluster: Arc<MemoryCluster>,
    txns: Arc<MemoryTxnManager>,
    journal: JournalStore,
    dispatcher: Arc<RecordingDispatcher>,
    clock: Arc<ManualClock>,
    scheduler: Arc<TabletScheduler>,
}

impl Harness {
    fn new(config: SchedulerConfig, replication_num: u16) -> Self {
        Self::build(config, replication_num, (1..=4).map(|id| backend(id, 10)).collect(), |env, config| {
            TabletScheduler::with_load_score_rebalancer(env, config)
        })
    }

    fn build(
        config: SchedulerConfig,
        replication_num: u16,
        backends: Vec<Backend>,
        make: impl FnOnce(SchedEnv, SchedulerConfig) -> TabletScheduler,
    ) -> Self {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_database(Database { id: DB, name: "sales".to_string() });
        catalog.add_table(table(None));
        catalog.add_partition(Partition {
            id: PARTITION,
            table_id: TABLE,
            name: "p1".to_string(),
            state: PartitionState::Normal,
            replication_num,
            storage_medium: StorageMedium::Hdd,
        });
        catalog.add_physical_partition(PhysicalPartition {
            id: PHYSICAL,
            parent_id: PARTITION,
            table_id: TABLE,
            visible_version: VISIBLE,
            visible_version_time_ms: 0,
            committed_version: VISIBLE,
            visible_txn_id: 0,
        });
        catalog.add_index(MaterializedIndex {
            id: INDEX,
            physical_partition_id: PHYSICAL,
            schema_hash: 77,
            tablets: vec![],
        });

        let cluster = Arc::new(MemoryCluster::new(backends));
        let txns = Arc::new(MemoryTxnManager::new(1));
        let journal = JournalStore::open_in_memory().unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let env = SchedEnv::new(
            catalog.clone(),
            cluster.clone(),
            txns.clone(),
            Arc::new(journal.clone()),
            dispatcher.clone(),
        )
        .with_clock(clock.clone());
        let scheduler = Arc::new(make(env, config));
        Self { catalog, cluster, txns, journal, dispatcher, clock, scheduler }
    }

    /// Tablet with one replica per `(replica_id, backend, version)`, each
    /// on the backend's first path.
    fn add_tablet(&self, tablet_id: TabletId, replicas: &[(ReplicaId, BackendId, u64)]) {
        let replicas = replicas
            .iter()
            .map(|(id, be, version)| Replica::new(*id, *be, Some(be * 10), *version))
            .collect();
        self.catalog.add_tablet(meta(), Tablet { id: tablet_id, replicas });
    }

    fn repair(&self, tablet_id: TabletId, status: TabletHealthStatus, priority: Priority) -> SchedulingContext {
        SchedulingContext::repair(meta(), tablet_id, status, priority, self.env_now())
    }

    fn env_now(&self) -> u64 {
        use tabletgrid_core::Clock;
        self.clock.now_ms()
    }

    fn replica_on(&self, tablet_id: TabletId, backend_id: BackendId) -> Option<Replica> {
        self.catalog
            .tablet(tablet_id)
            .and_then(|t| t.replica_by_backend(backend_id).cloned())
    }

    fn only_clone_task(&self) -> CloneTask {
        let mut tasks = self.dispatcher.take();
        assert_eq!(tasks.len(), 1, "expected one task, got {tasks:?}");
        match tasks.remove(0) {
            AgentTask::Clone(task) => task,
            other => panic!("expected clone task, got {other:?}"),
        }
    }

    fn all_slots_free(&self) -> bool {
        self.scheduler.slots_info().iter().all(|s| s.available == s.total)
    }
}

fn reported(version: u64) -> ReportedReplica {
    ReportedReplica { version, row_count: 100, data_size: 4096 }
}

// ── Repair ─────────────────────────────────────────────────────

#[test]
fn missing_replica_is_cloned_to_an_empty_backend() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE)]);

    let ctx = h.repair(100, TabletHealthStatus::ReplicaMissing, Priority::Normal);
    assert_eq!(h.scheduler.add_tablet(ctx, false), AddResult::Added);
    h.scheduler.run_once();

    let task = h.only_clone_task();
    assert_eq!(task.dest_backend_id, 3);
    assert_eq!(task.dest_path_hash, 30);
    assert_eq!(task.sources[0].backend_id, 1);
    assert_eq!(task.visible_version, VISIBLE);
    assert_eq!(h.scheduler.running_num(), 1);
    assert_eq!(h.scheduler.pending_num(), 0);
    assert_eq!(h.replica_on(100, 3).unwrap().state, ReplicaState::Clone);

    h.scheduler.finish_clone_task(&task, &TaskResult::ok(reported(VISIBLE), 2_000));

    let replica = h.replica_on(100, 3).unwrap();
    assert_eq!(replica.state, ReplicaState::Normal);
    assert_eq!(replica.version, VISIBLE);
    assert_eq!(replica.data_size, 4096);
    assert_eq!(h.scheduler.running_num(), 0);
    assert_eq!(h.scheduler.total_num(), 0);
    assert!(h.all_slots_free());

    let history = h.scheduler.history_tablets_info(10);
    assert_eq!(history[0].state, SchedState::Finished);
    assert_eq!(history[0].copy_size, 4096);

    let records = h.journal.records_since(0).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.op, ReplicaOp::Add);
    assert_eq!(records[0].1.backend_id, 3);

    let stat = h.scheduler.stat_snapshot();
    assert_eq!(stat.clone_task, 1);
    assert_eq!(stat.clone_task_succeeded, 1);
    assert_eq!(stat.replica_missing_err, 1);
}

#[test]
fn lagging_replica_is_repaired_in_place() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, 3)]);

    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::VersionIncomplete, Priority::Normal), false);
    h.scheduler.run_once();

    let task = h.only_clone_task();
    assert_eq!(task.dest_backend_id, 3);
    assert_ne!(task.sources[0].backend_id, 3);
    assert_eq!(h.catalog.tablet(100).unwrap().replicas.len(), 3);

    h.scheduler.finish_clone_task(&task, &TaskResult::ok(reported(VISIBLE), 1_000));
    assert_eq!(h.replica_on(100, 3).unwrap().version, VISIBLE);
    assert_eq!(h.journal.records_since(0).unwrap()[0].1.op, ReplicaOp::Update);
    assert_eq!(h.scheduler.stat_snapshot().replica_version_missing_err, 1);
}

#[test]
fn relocating_replica_gets_a_new_copy_elsewhere() {
    let mut backends: Vec<Backend> = (1..=4).map(|id| backend(id, 10)).collect();
    backends[2].decommissioned = true;
    let h = Harness::build(repair_config(), 3, backends, TabletScheduler::with_load_score_rebalancer);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE)]);

    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ReplicaRelocating, Priority::Normal), false);
    h.scheduler.run_once();

    let task = h.only_clone_task();
    assert_eq!(task.dest_backend_id, 4);
    assert_eq!(task.sources[0].backend_id, 1);
}

#[test]
fn replica_on_decommissioned_disk_moves_to_a_sibling_path() {
    let mut backends: Vec<Backend> = (1..=4).map(|id| backend(id, 10)).collect();
    backends[0].disks[0].state = DiskState::Decommissioned;
    backends[0].disks.push(disk(11, 5));
    let h = Harness::build(repair_config(), 3, backends, TabletScheduler::with_load_score_rebalancer);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE)]);

    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::DiskMigration, Priority::Normal), false);
    h.scheduler.run_once();

    let task = h.only_clone_task();
    assert_eq!(task.dest_backend_id, 1);
    assert_eq!(task.dest_path_hash, 11);
    assert_eq!(task.sources[0].path_hash, 10);

    h.scheduler.finish_clone_task(&task, &TaskResult::ok(reported(VISIBLE), 500));
    assert_eq!(h.replica_on(100, 1).unwrap().path_hash, Some(11));
    assert_eq!(h.catalog.tablet(100).unwrap().replicas.len(), 3);
}

#[test]
fn healthy_tablet_finishes_without_work() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE)]);

    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ReplicaMissing, Priority::High), false);
    h.scheduler.run_once();

    assert!(h.dispatcher.is_empty());
    let history = h.scheduler.history_tablets_info(1);
    assert_eq!(history[0].state, SchedState::Finished);
    assert_eq!(history[0].err_msg.as_deref(), Some("tablet is healthy"));
    assert_eq!(h.scheduler.stat_snapshot().tablet_finished, 1);
}

#[test]
fn dropped_table_cancels_the_context() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE)]);
    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ReplicaMissing, Priority::Normal), false);
    h.catalog.remove_table(TABLE);

    h.scheduler.run_once();

    let history = h.scheduler.history_tablets_info(1);
    assert_eq!(history[0].state, SchedState::Cancelled);
    assert!(history[0].err_msg.as_deref().unwrap().contains("does not exist"));
    assert_eq!(h.scheduler.stat_snapshot().tablet_scheduled_discard, 1);
    assert!(!h.scheduler.contains_tablet(100));
}

#[test]
fn lost_single_replica_recovers_with_an_empty_replica() {
    let config = SchedulerConfig { recover_with_empty_tablet: true, ..repair_config() };
    let h = Harness::new(config, 1);
    // Backend 9 is not a cluster member.
    h.add_tablet(100, &[(1001, 9, VISIBLE)]);

    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ReplicaMissing, Priority::High), false);
    h.scheduler.run_once();

    let mut tasks = h.dispatcher.take();
    let AgentTask::CreateReplica(task) = tasks.remove(0) else {
        panic!("expected create replica task");
    };
    assert_eq!(task.version, VISIBLE);
    assert_eq!(h.replica_on(100, task.backend_id).unwrap().state, ReplicaState::Clone);

    h.scheduler
        .finish_create_replica_task(&task, &TaskResult::ok(reported(VISIBLE), 10));

    let replica = h.replica_on(100, task.backend_id).unwrap();
    assert_eq!(replica.state, ReplicaState::Normal);
    assert_eq!(replica.version, VISIBLE);
    assert_eq!(h.scheduler.history_tablets_info(1)[0].state, SchedState::Finished);
    assert_eq!(h.journal.len().unwrap(), 1);
    assert_eq!(h.scheduler.stat_snapshot().create_replica_task, 1);
}

#[test]
fn lost_single_replica_without_recovery_is_cancelled() {
    let h = Harness::new(repair_config(), 1);
    h.add_tablet(100, &[(1001, 9, VISIBLE)]);

    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ReplicaMissing, Priority::High), false);
    h.scheduler.run_once();

    let history = h.scheduler.history_tablets_info(1);
    assert_eq!(history[0].state, SchedState::Cancelled);
    assert_eq!(history[0].err_msg.as_deref(), Some("unable to find source replica"));
    assert!(h.all_slots_free());
    assert!(h.dispatcher.is_empty());
}

// ── Redundant replicas ─────────────────────────────────────────

#[test]
fn redundant_replica_waits_for_earlier_transactions() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(
        100,
        &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE), (1004, 4, VISIBLE)],
    );
    let load = h.txns.begin(DB, vec![TABLE]);

    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::Redundant, Priority::VeryHigh), false);

    // First pass stamps the victim.
    h.scheduler.run_once();
    let stamped: Vec<Replica> = h
        .catalog
        .tablet(100)
        .unwrap()
        .replicas
        .into_iter()
        .filter(|r| r.state == ReplicaState::Decommission)
        .collect();
    assert_eq!(stamped.len(), 1);
    let victim = stamped[0].clone();
    assert_eq!(victim.watermark_txn_id, Some(load + 1));
    assert_eq!(h.scheduler.pending_num(), 1);
    let pending = h.scheduler.pending_tablets_info(1);
    assert!(pending[0].err_msg.as_deref().unwrap().starts_with("set watermark txn"));

    // The load started before the stamp is still running.
    h.scheduler.run_once();
    assert_eq!(h.catalog.tablet(100).unwrap().replicas.len(), 4);
    let pending = h.scheduler.pending_tablets_info(1);
    assert!(pending[0].err_msg.as_deref().unwrap().starts_with("wait txn before"));

    h.txns.finish(load);
    h.scheduler.run_once();

    let tablet = h.catalog.tablet(100).unwrap();
    assert_eq!(tablet.replicas.len(), 3);
    assert!(tablet.replica(victim.id).is_none());
    let history = h.scheduler.history_tablets_info(1);
    assert_eq!(history[0].state, SchedState::Finished);
    assert_eq!(history[0].err_msg.as_deref(), Some("redundant replica is deleted"));
    assert_eq!(h.journal.records_since(0).unwrap()[0].1.op, ReplicaOp::Delete);
    // Not forced, so no drop command.
    assert!(h.dispatcher.is_empty());

    let stat = h.scheduler.stat_snapshot();
    assert_eq!(stat.replica_decommissioned, 1);
    assert_eq!(stat.replica_deleted, 1);
}

#[test]
fn replica_on_decommissioned_backend_is_removed_before_the_loaded_one() {
    let backends = vec![backend(1, 10), backend(2, 10), backend(3, 60), backend(4, 10)];
    let h = Harness::build(repair_config(), 3, backends, TabletScheduler::with_load_score_rebalancer);
    h.add_tablet(
        100,
        &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE), (1004, 4, VISIBLE)],
    );
    assert!(h.cluster.modify(2, |b| b.decommissioned = true));

    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::Redundant, Priority::VeryHigh), false);
    h.scheduler.run_once();

    let stamped = h.replica_on(100, 2).unwrap();
    assert_eq!(stamped.state, ReplicaState::Decommission);
    assert!(stamped.watermark_txn_id.is_some());
    assert_eq!(h.replica_on(100, 3).unwrap().state, ReplicaState::Normal);
    assert_eq!(h.catalog.tablet(100).unwrap().replicas.len(), 4);

    h.scheduler.run_once();
    assert!(h.replica_on(100, 2).is_none());
    assert!(h.replica_on(100, 3).is_some());
    assert_eq!(h.scheduler.history_tablets_info(1)[0].state, SchedState::Finished);
}

#[test]
fn forced_delete_drops_bad_replica_immediately() {
    let config = SchedulerConfig { always_force_decommission_replica: true, ..repair_config() };
    let h = Harness::new(config, 3);
    h.add_tablet(
        100,
        &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE), (1004, 4, VISIBLE)],
    );
    h.catalog.update_replica(100, 1003, &mut |r| r.bad = true);

    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::Redundant, Priority::VeryHigh), false);
    h.scheduler.run_once();

    assert!(h.replica_on(100, 3).is_none());
    let tasks = h.dispatcher.take();
    assert_eq!(tasks.len(), 1);
    let AgentTask::DropReplica(drop) = &tasks[0] else {
        panic!("expected drop task");
    };
    assert_eq!(drop.backend_id, 3);
    assert!(drop.force);
}

#[test]
fn failed_watermark_check_restores_the_stamped_replica() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(
        100,
        &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE), (1004, 4, VISIBLE)],
    );
    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::Redundant, Priority::VeryHigh), false);
    h.scheduler.run_once();

    h.txns.set_failure(Some("txn service unavailable".to_string()));
    h.scheduler.run_once();

    let tablet = h.catalog.tablet(100).unwrap();
    assert_eq!(tablet.replicas.len(), 4);
    assert!(tablet
        .replicas
        .iter()
        .all(|r| r.state == ReplicaState::Normal && r.watermark_txn_id.is_none()));
    assert_eq!(h.scheduler.history_tablets_info(1)[0].state, SchedState::Cancelled);
}

// ── Colocate ───────────────────────────────────────────────────

#[test]
fn colocate_tablet_follows_its_bucket_backends() {
    let h = Harness::new(repair_config(), 3);
    h.catalog.add_table(table(Some(7)));
    h.catalog.set_colocate_backends(7, vec![BTreeSet::from([1, 2, 4])]);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE)]);

    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ColocateMismatch, Priority::High), false);
    h.scheduler.run_once();

    let task = h.only_clone_task();
    assert_eq!(task.dest_backend_id, 4);
    h.scheduler.finish_clone_task(&task, &TaskResult::ok(reported(VISIBLE), 100));
    assert!(h.scheduler.tablets_in_sched_by_colocate_group().is_empty());

    // Backend 3 is now outside the set and surplus.
    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ColocateRedundant, Priority::High), false);
    h.scheduler.run_once();
    assert_eq!(h.replica_on(100, 3).unwrap().state, ReplicaState::Decommission);
    assert_eq!(h.scheduler.tablets_in_sched_by_colocate_group().get(&7).copied(), Some(1));
}

// ── Admission and queue ────────────────────────────────────────

#[test]
fn admission_rejects_duplicates_and_respects_the_ceiling() {
    let config = SchedulerConfig { max_scheduling_tablets: 1, ..repair_config() };
    let h = Harness::new(config, 3);
    let repair = |id| h.repair(id, TabletHealthStatus::ReplicaMissing, Priority::Normal);

    assert_eq!(h.scheduler.add_tablet(repair(1), false), AddResult::Added);
    assert_eq!(h.scheduler.add_tablet(repair(1), false), AddResult::AlreadyIn);
    assert_eq!(h.scheduler.add_tablet(repair(2), false), AddResult::Added);
    assert_eq!(h.scheduler.add_tablet(repair(3), false), AddResult::LimitExceeded);
    assert_eq!(h.scheduler.add_tablet(repair(3), true), AddResult::Added);

    let balance = SchedulingContext::new(SchedType::Balance, meta(), 4, 0);
    assert_eq!(h.scheduler.add_tablet(balance, false), AddResult::Added);

    assert_eq!(h.scheduler.all_tablet_ids(), vec![1, 2, 3, 4]);
    assert_eq!(h.scheduler.total_num(), h.scheduler.pending_num());
    assert_eq!(h.scheduler.balance_tablets_num(), 1);

    let stat = h.scheduler.stat_snapshot();
    assert_eq!(stat.unhealthy_tablet_added, 3);
    assert_eq!(stat.balance_tablet_added, 1);
    assert_eq!(stat.tablet_not_added, 2);
}

#[test]
fn pending_order_follows_priority() {
    let h = Harness::new(repair_config(), 3);
    for (id, priority) in [(1, Priority::Low), (2, Priority::VeryHigh), (3, Priority::Normal)] {
        h.scheduler
            .add_tablet(h.repair(id, TabletHealthStatus::ReplicaMissing, priority), false);
    }
    let order: Vec<TabletId> = h
        .scheduler
        .pending_tablets_info(10)
        .iter()
        .map(|b| b.tablet_id)
        .collect();
    assert_eq!(order, vec![2, 3, 1]);

    let changed = h.scheduler.change_tablets_priority_to_very_high(DB, TABLE, &[PHYSICAL]);
    assert_eq!(changed, 3);
    assert!(h
        .scheduler
        .pending_tablets_info(10)
        .iter()
        .all(|b| b.dynamic_priority == Priority::VeryHigh));
    assert_eq!(h.scheduler.change_tablets_priority_to_very_high(DB, TABLE + 1, &[PHYSICAL]), 0);
}

#[test]
fn blocking_add_gives_up_after_max_wait() {
    let config = SchedulerConfig { max_scheduling_tablets: 0, blocking_add_sleep_ms: 5, ..repair_config() };
    let h = Harness::new(config, 3);
    let db_lock = RwLock::new(());

    let guard = db_lock.read().unwrap();
    let first = h.repair(1, TabletHealthStatus::ReplicaMissing, Priority::Normal);
    let (added, waited, guard) = h.scheduler.blocking_add(&db_lock, guard, first, false, Duration::from_millis(20));
    assert!(added);
    assert_eq!(waited, 0);

    let second = h.repair(2, TabletHealthStatus::ReplicaMissing, Priority::Normal);
    let (added, waited, guard) = h.scheduler.blocking_add(&db_lock, guard, second, false, Duration::from_millis(20));
    assert!(!added);
    assert!(waited >= 20);

    let forced = h.repair(3, TabletHealthStatus::ReplicaMissing, Priority::Normal);
    let (added, _, _guard) = h.scheduler.blocking_add(&db_lock, guard, forced, true, Duration::from_millis(20));
    assert!(added);
    assert_eq!(h.scheduler.pending_num(), 2);
}

#[test]
fn recycled_table_keeps_its_context_pending() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE)]);
    h.catalog
        .recycle(RecycledObject::Table(TABLE), h.env_now() + 1_000);
    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ReplicaMissing, Priority::Normal), false);

    h.scheduler.run_once();
    assert_eq!(h.scheduler.pending_num(), 1);
    assert_eq!(h.scheduler.stat_snapshot().tablet_scheduled, 0);
    assert!(h.dispatcher.is_empty());
}

// ── Running contexts ───────────────────────────────────────────

#[test]
fn running_clone_times_out_and_releases_its_slots() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE)]);
    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ReplicaMissing, Priority::Normal), false);
    h.scheduler.run_once();
    assert_eq!(h.scheduler.running_num(), 1);
    assert!(!h.all_slots_free());

    let timeout = h.scheduler.running_tablets_info(1)[0].timeout_ms;
    assert_eq!(timeout, 180_000);
    h.clock.advance(timeout + 1);
    h.scheduler.run_once();

    assert_eq!(h.scheduler.running_num(), 0);
    assert!(h.all_slots_free());
    // The CLONE replica created for the attempt is gone.
    assert!(h.replica_on(100, 3).is_none());
    let history = h.scheduler.history_tablets_info(1);
    assert_eq!(history[0].state, SchedState::Cancelled);
    assert_eq!(history[0].err_msg.as_deref(), Some("timeout"));
    assert_eq!(h.scheduler.stat_snapshot().clone_task_timeout, 1);
}

#[test]
fn failed_clone_goes_back_to_pending_and_stale_reports_are_ignored() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE)]);
    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ReplicaMissing, Priority::Normal), false);
    h.scheduler.run_once();
    let first = h.only_clone_task();

    h.scheduler.finish_clone_task(&first, &TaskResult::failed("disk full"));
    assert_eq!(h.scheduler.running_num(), 0);
    assert_eq!(h.scheduler.pending_num(), 1);
    assert!(h.all_slots_free());
    assert!(h.replica_on(100, 3).is_none());
    let pending = h.scheduler.pending_tablets_info(1);
    assert!(pending[0].err_msg.as_deref().unwrap().contains("disk full"));
    assert_eq!(pending[0].failed_running, 1);

    h.scheduler.run_once();
    let second = h.only_clone_task();
    assert_ne!(first.signature, second.signature);

    // A late success for the first attempt must not touch the new one.
    h.scheduler.finish_clone_task(&first, &TaskResult::ok(reported(VISIBLE), 10));
    assert_eq!(h.scheduler.running_num(), 1);
    assert_eq!(h.replica_on(100, 3).unwrap().state, ReplicaState::Clone);
    assert_eq!(h.scheduler.stat_snapshot().clone_task_failed, 1);
}

#[test]
fn clone_failing_past_threshold_is_cancelled() {
    let config = SchedulerConfig { running_failed_threshold: 0, ..repair_config() };
    let h = Harness::new(config, 3);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE)]);
    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ReplicaMissing, Priority::Normal), false);
    h.scheduler.run_once();
    let task = h.only_clone_task();

    h.scheduler.finish_clone_task(&task, &TaskResult::failed("checksum mismatch"));
    assert_eq!(h.scheduler.total_num(), 0);
    assert_eq!(h.scheduler.history_tablets_info(1)[0].state, SchedState::Cancelled);
}

#[test]
fn force_clean_cancels_everything_once() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE)]);
    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ReplicaMissing, Priority::Normal), false);
    h.scheduler.run_once();
    h.scheduler
        .add_tablet(h.repair(200, TabletHealthStatus::ReplicaMissing, Priority::Normal), false);
    assert_eq!(h.scheduler.total_num(), 2);

    h.scheduler.force_clean_sched_queue();
    h.scheduler.run_once();

    assert_eq!(h.scheduler.total_num(), 0);
    assert_eq!(h.scheduler.running_num(), 0);
    assert!(h.all_slots_free());
    assert!(h.replica_on(100, 3).is_none());
    assert!(h
        .scheduler
        .history_tablets_info(10)
        .iter()
        .any(|b| b.err_msg.as_deref() == Some("force clean")));

    let history = h.scheduler.history_num();
    h.scheduler.force_clean_sched_queue();
    h.scheduler.run_once();
    assert_eq!(h.scheduler.history_num(), history);
}

// ── Balance ────────────────────────────────────────────────────

#[test]
fn balance_moves_a_tablet_off_the_loaded_backend() {
    let config = SchedulerConfig { stat_update_interval_ms: 0, ..SchedulerConfig::default() };
    let backends = vec![backend(1, 80), backend(2, 40), backend(3, 40), backend(4, 10)];
    let h = Harness::build(config, 3, backends, TabletScheduler::with_load_score_rebalancer);
    for id in [100, 101] {
        h.add_tablet(id, &[(id * 10 + 1, 1, VISIBLE), (id * 10 + 2, 2, VISIBLE), (id * 10 + 3, 3, VISIBLE)]);
    }

    h.scheduler.run_once();
    assert_eq!(h.scheduler.balance_tablets_num(), 2);
    let proposals = h.scheduler.pending_tablets_info(10);
    assert!(proposals.iter().all(|b| b.sched_type == SchedType::Balance));
    assert!(proposals.iter().all(|b| b.dest_backend == Some(4)));
    assert!(proposals.iter().all(|b| b.dynamic_priority == Priority::Low));

    h.scheduler.run_once();
    let tasks = h.dispatcher.take();
    assert_eq!(tasks.len(), 2);
    // Proposals are not refilled while moves are in flight.
    assert_eq!(h.scheduler.balance_tablets_num(), 2);

    let task = tasks
        .into_iter()
        .find_map(|t| match t {
            AgentTask::Clone(c) if c.tablet_id == 100 => Some(c),
            _ => None,
        })
        .unwrap();
    assert_eq!(task.dest_backend_id, 4);
    assert_eq!(task.sources[0].backend_id, 1);
    h.scheduler.finish_clone_task(&task, &TaskResult::ok(reported(VISIBLE), 100));
    assert_eq!(h.catalog.tablet(100).unwrap().replicas.len(), 4);

    // The surplus copy is the one the move left behind.
    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::Redundant, Priority::VeryHigh), false);
    h.scheduler.run_once();
    assert_eq!(h.replica_on(100, 1).unwrap().state, ReplicaState::Decommission);
    assert_eq!(h.replica_on(100, 4).unwrap().state, ReplicaState::Normal);
}

#[test]
fn disabled_balance_proposes_nothing() {
    let config = SchedulerConfig { stat_update_interval_ms: 0, disable_balance: true, ..SchedulerConfig::default() };
    let backends = vec![backend(1, 80), backend(2, 40), backend(3, 40), backend(4, 10)];
    let h = Harness::build(config, 3, backends, TabletScheduler::with_load_score_rebalancer);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE)]);

    h.scheduler.run_once();
    assert_eq!(h.scheduler.total_num(), 0);
    assert!(h.scheduler.cluster_load_brief().unwrap().contains("HDD"));
}

#[test]
fn cancelled_balance_moves_are_proposed_again() {
    let config = SchedulerConfig { stat_update_interval_ms: 0, ..SchedulerConfig::default() };
    let backends = vec![backend(1, 80), backend(2, 40), backend(3, 40), backend(4, 10)];
    let h = Harness::build(config, 3, backends, TabletScheduler::with_load_score_rebalancer);
    for id in [100, 101] {
        h.add_tablet(id, &[(id * 10 + 1, 1, VISIBLE), (id * 10 + 2, 2, VISIBLE), (id * 10 + 3, 3, VISIBLE)]);
    }

    h.scheduler.run_once();
    assert_eq!(h.scheduler.balance_tablets_num(), 2);
    h.scheduler.force_clean_sched_queue();
    h.scheduler.run_once();
    assert_eq!(h.dispatcher.take().len(), 2);
    assert_eq!(h.scheduler.total_num(), 0);
    assert_eq!(h.catalog.tablet(100).unwrap().replicas.len(), 3);

    // The cluster is still skewed, so the same tablets come back.
    h.scheduler.run_once();
    assert_eq!(h.scheduler.balance_tablets_num(), 2);
    let mut ids: Vec<TabletId> = h.scheduler.pending_tablets_info(10).iter().map(|b| b.tablet_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![100, 101]);
}

#[test]
fn load_score_strategy_holds_moves_until_they_end() {
    let config = SchedulerConfig { stat_update_interval_ms: 0, ..SchedulerConfig::default() };
    let backends = vec![backend(1, 80), backend(2, 40), backend(3, 40), backend(4, 10)];
    let mut env = None;
    let h = Harness::build(config.clone(), 3, backends, |e, config| {
        env = Some(e.clone());
        TabletScheduler::with_load_score_rebalancer(e, config)
    });
    for id in [100, 101] {
        h.add_tablet(id, &[(id * 10 + 1, 1, VISIBLE), (id * 10 + 2, 2, VISIBLE), (id * 10 + 3, 3, VISIBLE)]);
    }
    let strategy = LoadScoreRebalancer::new(env.unwrap(), BalanceOptions::from(&config));
    strategy.update_load_statistic(Arc::new(ClusterLoadStatistic::build(
        &*h.cluster,
        &*h.catalog,
        h.env_now(),
    )));

    let proposals = strategy.select_alternative_tablets();
    assert_eq!(proposals.len(), 2);
    assert!(strategy.select_alternative_tablets().is_empty());

    // A finished move waits for its source replica to go.
    strategy.on_finished(&proposals[0], SchedState::Finished);
    assert!(strategy.select_alternative_tablets().is_empty());

    for state in [SchedState::Cancelled, SchedState::Unexpected] {
        let ctx = proposals.iter().find(|c| c.tablet_id() == 101).unwrap();
        strategy.on_finished(ctx, state);
        let again = strategy.select_alternative_tablets();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].tablet_id(), 101);
    }
}

#[derive(Default)]
struct PanickingRebalancer {
    finished: Mutex<Vec<(TabletId, SchedType, SchedState)>>,
}

impl Rebalancer for PanickingRebalancer {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn update_load_statistic(&self, _statistic: Arc<ClusterLoadStatistic>) {}

    fn select_alternative_tablets(&self) -> Vec<SchedulingContext> {
        Vec::new()
    }

    fn create_balance_task(&self, _ctx: &mut SchedulingContext, _slots: &BackendSlots) -> SchedResult<AgentTask> {
        panic!("strategy exploded");
    }

    fn on_finished(&self, ctx: &SchedulingContext, state: SchedState) {
        self.finished
            .lock()
            .unwrap()
            .push((ctx.tablet_id(), ctx.sched_type(), state));
    }
}

#[test]
fn panicking_strategy_marks_context_unexpected_and_engine_continues() {
    let h = Harness::build(repair_config(), 3, (1..=4).map(|id| backend(id, 10)).collect(), |env, config| {
        TabletScheduler::new(env, config, Arc::new(PanickingRebalancer::default()))
    });
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE)]);
    h.add_tablet(200, &[(2001, 1, VISIBLE), (2002, 2, VISIBLE)]);

    let now = h.env_now();
    h.scheduler
        .add_tablet(SchedulingContext::new(SchedType::Balance, meta(), 100, now), false);
    h.scheduler.run_once();

    let history = h.scheduler.history_tablets_info(1);
    assert_eq!(history[0].state, SchedState::Unexpected);
    assert!(history[0].err_msg.as_deref().unwrap().contains("strategy exploded"));
    assert_eq!(h.scheduler.stat_snapshot().unexpected_failure, 1);
    assert_eq!(h.scheduler.rebalancer_name(), "panicking");

    h.scheduler
        .add_tablet(h.repair(200, TabletHealthStatus::ReplicaMissing, Priority::Normal), false);
    h.scheduler.run_once();
    assert_eq!(h.only_clone_task().tablet_id, 200);
}

#[test]
fn balance_context_on_altering_table_is_cancelled() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE)]);
    h.catalog.set_table_state(TABLE, TableState::SchemaChange);

    let now = h.env_now();
    h.scheduler
        .add_tablet(SchedulingContext::new(SchedType::Balance, meta(), 100, now), false);
    h.scheduler.run_once();

    let history = h.scheduler.history_tablets_info(1);
    assert_eq!(history[0].state, SchedState::Cancelled);
    assert_eq!(history[0].err_msg.as_deref(), Some("table's state is not NORMAL"));
}

#[test]
fn unhealthy_balance_tablet_is_repaired_instead() {
    let strategy = Arc::new(PanickingRebalancer::default());
    let shared = strategy.clone();
    let h = Harness::build(repair_config(), 3, (1..=4).map(|id| backend(id, 10)).collect(), move |env, config| {
        TabletScheduler::new(env, config, shared)
    });
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE)]);
    for id in [2, 3] {
        assert!(h.cluster.modify(id, |b| b.alive = false));
    }

    let now = h.env_now();
    h.scheduler
        .add_tablet(SchedulingContext::new(SchedType::Balance, meta(), 100, now), false);
    h.scheduler.run_once();

    // The strategy never sees the context.
    let task = h.only_clone_task();
    assert_eq!(task.dest_backend_id, 4);
    assert_eq!(task.sources[0].backend_id, 1);
    let running = h.scheduler.running_tablets_info(1);
    assert_eq!(running[0].sched_type, SchedType::Repair);
    assert_eq!(running[0].status, TabletHealthStatus::ReplicaMissing);
    assert_eq!(running[0].dynamic_priority, Priority::High);

    // The strategy is told its move is gone, then sees the repair end.
    assert_eq!(*strategy.finished.lock().unwrap(), vec![(100, SchedType::Balance, SchedState::Cancelled)]);
    h.scheduler.finish_clone_task(&task, &TaskResult::ok(reported(VISIBLE), 100));
    assert_eq!(
        strategy.finished.lock().unwrap().last(),
        Some(&(100, SchedType::Repair, SchedState::Finished))
    );
}

// ── Slots, introspection, loop ─────────────────────────────────

#[test]
fn backend_without_path_hash_skips_the_round() {
    let mut backends: Vec<Backend> = (1..=3).map(|id| backend(id, 10)).collect();
    backends[1].disks[0].path_hash = None;
    let h = Harness::build(repair_config(), 3, backends, TabletScheduler::with_load_score_rebalancer);

    h.scheduler.run_once();
    assert_eq!(h.scheduler.stat_snapshot().schedule_rounds, 0);

    h.cluster.modify(2, |b| b.disks[0].path_hash = Some(20));
    h.scheduler.run_once();
    assert_eq!(h.scheduler.stat_snapshot().schedule_rounds, 1);
    assert_eq!(h.scheduler.slots_info().len(), 3);
}

#[test]
fn slot_count_change_applies_to_every_path() {
    let h = Harness::new(repair_config(), 3);
    h.scheduler.run_once();
    assert!(h.scheduler.slots_info().iter().all(|s| s.total == 8));

    h.scheduler
        .update_config(SchedulerConfig { slot_num_per_path: 4, ..repair_config() });
    h.scheduler.run_once();
    assert!(h
        .scheduler
        .slots_info()
        .iter()
        .all(|s| s.total == 4 && s.available == 4));
    assert_eq!(h.scheduler.config().slot_num_per_path, 4);
}

#[test]
fn schedule_query_filters_all_queues() {
    let h = Harness::new(repair_config(), 3);
    h.add_tablet(100, &[(1001, 1, VISIBLE), (1002, 2, VISIBLE), (1003, 3, VISIBLE)]);
    h.scheduler
        .add_tablet(h.repair(100, TabletHealthStatus::ReplicaMissing, Priority::Normal), false);
    h.scheduler.run_once();
    h.scheduler
        .add_tablet(h.repair(300, TabletHealthStatus::ReplicaMissing, Priority::Normal), false);

    let all = h.scheduler.tablet_schedule(&ScheduleQuery::default());
    assert_eq!(all.len(), 2);

    let finished = h.scheduler.tablet_schedule(&ScheduleQuery {
        state: Some(SchedState::Finished),
        ..ScheduleQuery::default()
    });
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].tablet_id, 100);

    let limited = h.scheduler.tablet_schedule(&ScheduleQuery { limit: Some(1), ..ScheduleQuery::default() });
    assert_eq!(limited.len(), 1);

    let text = h.scheduler.render_prometheus();
    assert!(text.contains("tabletgrid_scheduler_pending_tablets 1\n"));
    assert!(text.contains("tabletgrid_scheduler_history_tablets 1\n"));
}

#[tokio::test(start_paused = true)]
async fn control_loop_ticks_until_shutdown() {
    let h = Harness::new(repair_config(), 3);
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&h.scheduler).run(rx));

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert!(h.scheduler.stat_snapshot().schedule_rounds >= 1);
}
