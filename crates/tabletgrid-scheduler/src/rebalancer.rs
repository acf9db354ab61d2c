//! Balance strategy contract and the reference load-score strategy.
//!
//! A strategy proposes BALANCE contexts from the latest load snapshot.
//! Proposals carry the intended move but hold no slots; the engine calls
//! [`Rebalancer::create_balance_task`] later, under the normal scheduling
//! pass, to acquire slots and build the clone.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use tabletgrid_core::SchedulerConfig;
use tabletgrid_health::Priority;
use tabletgrid_placement::{ClusterLoadStatistic, FitLimits};
use tabletgrid_state::{BackendId, ReplicaId, ReplicaState, StorageMedium, TableState, TabletId};

use crate::context::{BalanceMove, SchedState, SchedType, SchedulingContext};
use crate::env::SchedEnv;
use crate::error::{SchedError, SchedResult};
use crate::slot::BackendSlots;
use crate::task::AgentTask;

pub trait Rebalancer: Send + Sync {
    fn name(&self) -> &'static str;

    fn update_load_statistic(&self, statistic: Arc<ClusterLoadStatistic>);

    fn update_config(&self, _config: &SchedulerConfig) {}

    /// BALANCE contexts worth scheduling now.
    fn select_alternative_tablets(&self) -> Vec<SchedulingContext>;

    /// Take slots and build the command for a context this strategy
    /// proposed. The engine has refreshed the tablet snapshot.
    fn create_balance_task(&self, ctx: &mut SchedulingContext, slots: &BackendSlots) -> SchedResult<AgentTask>;

    /// Replica the strategy wants removed from a redundant tablet.
    fn replica_to_delete(&self, _ctx: &SchedulingContext) -> Option<ReplicaId> {
        None
    }

    /// Called when a context for the tablet is retired with `state`, and
    /// when a BALANCE context is turned into a REPAIR one. Rejected
    /// proposals are reported as `Cancelled`.
    fn on_finished(&self, _ctx: &SchedulingContext, _state: SchedState) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceOptions {
    /// Score spread between the most and least loaded backend that
    /// triggers moves.
    pub load_score_threshold: f64,
    pub max_balancing_tablets: usize,
    pub fit_limits: FitLimits,
}

impl From<&SchedulerConfig> for BalanceOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            load_score_threshold: config.balance_load_score_threshold,
            max_balancing_tablets: config.max_balancing_tablets,
            fit_limits: FitLimits::from(config),
        }
    }
}

/// Moves healthy tablets from the highest-score backend to the lowest,
/// one medium at a time.
pub struct LoadScoreRebalancer {
    env: SchedEnv,
    options: RwLock<BalanceOptions>,
    statistic: RwLock<Option<Arc<ClusterLoadStatistic>>>,
    moves: Mutex<HashMap<TabletId, BalanceMove>>,
}

impl LoadScoreRebalancer {
    pub fn new(env: SchedEnv, options: BalanceOptions) -> Self {
        Self {
            env,
            options: RwLock::new(options),
            statistic: RwLock::new(None),
            moves: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_options(&self, options: BalanceOptions) {
        *self.options.write().expect("options lock") = options;
    }

    fn current(&self) -> Option<Arc<ClusterLoadStatistic>> {
        self.statistic.read().expect("statistic lock").clone()
    }

    /// Forget moves whose source replica is gone.
    fn prune_moves(&self) {
        let catalog = &self.env.catalog;
        self.moves.lock().expect("moves lock").retain(|tablet_id, mv| {
            catalog
                .tablet(*tablet_id)
                .is_some_and(|t| t.replica(mv.src_replica).is_some())
        });
    }

    /// A tablet whose replicas are all NORMAL, caught up and exactly as
    /// many as the partition wants.
    fn is_movable(&self, tablet_id: TabletId) -> Option<SchedulingContext> {
        let catalog = &self.env.catalog;
        let meta = catalog.tablet_meta(tablet_id)?;
        let table = catalog.table(meta.db_id, meta.table_id)?;
        if table.colocate_group.is_some() || table.state != TableState::Normal {
            return None;
        }
        let physical = catalog.physical_partition(meta.table_id, meta.physical_partition_id)?;
        let partition = catalog.partition(meta.table_id, physical.parent_id)?;
        let tablet = catalog.tablet(tablet_id)?;
        if tablet.replicas.len() != partition.replication_num as usize {
            return None;
        }
        let healthy = tablet.replicas.iter().all(|r| {
            r.state == ReplicaState::Normal && !r.bad && r.is_version_complete(physical.visible_version)
        });
        healthy.then(|| SchedulingContext::new(SchedType::Balance, meta, tablet_id, self.env.now_ms()))
    }
}

impl Rebalancer for LoadScoreRebalancer {
    fn name(&self) -> &'static str {
        "load_score"
    }

    fn update_load_statistic(&self, statistic: Arc<ClusterLoadStatistic>) {
        *self.statistic.write().expect("statistic lock") = Some(statistic);
    }

    fn update_config(&self, config: &SchedulerConfig) {
        self.set_options(BalanceOptions::from(config));
    }

    fn select_alternative_tablets(&self) -> Vec<SchedulingContext> {
        let Some(stat) = self.current() else {
            return Vec::new();
        };
        let options = *self.options.read().expect("options lock");
        self.prune_moves();

        let mut proposals = Vec::new();
        let mut moves = self.moves.lock().expect("moves lock");
        for medium in StorageMedium::ALL {
            let sorted: Vec<_> = stat
                .sorted_by_medium_score(medium)
                .into_iter()
                .filter(|b| b.available)
                .collect();
            let (Some(low), Some(high)) = (sorted.first(), sorted.last()) else {
                continue;
            };
            if low.backend_id == high.backend_id {
                continue;
            }
            let spread = high.load_score(medium) - low.load_score(medium);
            if spread <= options.load_score_threshold {
                continue;
            }
            debug!(
                %medium,
                high = high.backend_id,
                low = low.backend_id,
                spread,
                "load spread above threshold"
            );

            let low_hosts: HashSet<BackendId> = stat
                .backends
                .iter()
                .filter(|b| b.host == low.host)
                .map(|b| b.backend_id)
                .collect();

            for (tablet_id, replica) in self.env.catalog.replicas_on_backend(high.backend_id) {
                if proposals.len() >= options.max_balancing_tablets {
                    break;
                }
                if moves.contains_key(&tablet_id) {
                    continue;
                }
                if replica.state != ReplicaState::Normal || replica.bad {
                    continue;
                }
                let on_medium = replica
                    .path_hash
                    .and_then(|p| high.path(p))
                    .is_some_and(|p| p.medium == medium);
                if !on_medium {
                    continue;
                }
                let Some(mut ctx) = self.is_movable(tablet_id) else {
                    continue;
                };
                let Some(tablet) = self.env.catalog.tablet(tablet_id) else {
                    continue;
                };
                if tablet.replicas.iter().any(|r| low_hosts.contains(&r.backend_id)) {
                    continue;
                }
                let mv = BalanceMove {
                    src_backend: high.backend_id,
                    src_replica: replica.id,
                    dest_backend: low.backend_id,
                };
                ctx.set_balance_move(mv);
                ctx.set_storage_medium(medium);
                ctx.set_orig_priority(Priority::Low);
                moves.insert(tablet_id, mv);
                proposals.push(ctx);
            }
        }
        if !proposals.is_empty() {
            info!(strategy = self.name(), count = proposals.len(), "balance tablets selected");
        }
        proposals
    }

    fn create_balance_task(&self, ctx: &mut SchedulingContext, slots: &BackendSlots) -> SchedResult<AgentTask> {
        let Some(mv) = ctx.balance_move() else {
            return Err(SchedError::unrecoverable("balance move is not set"));
        };
        let Some(stat) = self.current() else {
            return Err(SchedError::retry("cluster load statistic is not ready"));
        };
        let options = *self.options.read().expect("options lock");
        let Some(tablet) = ctx.tablet().cloned() else {
            return Err(SchedError::Unexpected("tablet was not loaded".to_string()));
        };

        let visible = ctx.visible_version();
        let src_replica = tablet
            .replica(mv.src_replica)
            .filter(|r| r.backend_id == mv.src_backend)
            .filter(|r| r.state == ReplicaState::Normal && !r.bad && r.is_version_complete(visible))
            .ok_or_else(|| SchedError::unrecoverable("source replica changed"))?;
        if tablet.replica_by_backend(mv.dest_backend).is_some() {
            return Err(SchedError::unrecoverable("dest backend already has a replica"));
        }
        let dest_stat = stat
            .backend(mv.dest_backend)
            .filter(|b| b.available)
            .ok_or_else(|| SchedError::unrecoverable("dest backend is not available"))?;
        let src_path = src_replica
            .path_hash
            .ok_or_else(|| SchedError::unrecoverable("source replica has no path hash"))?;

        if slots.take(mv.src_backend, src_path).is_none() {
            return Err(SchedError::retry("source path is busy"));
        }
        ctx.set_src(mv.src_backend, src_path, src_replica.id);

        let medium = ctx.storage_medium().unwrap_or(StorageMedium::Hdd);
        let mut paths =
            dest_stat.fitting_paths(ctx.tablet_size(), medium, false, &options.fit_limits);
        if paths.is_empty() {
            return Err(SchedError::unrecoverable("no dest path fits the tablet"));
        }
        paths.sort_by(|a, b| a.used_percent().total_cmp(&b.used_percent()));
        let dest_path = paths
            .iter()
            .find_map(|p| slots.take(mv.dest_backend, p.path_hash))
            .ok_or_else(|| SchedError::retry("dest path is busy"))?;
        ctx.set_dest(mv.dest_backend, dest_path);

        let backends = self.env.cluster.backend_map();
        ctx.create_clone_replica_and_task(self.env.catalog.as_ref(), &backends)
    }

    /// A finished move stays recorded until its source replica is removed,
    /// so the redundant pass can pick it. Anything else forgets the move.
    fn on_finished(&self, ctx: &SchedulingContext, state: SchedState) {
        if ctx.sched_type() == SchedType::Balance && state == SchedState::Finished {
            return;
        }
        if let Some(mv) = self.moves.lock().expect("moves lock").remove(&ctx.tablet_id()) {
            debug!(
                tablet_id = ctx.tablet_id(),
                src_backend = mv.src_backend,
                dest_backend = mv.dest_backend,
                %state,
                "balance move forgotten"
            );
        }
    }

    fn replica_to_delete(&self, ctx: &SchedulingContext) -> Option<ReplicaId> {
        let mv = *self.moves.lock().expect("moves lock").get(&ctx.tablet_id())?;
        let tablet = ctx.tablet()?;
        let dest_ready = tablet
            .replica_by_backend(mv.dest_backend)
            .is_some_and(|r| r.state == ReplicaState::Normal);
        (dest_ready && tablet.replica(mv.src_replica).is_some()).then_some(mv.src_replica)
    }
}
