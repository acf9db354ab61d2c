//! Redundant replica removal.
//!
//! Candidates are tried in a fixed order and the first match is removed:
//!
//! ```text
//!  1 backend dropped         6 last failed version set
//!  2 replica bad             7 version not caught up
//!  3 backend unavailable     8 sharing a host (higher load goes)
//!  4 CLONE / DECOMMISSION    9 nominated by the balance strategy
//!  5 location mismatch      10 highest load score
//! ```
//!
//! Deletion is two-phase unless forced. The first pass stamps the replica
//! with the next transaction id and flips it to DECOMMISSION; a later
//! pass deletes it once every transaction started before the stamp has
//! finished.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, error, info};

use tabletgrid_core::SchedulerConfig;
use tabletgrid_health::{Priority, is_location_match};
use tabletgrid_placement::ClusterLoadStatistic;
use tabletgrid_state::{
    Backend, BackendId, Location, Replica, ReplicaOp, ReplicaPersistInfo, ReplicaState, Tablet,
};

use crate::context::SchedulingContext;
use crate::error::{SchedError, SchedResult};
use crate::scheduler::TabletScheduler;
use crate::stat::SchedulerStat;
use crate::task::{AgentTask, DropReplicaTask};

impl TabletScheduler {
    pub(crate) fn handle_redundant_replica(
        &self,
        ctx: &mut SchedulingContext,
        force: bool,
        config: &SchedulerConfig,
    ) -> SchedResult<AgentTask> {
        let db_lock = self
            .env
            .catalog
            .db_lock(ctx.db_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("db {} does not exist", ctx.db_id)))?;
        let drop_task = {
            let _guard = db_lock.write().expect("db lock");
            self.refresh_meta(ctx)?;
            let tablet = ctx
                .tablet
                .clone()
                .ok_or_else(|| SchedError::Unexpected(format!("tablet {} was not loaded", ctx.tablet_id)))?;
            let backends = self.env.cluster.backend_map();
            let stat = self.load_statistic();

            let Some((replica, reason)) = self.choose_redundant_replica(ctx, &tablet, &backends, stat.as_deref())
            else {
                return Err(SchedError::unrecoverable("unable to delete any redundant replicas"));
            };
            self.delete_replica_internal(ctx, &replica, reason, force, config)?
        };
        if let Some(task) = drop_task {
            self.env.dispatcher.submit(vec![task]);
        }
        Err(SchedError::finished("redundant replica is deleted"))
    }

    fn choose_redundant_replica(
        &self,
        ctx: &SchedulingContext,
        tablet: &Tablet,
        backends: &HashMap<BackendId, Backend>,
        stat: Option<&ClusterLoadStatistic>,
    ) -> Option<(Replica, &'static str)> {
        let replicas = &tablet.replicas;

        if let Some(r) = first(replicas, |r| !backends.contains_key(&r.backend_id)) {
            return Some((r, "backend dropped"));
        }
        if let Some(r) = first(replicas, |r| r.bad) {
            return Some((r, "replica bad"));
        }
        if let Some(r) = first(replicas, |r| backends.get(&r.backend_id).is_some_and(|b| !b.is_available())) {
            return Some((r, "backend unavailable"));
        }
        if let Some(r) = first(replicas, |r| matches!(r.state, ReplicaState::Clone | ReplicaState::Decommission)) {
            return Some((r, "clone or decommission state"));
        }
        if let Some(found) = location_redundant(ctx, replicas, backends) {
            return Some(found);
        }
        if let Some(r) = first(replicas, |r| r.last_failed_version.is_some()) {
            return Some((r, "version lost"));
        }
        if let Some(r) = first(replicas, |r| !r.check_version_catch_up(ctx.visible_version)) {
            return Some((r, "version incomplete"));
        }
        if let Some(r) = same_host_redundant(replicas, backends, stat) {
            return Some((r, "same host"));
        }
        if let Some(r) = self
            .rebalancer
            .replica_to_delete(ctx)
            .and_then(|id| tablet.replica(id).cloned())
        {
            return Some((r, "balance source"));
        }
        high_load_redundant(ctx, replicas, stat).map(|r| (r, "high load"))
    }

    /// Remove one replica, or stamp it for removal on a later pass.
    ///
    /// Returns the drop command to send when the delete was forced.
    pub(crate) fn delete_replica_internal(
        &self,
        ctx: &mut SchedulingContext,
        replica: &Replica,
        reason: &str,
        force: bool,
        config: &SchedulerConfig,
    ) -> SchedResult<Option<AgentTask>> {
        let force = force || config.always_force_decommission_replica;
        let catalog = self.env.catalog.as_ref();

        if !force && replica.state.can_load() && replica.watermark_txn_id.is_none() {
            let txn_id = self.env.txn_manager.next_transaction_id();
            catalog.update_replica(ctx.tablet_id, replica.id, &mut |r| {
                r.watermark_txn_id = Some(txn_id);
                r.state = ReplicaState::Decommission;
            });
            if ctx.decommissioned_replica.is_some_and(|id| id != replica.id) {
                ctx.reset_decommissioned_replica(catalog);
            }
            ctx.decommissioned_replica = Some(replica.id);
            ctx.set_orig_priority(Priority::Normal);
            SchedulerStat::inc(&self.stat.replica_decommissioned);
            info!(
                tablet_id = ctx.tablet_id,
                replica_id = replica.id,
                backend_id = replica.backend_id,
                txn_id,
                reason,
                "redundant replica stamped for removal"
            );
            return Err(SchedError::retry(format!("set watermark txn {txn_id}")));
        }

        if replica.state == ReplicaState::Decommission {
            if let Some(watermark) = replica.watermark_txn_id {
                match self
                    .env
                    .txn_manager
                    .is_previous_transactions_finished(watermark, ctx.db_id, &[ctx.table_id])
                {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(tablet_id = ctx.tablet_id, watermark, "waiting for earlier transactions");
                        return Err(SchedError::retry(format!("wait txn before {watermark}")));
                    }
                    Err(e) => {
                        return Err(SchedError::unrecoverable(format!("failed to check transactions: {e}")));
                    }
                }
            }
        }

        // The delete is journaled first. A failed append leaves the catalog
        // untouched and the next pass tries again.
        let current = catalog
            .tablet(ctx.tablet_id)
            .and_then(|t| t.replica_by_backend(replica.backend_id).cloned())
            .ok_or_else(|| SchedError::unrecoverable(format!("replica {} does not exist", replica.id)))?;
        let record = ReplicaPersistInfo::new(ReplicaOp::Delete, ctx.meta(), ctx.tablet_id, &current);
        if let Err(e) = self.env.edit_log.log_replica(&record) {
            error!(
                tablet_id = ctx.tablet_id,
                replica_id = current.id,
                backend_id = current.backend_id,
                error = %e,
                "failed to journal replica delete, replica kept"
            );
            return Err(SchedError::retry(format!("failed to journal replica delete: {e}")));
        }
        let deleted = catalog
            .delete_replica(ctx.tablet_id, current.backend_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("replica {} does not exist", current.id)))?;
        if ctx.decommissioned_replica == Some(deleted.id) {
            ctx.decommissioned_replica = None;
        }
        SchedulerStat::inc(&self.stat.replica_deleted);
        info!(
            tablet_id = ctx.tablet_id,
            replica_id = deleted.id,
            backend_id = deleted.backend_id,
            reason,
            force,
            "redundant replica deleted"
        );

        Ok(force.then(|| {
            AgentTask::DropReplica(DropReplicaTask {
                signature: catalog.next_id(),
                backend_id: deleted.backend_id,
                tablet_id: ctx.tablet_id,
                replica_id: deleted.id,
                schema_hash: ctx.schema_hash,
                force: true,
            })
        }))
    }
}

fn first(replicas: &[Replica], pred: impl Fn(&Replica) -> bool) -> Option<Replica> {
    replicas.iter().find(|&r| pred(r)).cloned()
}

/// A replica outside the required locations, or a second replica in a
/// location already covered. Only considered when enough matching
/// backends exist to host every replica.
fn location_redundant(
    ctx: &SchedulingContext,
    replicas: &[Replica],
    backends: &HashMap<BackendId, Backend>,
) -> Option<(Replica, &'static str)> {
    let requirement = ctx.required_location.as_ref().filter(|r| !r.is_empty())?;
    let matched = backends
        .values()
        .filter(|b| b.is_available() && is_location_match(requirement, b.location.as_ref()))
        .count();
    if matched < ctx.replication_num {
        return None;
    }

    let location_of = |r: &Replica| backends.get(&r.backend_id).and_then(|b| b.location.clone());
    if let Some(r) = replicas
        .iter()
        .find(|r| !is_location_match(requirement, location_of(r).as_ref()))
    {
        return Some((r.clone(), "location mismatch"));
    }

    let mut seen: BTreeSet<Location> = BTreeSet::new();
    for replica in replicas {
        if let Some(location) = location_of(replica) {
            if !seen.insert(location) {
                return Some((replica.clone(), "duplicate location"));
            }
        }
    }
    None
}

/// Of two replicas sharing a host, the one on the more loaded backend.
fn same_host_redundant(
    replicas: &[Replica],
    backends: &HashMap<BackendId, Backend>,
    stat: Option<&ClusterLoadStatistic>,
) -> Option<Replica> {
    let mut by_host: HashMap<&str, Vec<&Replica>> = HashMap::new();
    for replica in replicas {
        if let Some(backend) = backends.get(&replica.backend_id) {
            by_host.entry(backend.host.as_str()).or_default().push(replica);
        }
    }
    let score = |r: &Replica| {
        stat.and_then(|s| s.backend(r.backend_id))
            .map_or(0.0, |b| b.mix_load_score)
    };
    let mut shared: Vec<&Replica> = by_host.into_values().filter(|v| v.len() > 1).flatten().collect();
    shared.sort_by(|a, b| score(b).total_cmp(&score(a)).then(a.id.cmp(&b.id)));
    shared.first().map(|r| (*r).clone())
}

/// The replica on the backend with the highest positive load score.
fn high_load_redundant(
    ctx: &SchedulingContext,
    replicas: &[Replica],
    stat: Option<&ClusterLoadStatistic>,
) -> Option<Replica> {
    let stat = stat?;
    let score = |r: &Replica| {
        let be = stat.backend(r.backend_id)?;
        Some(match ctx.storage_medium {
            Some(medium) if be.has_medium(medium) => be.load_score(medium),
            _ => be.mix_load_score,
        })
    };
    replicas
        .iter()
        .filter_map(|r| score(r).map(|s| (s, r)))
        .filter(|(s, _)| *s > 0.0)
        .max_by(|(a, ra), (b, rb)| a.total_cmp(b).then(rb.id.cmp(&ra.id)))
        .map(|(_, r)| r.clone())
}
