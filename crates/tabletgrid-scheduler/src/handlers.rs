//! Repair handlers, one per health status, and destination selection.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use tabletgrid_core::SchedulerConfig;
use tabletgrid_health::{TabletHealthStatus, covered_locations, is_location_match};
use tabletgrid_placement::{BackendLoadStatistic, ClusterLoadStatistic, FitLimits, RootPathLoadStatistic};
use tabletgrid_state::{Backend, BackendId, ReplicaState, StorageMedium, Tablet};

use crate::context::SchedulingContext;
use crate::error::{SchedError, SchedResult, SchedStatus};
use crate::scheduler::TabletScheduler;
use crate::task::AgentTask;

impl TabletScheduler {
    fn require_load_statistic(&self) -> SchedResult<std::sync::Arc<ClusterLoadStatistic>> {
        self.load_statistic()
            .ok_or_else(|| SchedError::retry("cluster load statistic is not ready"))
    }

    pub(crate) fn handle_replica_missing(
        &self,
        ctx: &mut SchedulingContext,
        config: &SchedulerConfig,
    ) -> SchedResult<AgentTask> {
        let backends = self.env.cluster.backend_map();
        self.choose_available_dest_path(ctx, false, config)?;

        if config.recover_with_empty_tablet && ctx.replication_num == 1 && data_lost(ctx, &backends) {
            info!(tablet_id = ctx.tablet_id, "only replica is lost, recovering with an empty replica");
            return ctx.create_empty_replica_and_task(self.env.catalog.as_ref());
        }

        ctx.choose_src_replica(&self.slots, &backends)?;
        ctx.create_clone_replica_and_task(self.env.catalog.as_ref(), &backends)
    }

    pub(crate) fn handle_replica_version_incomplete(&self, ctx: &mut SchedulingContext) -> SchedResult<AgentTask> {
        self.require_load_statistic()?;
        let backends = self.env.cluster.backend_map();
        let flagged = ctx.choose_dest_for_version_incomplete(&self.slots, &backends)?;
        if flagged {
            debug!(tablet_id = ctx.tablet_id, "repairing replica flagged for further repair");
        }
        ctx.choose_src_replica(&self.slots, &backends)?;
        ctx.create_clone_replica_and_task(self.env.catalog.as_ref(), &backends)
    }

    /// Bring a lagging replica up to date if there is one, otherwise add
    /// a new replica elsewhere.
    pub(crate) fn handle_replica_relocating(
        &self,
        ctx: &mut SchedulingContext,
        config: &SchedulerConfig,
    ) -> SchedResult<AgentTask> {
        match self.handle_replica_version_incomplete(ctx) {
            Err(e) if matches!(e.status(), SchedStatus::ScheduleRetry | SchedStatus::Unrecoverable) => {
                debug!(tablet_id = ctx.tablet_id, reason = %e, "no replica to catch up, adding a new one");
                ctx.release_resource(&self.slots, self.env.catalog.as_ref(), true);
                self.handle_replica_missing(ctx, config)
            }
            other => other,
        }
    }

    pub(crate) fn handle_colocate_mismatch(
        &self,
        ctx: &mut SchedulingContext,
        config: &SchedulerConfig,
    ) -> SchedResult<AgentTask> {
        let backends = self.env.cluster.backend_map();
        self.choose_available_dest_path(ctx, true, config)?;
        ctx.choose_src_replica(&self.slots, &backends)?;
        ctx.create_clone_replica_and_task(self.env.catalog.as_ref(), &backends)
    }

    /// Drop the first replica outside the bucket's backend set. Bad
    /// replicas inside the set also go when another replica remains.
    pub(crate) fn handle_colocate_redundant(
        &self,
        ctx: &mut SchedulingContext,
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
            let backend_set = ctx
                .colocate_backends
                .clone()
                .ok_or_else(|| SchedError::unrecoverable("tablet is not colocated"))?;

            let candidate = tablet.replicas.iter().find(|r| {
                if backend_set.contains(&r.backend_id) {
                    r.bad && tablet.replicas.len() > 1
                } else {
                    true
                }
            });
            let Some(replica) = candidate.cloned() else {
                return Err(SchedError::unrecoverable("unable to delete any colocate redundant replicas"));
            };
            self.delete_replica_internal(ctx, &replica, "colocate redundant", replica.bad, config)?
        };
        if let Some(task) = drop_task {
            self.env.dispatcher.submit(vec![task]);
        }
        Err(SchedError::finished("colocate redundant replica is deleted"))
    }

    /// Move the replica off a decommissioned disk onto another path of
    /// the same backend.
    pub(crate) fn handle_disk_migration(
        &self,
        ctx: &mut SchedulingContext,
        config: &SchedulerConfig,
    ) -> SchedResult<AgentTask> {
        let stat = self.require_load_statistic()?;
        let backends = self.env.cluster.backend_map();
        let tablet = ctx
            .tablet
            .clone()
            .ok_or_else(|| SchedError::Unexpected(format!("tablet {} was not loaded", ctx.tablet_id)))?;

        let visible = ctx.visible_version;
        let source = tablet.replicas.iter().find_map(|r| {
            let backend = backends.get(&r.backend_id).filter(|b| b.is_available())?;
            let path = r.path_hash.filter(|p| backend.is_disk_decommissioned(*p))?;
            let stable = r.state == ReplicaState::Normal && !r.bad && r.is_version_complete(visible);
            stable.then_some((r.clone(), path))
        });
        let Some((replica, src_path)) = source else {
            return Err(SchedError::unrecoverable("unable to find replica on a decommissioned disk"));
        };
        let be_stat = stat
            .backend(replica.backend_id)
            .ok_or_else(|| SchedError::unrecoverable(format!("backend {} has no load statistic", replica.backend_id)))?;
        if be_stat.paths.len() < 2 {
            return Err(SchedError::unrecoverable(format!(
                "backend {} has only one path",
                replica.backend_id
            )));
        }

        if self.slots.take(replica.backend_id, src_path).is_none() {
            return Err(SchedError::retry("source path is busy"));
        }
        ctx.set_src(replica.backend_id, src_path, replica.id);

        let medium = be_stat
            .path(src_path)
            .map(|p| p.medium)
            .or(ctx.storage_medium)
            .unwrap_or(StorageMedium::Hdd);
        let limits = FitLimits::from(config);
        let Some(dest) = be_stat
            .paths_by_usage(medium)
            .into_iter()
            .find(|p| p.path_hash != src_path && p.fits(ctx.tablet_size, false, &limits))
        else {
            return Err(SchedError::unrecoverable("unable to find another path on the same backend"));
        };
        if self.slots.take(replica.backend_id, dest.path_hash).is_none() {
            return Err(SchedError::retry("dest path is busy"));
        }
        ctx.set_dest(replica.backend_id, dest.path_hash);
        debug!(
            tablet_id = ctx.tablet_id,
            backend_id = replica.backend_id,
            from = src_path,
            to = dest.path_hash,
            "migrating replica between disks"
        );
        ctx.create_clone_replica_and_task(self.env.catalog.as_ref(), &backends)
    }

    /// Choose a backend path for a new replica and take a slot on it.
    pub(crate) fn choose_available_dest_path(
        &self,
        ctx: &mut SchedulingContext,
        for_colocate: bool,
        config: &SchedulerConfig,
    ) -> SchedResult<()> {
        let stat = self.require_load_statistic()?;
        let backends = self.env.cluster.backend_map();
        let tablet = ctx
            .tablet
            .clone()
            .ok_or_else(|| SchedError::Unexpected(format!("tablet {} was not loaded", ctx.tablet_id)))?;

        let limits = FitLimits::from(config);
        let medium = ctx.storage_medium.unwrap_or(StorageMedium::Hdd);
        let is_supplement = !matches!(
            ctx.status,
            TabletHealthStatus::ReplicaRelocating | TabletHealthStatus::LocationMismatch
        );
        let replica_hosts: HashSet<&str> = tablet
            .replicas
            .iter()
            .filter_map(|r| backends.get(&r.backend_id))
            .map(|b| b.host.as_str())
            .collect();

        let mut candidates: Vec<&RootPathLoadStatistic> = Vec::new();
        for be in stat.sorted_by_mix_score() {
            if !be.available || tablet.replica_by_backend(be.backend_id).is_some() {
                continue;
            }
            if !for_colocate && replica_hosts.contains(be.host.as_str()) {
                continue;
            }
            if ctx.status == TabletHealthStatus::LocationMismatch && !dest_fits_location(ctx, be, &tablet, &backends) {
                continue;
            }
            if for_colocate && !ctx.colocate_backends.as_ref().is_some_and(|set| set.contains(&be.backend_id)) {
                continue;
            }
            candidates.extend(be.fitting_paths(ctx.tablet_size, medium, is_supplement, &limits));
        }
        if candidates.is_empty() {
            return Err(SchedError::unrecoverable("unable to find dest path for new replica"));
        }

        let (same_medium, other_medium): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|p| p.medium == medium);
        for path in same_medium.into_iter().chain(other_medium) {
            if let Some(path_hash) = self.slots.take(path.backend_id, path.path_hash) {
                ctx.set_dest(path.backend_id, path_hash);
                return Ok(());
            }
        }
        Err(SchedError::retry("path busy, wait for next round"))
    }
}

/// True when no replica of the tablet can still serve data.
fn data_lost(ctx: &SchedulingContext, backends: &HashMap<BackendId, Backend>) -> bool {
    ctx.tablet
        .as_ref()
        .is_some_and(|t| t.replicas.iter().all(|r| r.bad || !backends.contains_key(&r.backend_id)))
}

/// A destination for a location-mismatched tablet must match the
/// requirement and add a location the stable replicas do not cover yet.
fn dest_fits_location(
    ctx: &SchedulingContext,
    be: &BackendLoadStatistic,
    tablet: &Tablet,
    backends: &HashMap<BackendId, Backend>,
) -> bool {
    let Some(requirement) = ctx.required_location.as_ref() else {
        return true;
    };
    if !is_location_match(requirement, be.location.as_ref()) {
        return false;
    }
    let visible = ctx.visible_version;
    let stable = tablet
        .replicas
        .iter()
        .filter(|r| r.state == ReplicaState::Normal && !r.bad && r.is_version_complete(visible))
        .filter_map(|r| backends.get(&r.backend_id))
        .filter(|b| b.is_available());
    let covered = covered_locations(requirement, stable);
    be.location.as_ref().is_some_and(|loc| !covered.contains(loc))
}
