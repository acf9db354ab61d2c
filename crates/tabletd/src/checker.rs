//! Periodic tablet health checker.
//!
//! Walks every tablet in the catalog, classifies it against the current
//! membership view and admits unhealthy ones as REPAIR contexts. Tablets
//! the scheduler already tracks are skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use tabletgrid_core::Clock;
use tabletgrid_health::{ClassifyInput, Priority, TabletHealthStatus, classify, classify_colocate};
use tabletgrid_scheduler::{SchedulingContext, TabletScheduler};
use tabletgrid_state::{Backend, BackendId, Catalog, ClusterInfo, TabletId};

/// Longest a single admission may wait on a full pending queue.
const MAX_ADD_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckSummary {
    pub checked: usize,
    pub unhealthy: usize,
    pub added: usize,
}

pub struct HealthChecker {
    catalog: Arc<dyn Catalog>,
    cluster: Arc<dyn ClusterInfo>,
    scheduler: Arc<TabletScheduler>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        cluster: Arc<dyn ClusterInfo>,
        scheduler: Arc<TabletScheduler>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self { catalog, cluster, scheduler, clock, interval }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "health checker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let checker = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || checker.check_once()).await {
                        Ok(summary) if summary.added > 0 => {
                            info!(checked = summary.checked, unhealthy = summary.unhealthy, added = summary.added, "unhealthy tablets admitted");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "health check round failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("health checker shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over the catalog.
    pub fn check_once(&self) -> CheckSummary {
        let backends = self.cluster.backend_map();
        let now = self.clock.now_ms();
        let mut summary = CheckSummary::default();
        for tablet_id in self.catalog.tablet_ids() {
            if self.scheduler.contains_tablet(tablet_id) {
                continue;
            }
            summary.checked += 1;
            let Some((status, priority)) = self.check_tablet(tablet_id, &backends) else {
                continue;
            };
            if status == TabletHealthStatus::Healthy {
                continue;
            }
            summary.unhealthy += 1;
            if self.admit(tablet_id, status, priority, now) {
                summary.added += 1;
            }
        }
        summary
    }

    fn check_tablet(
        &self,
        tablet_id: TabletId,
        backends: &HashMap<BackendId, Backend>,
    ) -> Option<(TabletHealthStatus, Priority)> {
        let catalog = self.catalog.as_ref();
        let meta = catalog.tablet_meta(tablet_id)?;
        let table = catalog.table(meta.db_id, meta.table_id)?;
        let physical = catalog.physical_partition(meta.table_id, meta.physical_partition_id)?;
        let partition = catalog.partition(meta.table_id, physical.parent_id)?;
        let tablet = catalog.tablet(tablet_id)?;

        let input = ClassifyInput {
            replication_num: partition.replication_num as usize,
            visible_version: physical.visible_version,
            location: table.location.as_ref(),
            backends,
        };
        let colocate_set = table.colocate_group.and_then(|group| {
            let index = catalog.index(meta.physical_partition_id, meta.index_id)?;
            let bucket = index.tablet_order_idx(tablet_id)?;
            catalog.colocate_backends(group, bucket)
        });
        Some(match colocate_set {
            Some(set) => {
                let (status, _) = classify_colocate(&tablet, &set, &input);
                (status, Priority::High)
            }
            None => classify(&tablet, &input),
        })
    }

    fn admit(&self, tablet_id: TabletId, status: TabletHealthStatus, priority: Priority, now: u64) -> bool {
        let Some(meta) = self.catalog.tablet_meta(tablet_id) else {
            return false;
        };
        let Some(db_lock) = self.catalog.db_lock(meta.db_id) else {
            return false;
        };
        let ctx = SchedulingContext::repair(meta, tablet_id, status, priority, now);
        let guard = db_lock.read().expect("db lock");
        let (added, waited_ms, guard) = self.scheduler.blocking_add(&db_lock, guard, ctx, false, MAX_ADD_WAIT);
        drop(guard);
        if added {
            debug!(tablet_id, %status, ?priority, waited_ms, "unhealthy tablet found");
        } else {
            debug!(tablet_id, %status, waited_ms, "unhealthy tablet not admitted");
        }
        added
    }
}
