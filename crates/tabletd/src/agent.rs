//! Simulated storage agent.
//!
//! Commands leave the scheduler through a channel. The agent completes
//! each clone and create command after a fixed delay, reporting the
//! partition's current visible version, and hands the result back to the
//! scheduler's completion callbacks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tabletgrid_scheduler::{AgentTask, ReportedReplica, TabletScheduler, TaskDispatcher, TaskResult};
use tabletgrid_state::{Catalog, MemoryCatalog, PartitionId, TableId, TabletId};

/// Forwards submitted commands to the agent task.
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<AgentTask>,
}

pub fn channel() -> (ChannelDispatcher, mpsc::UnboundedReceiver<AgentTask>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelDispatcher { tx }, rx)
}

impl TaskDispatcher for ChannelDispatcher {
    fn submit(&self, tasks: Vec<AgentTask>) {
        for task in tasks {
            let signature = task.signature();
            if self.tx.send(task).is_err() {
                warn!(signature, "agent channel closed, task dropped");
            }
        }
    }
}

pub struct SimulatedAgent {
    catalog: Arc<MemoryCatalog>,
    scheduler: Arc<TabletScheduler>,
    delay: Duration,
}

impl SimulatedAgent {
    pub fn new(catalog: Arc<MemoryCatalog>, scheduler: Arc<TabletScheduler>, delay: Duration) -> Self {
        Self { catalog, scheduler, delay }
    }

    /// Consume commands until the channel closes or `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<AgentTask>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(delay_ms = self.delay.as_millis() as u64, "simulated agent started");
        loop {
            tokio::select! {
                task = rx.recv() => {
                    let Some(task) = task else {
                        break;
                    };
                    let agent = Arc::clone(&self);
                    tokio::spawn(async move {
                        tokio::time::sleep(agent.delay).await;
                        agent.complete(task);
                    });
                }
                _ = shutdown.changed() => {
                    info!("simulated agent shutting down");
                    break;
                }
            }
        }
    }

    /// Finish one command as a healthy storage node would.
    pub fn complete(&self, task: AgentTask) {
        let copy_time_ms = self.delay.as_millis() as u64;
        match task {
            AgentTask::Clone(clone) => {
                let reported = self.report(clone.tablet_id, clone.table_id, clone.physical_partition_id);
                debug!(
                    tablet_id = clone.tablet_id,
                    backend_id = clone.dest_backend_id,
                    version = reported.version,
                    "clone done"
                );
                self.scheduler
                    .finish_clone_task(&clone, &TaskResult::ok(reported, copy_time_ms));
            }
            AgentTask::CreateReplica(create) => {
                let mut reported = self.report(create.tablet_id, create.table_id, create.physical_partition_id);
                reported.data_size = 0;
                reported.row_count = 0;
                debug!(tablet_id = create.tablet_id, backend_id = create.backend_id, "empty replica created");
                self.scheduler
                    .finish_create_replica_task(&create, &TaskResult::ok(reported, copy_time_ms));
            }
            AgentTask::DropReplica(drop) => {
                info!(
                    tablet_id = drop.tablet_id,
                    replica_id = drop.replica_id,
                    backend_id = drop.backend_id,
                    "replica dropped on backend"
                );
            }
        }
    }

    /// The copy a clone leaves behind: the partition's visible version and
    /// the size of the largest existing replica.
    fn report(&self, tablet_id: TabletId, table_id: TableId, physical_partition_id: PartitionId) -> ReportedReplica {
        let version = self
            .catalog
            .physical_partition(table_id, physical_partition_id)
            .map_or(0, |p| p.visible_version);
        let (data_size, row_count) = self
            .catalog
            .tablet(tablet_id)
            .map(|t| {
                let size = t.data_size();
                let rows = t.replicas.iter().map(|r| r.row_count).max().unwrap_or(0);
                (size, rows)
            })
            .unwrap_or_default();
        ReportedReplica { version, row_count, data_size }
    }
}
