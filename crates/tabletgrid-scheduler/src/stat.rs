//! Scheduler counters and their Prometheus exposition.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! counters {
    ($($name:ident => $help:literal),* $(,)?) => {
        /// Monotonic counters updated by the engine.
        #[derive(Debug, Default)]
        pub struct SchedulerStat {
            $(pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`SchedulerStat`].
        #[derive(Debug, Clone, Default, PartialEq, Serialize)]
        pub struct StatSnapshot {
            $(pub $name: u64,)*
        }

        impl SchedulerStat {
            pub fn snapshot(&self) -> StatSnapshot {
                StatSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }

        impl StatSnapshot {
            /// (name, help, value) for every counter.
            pub fn entries(&self) -> Vec<(&'static str, &'static str, u64)> {
                vec![$((stringify!($name), $help, self.$name),)*]
            }
        }
    };
}

counters! {
    schedule_rounds => "Scheduling ticks that ran",
    tablet_scheduled => "Scheduling attempts",
    tablet_scheduled_succeeded => "Attempts that dispatched work",
    tablet_scheduled_failed => "Attempts that will be retried",
    tablet_scheduled_discard => "Attempts that gave up on the tablet",
    tablet_finished => "Contexts whose work turned out done",
    unhealthy_tablet_added => "Repair contexts admitted",
    balance_tablet_added => "Balance contexts admitted",
    tablet_not_added => "Admissions rejected",
    clone_task => "Clone commands dispatched",
    clone_task_succeeded => "Clone reports that succeeded",
    clone_task_failed => "Clone reports that failed",
    clone_task_timeout => "Running contexts reaped by timeout",
    create_replica_task => "Empty replica commands dispatched",
    replica_missing_err => "REPLICA_MISSING attempts",
    replica_version_missing_err => "VERSION_INCOMPLETE and NEED_FURTHER_REPAIR attempts",
    replica_relocating_err => "REPLICA_RELOCATING attempts",
    replica_redundant_err => "REDUNDANT and FORCE_REDUNDANT attempts",
    replica_colocate_mismatch_err => "COLOCATE_MISMATCH attempts",
    replica_colocate_redundant_err => "COLOCATE_REDUNDANT attempts",
    replica_disk_migration_err => "DISK_MIGRATION attempts",
    replica_location_mismatch_err => "LOCATION_MISMATCH attempts",
    replica_decommissioned => "Replicas stamped DECOMMISSION",
    replica_deleted => "Redundant replicas deleted",
    unexpected_failure => "Contexts retired as UNEXPECTED",
}

impl SchedulerStat {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Queue sizes exposed as gauges next to the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueueGauges {
    pub pending: usize,
    pub running: usize,
    pub history: usize,
    pub balance: usize,
}

pub fn render_prometheus(stat: &StatSnapshot, gauges: &QueueGauges) -> String {
    let mut out = String::new();
    for (name, help, value) in stat.entries() {
        out.push_str(&format!("# HELP tabletgrid_scheduler_{name}_total {help}.\n"));
        out.push_str(&format!("# TYPE tabletgrid_scheduler_{name}_total counter\n"));
        out.push_str(&format!("tabletgrid_scheduler_{name}_total {value}\n"));
    }
    for (name, help, value) in [
        ("pending_tablets", "Contexts waiting to be scheduled", gauges.pending),
        ("running_tablets", "Contexts with a command in flight", gauges.running),
        ("history_tablets", "Finalized contexts retained", gauges.history),
        ("balance_tablets", "Balance contexts pending or running", gauges.balance),
    ] {
        out.push_str(&format!("# HELP tabletgrid_scheduler_{name} {help}.\n"));
        out.push_str(&format!("# TYPE tabletgrid_scheduler_{name} gauge\n"));
        out.push_str(&format!("tabletgrid_scheduler_{name} {value}\n"));
    }
    out
}
