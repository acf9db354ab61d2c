//! tabletgrid-scheduler — tablet repair and balance scheduling.
//!
//! ```text
//!  health checker ───add_tablet──▶ ┌─────────────────┐  AgentTask  ┌────────────┐
//!  balance strategy ─────────────▶ │ TabletScheduler │ ──────────▶ │ dispatcher │
//!                                  │  pending heap   │             └─────┬──────┘
//!                                  │  running map    │ ◀── finish_* ─────┘
//!                                  │  history ring   │
//!                                  └────────┬────────┘
//!                                           │
//!                                           ▼
//!                      BackendSlots · Catalog · EditLog · TxnManager
//! ```
//!
//! Each tick pops every pending context, re-reads the catalog under the
//! database read lock, re-classifies the tablet and runs the handler for
//! its status. Handlers either produce a command (the context moves to
//! running) or fail with a [`SchedError`] whose kind decides between
//! retry and a terminal state.

pub mod context;
pub mod env;
pub mod error;
mod handlers;
pub mod query;
pub mod queue;
pub mod rebalancer;
mod redundant;
pub mod scheduler;
pub mod slot;
pub mod stat;
pub mod task;

pub use context::{BalanceMove, Endpoint, SchedState, SchedType, SchedulingContext, TabletBrief};
pub use env::SchedEnv;
pub use error::{SchedError, SchedResult, SchedStatus};
pub use query::{AllowAll, PrivilegeChecker, ScheduleQuery};
pub use queue::PendingQueue;
pub use rebalancer::{BalanceOptions, LoadScoreRebalancer, Rebalancer};
pub use scheduler::{AddResult, TabletScheduler};
pub use slot::{BackendSlots, PathSlot, Slot, SlotInfo};
pub use stat::{QueueGauges, SchedulerStat, StatSnapshot, render_prometheus};
pub use task::{
    AgentTask, CloneTask, CreateReplicaTask, DropReplicaTask, RecordingDispatcher, ReportedReplica,
    TabletSource, TaskDispatcher, TaskResult, TaskStatus,
};
