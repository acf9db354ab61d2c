//! Commands sent to storage agents, and their completion reports.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use tabletgrid_state::{
    BackendId, DbId, IndexId, PartitionId, PathHash, ReplicaId, StorageMedium, TableId, TabletId,
};

/// Where a clone copies from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSource {
    pub backend_id: BackendId,
    pub host: String,
    pub path_hash: PathHash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneTask {
    pub signature: u64,
    pub db_id: DbId,
    pub table_id: TableId,
    pub physical_partition_id: PartitionId,
    pub index_id: IndexId,
    pub tablet_id: TabletId,
    pub schema_hash: u32,
    pub storage_medium: StorageMedium,
    pub dest_backend_id: BackendId,
    pub dest_path_hash: PathHash,
    pub sources: Vec<TabletSource>,
    pub visible_version: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateReplicaTask {
    pub signature: u64,
    pub db_id: DbId,
    pub table_id: TableId,
    pub physical_partition_id: PartitionId,
    pub index_id: IndexId,
    pub tablet_id: TabletId,
    pub schema_hash: u32,
    pub storage_medium: StorageMedium,
    pub backend_id: BackendId,
    pub path_hash: PathHash,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropReplicaTask {
    pub signature: u64,
    pub backend_id: BackendId,
    pub tablet_id: TabletId,
    pub replica_id: ReplicaId,
    pub schema_hash: u32,
    /// Drop regardless of pending loads on the agent side.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentTask {
    Clone(CloneTask),
    CreateReplica(CreateReplicaTask),
    DropReplica(DropReplicaTask),
}

impl AgentTask {
    pub fn signature(&self) -> u64 {
        match self {
            AgentTask::Clone(t) => t.signature,
            AgentTask::CreateReplica(t) => t.signature,
            AgentTask::DropReplica(t) => t.signature,
        }
    }

    pub fn tablet_id(&self) -> TabletId {
        match self {
            AgentTask::Clone(t) => t.tablet_id,
            AgentTask::CreateReplica(t) => t.tablet_id,
            AgentTask::DropReplica(t) => t.tablet_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentTask::Clone(_) => "clone",
            AgentTask::CreateReplica(_) => "create_replica",
            AgentTask::DropReplica(_) => "drop_replica",
        }
    }
}

/// Replica state reported by the agent after a clone or create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedReplica {
    pub version: u64,
    pub row_count: u64,
    pub data_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum TaskStatus {
    Ok,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub reported: Option<ReportedReplica>,
    pub copy_size: u64,
    pub copy_time_ms: u64,
}

impl TaskResult {
    pub fn ok(reported: ReportedReplica, copy_time_ms: u64) -> Self {
        Self {
            status: TaskStatus::Ok,
            reported: Some(reported),
            copy_size: reported.data_size,
            copy_time_ms,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed(message.into()),
            reported: None,
            copy_size: 0,
            copy_time_ms: 0,
        }
    }
}

/// Fire-and-forget delivery of agent commands. Completion arrives later
/// through the scheduler's `finish_*` callbacks.
pub trait TaskDispatcher: Send + Sync {
    fn submit(&self, tasks: Vec<AgentTask>);
}

/// Dispatcher that only records what it was given.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    tasks: Mutex<Vec<AgentTask>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything submitted so far.
    pub fn take(&self) -> Vec<AgentTask> {
        std::mem::take(&mut *self.tasks.lock().expect("dispatcher lock"))
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("dispatcher lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskDispatcher for RecordingDispatcher {
    fn submit(&self, tasks: Vec<AgentTask>) {
        self.tasks.lock().expect("dispatcher lock").extend(tasks);
    }
}
