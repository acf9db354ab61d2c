//! Filtered lookup over pending, running and history contexts.

use serde::{Deserialize, Serialize};

use tabletgrid_state::{DbId, PartitionId, TableId, TabletId};

use crate::context::{SchedState, SchedType, SchedulingContext};

/// Visibility check applied per table when a caller names a user.
pub trait PrivilegeChecker: Send + Sync {
    fn can_see_table(&self, user: &str, db_id: DbId, table_id: TableId) -> bool;
}

/// Every user sees every table.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PrivilegeChecker for AllowAll {
    fn can_see_table(&self, _user: &str, _db_id: DbId, _table_id: TableId) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleQuery {
    pub db_id: Option<DbId>,
    pub table_id: Option<TableId>,
    /// Matches either the logical or the physical partition id.
    pub partition_id: Option<PartitionId>,
    pub tablet_id: Option<TabletId>,
    pub state: Option<SchedState>,
    #[serde(rename = "type")]
    pub sched_type: Option<SchedType>,
    pub user: Option<String>,
    pub limit: Option<usize>,
}

impl ScheduleQuery {
    pub fn matches(&self, ctx: &SchedulingContext, privileges: &dyn PrivilegeChecker) -> bool {
        if self.db_id.is_some_and(|id| id != ctx.db_id) {
            return false;
        }
        if self.table_id.is_some_and(|id| id != ctx.table_id) {
            return false;
        }
        if let Some(id) = self.partition_id {
            if id != ctx.physical_partition_id && Some(id) != ctx.partition_id {
                return false;
            }
        }
        if self.tablet_id.is_some_and(|id| id != ctx.tablet_id) {
            return false;
        }
        if self.state.is_some_and(|s| s != ctx.state) {
            return false;
        }
        if self.sched_type.is_some_and(|t| t != ctx.sched_type) {
            return false;
        }
        match &self.user {
            Some(user) => privileges.can_see_table(user, ctx.db_id, ctx.table_id),
            None => true,
        }
    }
}
