//! Health statuses and scheduling priorities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a tablet's placement relative to its desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabletHealthStatus {
    Healthy,
    ReplicaMissing,
    VersionIncomplete,
    NeedFurtherRepair,
    ReplicaRelocating,
    Redundant,
    ForceRedundant,
    ColocateMismatch,
    ColocateRedundant,
    DiskMigration,
    LocationMismatch,
}

impl TabletHealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TabletHealthStatus::Healthy => "HEALTHY",
            TabletHealthStatus::ReplicaMissing => "REPLICA_MISSING",
            TabletHealthStatus::VersionIncomplete => "VERSION_INCOMPLETE",
            TabletHealthStatus::NeedFurtherRepair => "NEED_FURTHER_REPAIR",
            TabletHealthStatus::ReplicaRelocating => "REPLICA_RELOCATING",
            TabletHealthStatus::Redundant => "REDUNDANT",
            TabletHealthStatus::ForceRedundant => "FORCE_REDUNDANT",
            TabletHealthStatus::ColocateMismatch => "COLOCATE_MISMATCH",
            TabletHealthStatus::ColocateRedundant => "COLOCATE_REDUNDANT",
            TabletHealthStatus::DiskMigration => "DISK_MIGRATION",
            TabletHealthStatus::LocationMismatch => "LOCATION_MISMATCH",
        }
    }
}

impl fmt::Display for TabletHealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    VeryHigh,
}

impl Priority {
    /// One level lower, never below `Low`.
    pub fn downgrade(self) -> Priority {
        match self {
            Priority::VeryHigh => Priority::High,
            Priority::High => Priority::Normal,
            Priority::Normal | Priority::Low => Priority::Low,
        }
    }

    /// One level higher, stopping at `limit`. A priority already at or
    /// above `limit` is kept.
    pub fn upgrade_toward(self, limit: Priority) -> Priority {
        if self >= limit {
            return self;
        }
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::VeryHigh => Priority::VeryHigh,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::VeryHigh => "VERY_HIGH",
        };
        f.write_str(s)
    }
}
