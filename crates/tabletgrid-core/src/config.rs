//! tabletgrid.toml configuration parser.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lower bound for the per-path clone concurrency.
pub const MIN_SLOT_PER_PATH: i32 = 2;
/// Upper bound for the per-path clone concurrency.
pub const MAX_SLOT_PER_PATH: i32 = 64;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletGridConfig {
    pub scheduler: SchedulerConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8030 }
    }
}

/// Tunables of the tablet scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub schedule_interval_ms: u64,
    /// Cadence of the cluster load refresh and dynamic priority pass.
    pub stat_update_interval_ms: u64,
    pub slot_num_per_path: i32,
    /// Admission ceiling for repair work that is not forced.
    pub max_scheduling_tablets: usize,
    pub max_balancing_tablets: usize,
    pub disable_balance: bool,
    pub balance_load_score_threshold: f64,
    pub balance_max_failed_sched: u32,
    pub sched_failed_threshold: u32,
    pub running_failed_threshold: u32,
    pub adjust_priority_interval_ms: u64,
    pub recover_with_empty_tablet: bool,
    pub always_force_decommission_replica: bool,
    pub history_capacity: usize,
    pub blocking_add_sleep_ms: u64,
    pub min_clone_task_timeout_sec: u64,
    pub max_clone_task_timeout_sec: u64,
    pub clone_bytes_per_sec: u64,
    pub storage_high_watermark_usage_percent: f64,
    pub storage_min_left_capacity_bytes: u64,
    pub storage_flood_stage_usage_percent: f64,
    pub storage_flood_stage_left_capacity_bytes: u64,
    pub primary_key_disk_schedule_time_sec: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_interval_ms: 1_000,
            stat_update_interval_ms: 20_000,
            slot_num_per_path: 8,
            max_scheduling_tablets: 10_000,
            max_balancing_tablets: 500,
            disable_balance: false,
            balance_load_score_threshold: 0.1,
            balance_max_failed_sched: 10,
            sched_failed_threshold: 5,
            running_failed_threshold: 3,
            adjust_priority_interval_ms: 5 * 60 * 1_000,
            recover_with_empty_tablet: false,
            always_force_decommission_replica: false,
            history_capacity: 1_000,
            blocking_add_sleep_ms: 200,
            min_clone_task_timeout_sec: 3 * 60,
            max_clone_task_timeout_sec: 2 * 60 * 60,
            clone_bytes_per_sec: 5 * 1024 * 1024,
            storage_high_watermark_usage_percent: 85.0,
            storage_min_left_capacity_bytes: 2 * 1024 * 1024 * 1024,
            storage_flood_stage_usage_percent: 95.0,
            storage_flood_stage_left_capacity_bytes: 1024 * 1024 * 1024,
            primary_key_disk_schedule_time_sec: 3_600,
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("min_clone_task_timeout_sec ({min}) exceeds max_clone_task_timeout_sec ({max})")]
    TimeoutRange { min: u64, max: u64 },

    #[error("{field} must be within 0..=100, got {value}")]
    Percent { field: &'static str, value: f64 },
}

impl SchedulerConfig {
    /// Per-path slot capacity after clamping to the supported range.
    pub fn clamped_slot_num_per_path(&self) -> i32 {
        self.slot_num_per_path
            .clamp(MIN_SLOT_PER_PATH, MAX_SLOT_PER_PATH)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "schedule_interval_ms",
            });
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "history_capacity",
            });
        }
        if self.clone_bytes_per_sec == 0 {
            return Err(ConfigError::Zero {
                field: "clone_bytes_per_sec",
            });
        }
        if self.min_clone_task_timeout_sec > self.max_clone_task_timeout_sec {
            return Err(ConfigError::TimeoutRange {
                min: self.min_clone_task_timeout_sec,
                max: self.max_clone_task_timeout_sec,
            });
        }
        for (field, value) in [
            (
                "storage_high_watermark_usage_percent",
                self.storage_high_watermark_usage_percent,
            ),
            (
                "storage_flood_stage_usage_percent",
                self.storage_flood_stage_usage_percent,
            ),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Percent { field, value });
            }
        }
        Ok(())
    }
}

impl TabletGridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: TabletGridConfig = toml::from_str(content)?;
        config.scheduler.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
