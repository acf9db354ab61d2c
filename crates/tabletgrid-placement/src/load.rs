//! Per-backend and per-path load statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tabletgrid_core::SchedulerConfig;
use tabletgrid_state::{BackendId, DiskState, Location, PathHash, StorageMedium};

/// Capacity thresholds a path must stay under after receiving a replica.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitLimits {
    pub high_watermark_usage_percent: f64,
    pub min_left_capacity_bytes: u64,
    /// Relaxed limits for replicas that replace a missing one.
    pub flood_stage_usage_percent: f64,
    pub flood_stage_left_capacity_bytes: u64,
}

impl Default for FitLimits {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for FitLimits {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            high_watermark_usage_percent: config.storage_high_watermark_usage_percent,
            min_left_capacity_bytes: config.storage_min_left_capacity_bytes,
            flood_stage_usage_percent: config.storage_flood_stage_usage_percent,
            flood_stage_left_capacity_bytes: config.storage_flood_stage_left_capacity_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootPathLoadStatistic {
    pub backend_id: BackendId,
    pub path_hash: PathHash,
    pub root_path: String,
    pub medium: StorageMedium,
    pub state: DiskState,
    pub capacity_bytes: u64,
    pub used_capacity_bytes: u64,
}

impl RootPathLoadStatistic {
    pub fn used_percent(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 1.0;
        }
        self.used_capacity_bytes as f64 / self.capacity_bytes as f64
    }

    /// Whether the path can take `tablet_size` more bytes.
    pub fn fits(&self, tablet_size: u64, is_supplement: bool, limits: &FitLimits) -> bool {
        if self.state != DiskState::Online || self.capacity_bytes == 0 {
            return false;
        }
        let used_after = self.used_capacity_bytes.saturating_add(tablet_size);
        let left_after = self.capacity_bytes.saturating_sub(used_after);
        let percent_after = used_after as f64 * 100.0 / self.capacity_bytes as f64;
        let (max_percent, min_left) = if is_supplement {
            (limits.flood_stage_usage_percent, limits.flood_stage_left_capacity_bytes)
        } else {
            (limits.high_watermark_usage_percent, limits.min_left_capacity_bytes)
        };
        percent_after <= max_percent && left_after >= min_left
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendLoadStatistic {
    pub backend_id: BackendId,
    pub host: String,
    pub available: bool,
    pub location: Option<Location>,
    pub paths: Vec<RootPathLoadStatistic>,
    pub replica_counts: BTreeMap<StorageMedium, u64>,
    pub load_scores: BTreeMap<StorageMedium, f64>,
    pub mix_load_score: f64,
}

impl BackendLoadStatistic {
    pub fn has_medium(&self, medium: StorageMedium) -> bool {
        self.paths.iter().any(|p| p.medium == medium)
    }

    /// Score for one medium; zero when the backend has none of it.
    pub fn load_score(&self, medium: StorageMedium) -> f64 {
        self.load_scores.get(&medium).copied().unwrap_or(0.0)
    }

    pub fn path(&self, path_hash: PathHash) -> Option<&RootPathLoadStatistic> {
        self.paths.iter().find(|p| p.path_hash == path_hash)
    }

    pub fn capacity_bytes(&self, medium: StorageMedium) -> u64 {
        self.paths
            .iter()
            .filter(|p| p.medium == medium)
            .map(|p| p.capacity_bytes)
            .sum()
    }

    pub fn used_capacity_bytes(&self, medium: StorageMedium) -> u64 {
        self.paths
            .iter()
            .filter(|p| p.medium == medium)
            .map(|p| p.used_capacity_bytes)
            .sum()
    }

    pub fn replica_count(&self, medium: StorageMedium) -> u64 {
        self.replica_counts.get(&medium).copied().unwrap_or(0)
    }

    /// Paths able to hold a new replica of `tablet_size` bytes.
    ///
    /// Supplement replicas use the flood-stage limit and accept any
    /// medium; other replicas must match `medium`.
    pub fn fitting_paths(
        &self,
        tablet_size: u64,
        medium: StorageMedium,
        is_supplement: bool,
        limits: &FitLimits,
    ) -> Vec<&RootPathLoadStatistic> {
        self.paths
            .iter()
            .filter(|p| is_supplement || p.medium == medium)
            .filter(|p| p.fits(tablet_size, is_supplement, limits))
            .collect()
    }

    /// Online paths of one medium, least used first.
    pub fn paths_by_usage(&self, medium: StorageMedium) -> Vec<&RootPathLoadStatistic> {
        let mut paths: Vec<&RootPathLoadStatistic> = self
            .paths
            .iter()
            .filter(|p| p.medium == medium && p.state == DiskState::Online)
            .collect();
        paths.sort_by(|a, b| a.used_percent().total_cmp(&b.used_percent()));
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn path(hash: PathHash, medium: StorageMedium, capacity: u64, used: u64) -> RootPathLoadStatistic {
        RootPathLoadStatistic {
            backend_id: 1,
            path_hash: hash,
            root_path: format!("/data{hash}"),
            medium,
            state: DiskState::Online,
            capacity_bytes: capacity,
            used_capacity_bytes: used,
        }
    }

    #[test]
    fn fit_respects_high_watermark() {
        let limits = FitLimits::default();
        let p = path(1, StorageMedium::Hdd, 100 * GB, 80 * GB);
        assert!(p.fits(GB, false, &limits));
        // 86% after the copy.
        assert!(!p.fits(6 * GB, false, &limits));
        // Supplement replicas may go up to the flood stage.
        assert!(p.fits(6 * GB, true, &limits));
        assert!(!p.fits(16 * GB, true, &limits));
    }

    #[test]
    fn offline_path_never_fits() {
        let mut p = path(1, StorageMedium::Hdd, 100 * GB, 0);
        p.state = DiskState::Offline;
        assert!(!p.fits(0, true, &FitLimits::default()));
    }

    #[test]
    fn fitting_paths_filter_medium_unless_supplement() {
        let be = BackendLoadStatistic {
            backend_id: 1,
            host: "h1".to_string(),
            available: true,
            location: None,
            paths: vec![
                path(1, StorageMedium::Hdd, 100 * GB, 10 * GB),
                path(2, StorageMedium::Ssd, 100 * GB, 10 * GB),
            ],
            replica_counts: BTreeMap::new(),
            load_scores: BTreeMap::new(),
            mix_load_score: 0.0,
        };
        let limits = FitLimits::default();
        assert_eq!(be.fitting_paths(GB, StorageMedium::Ssd, false, &limits).len(), 1);
        assert_eq!(be.fitting_paths(GB, StorageMedium::Ssd, true, &limits).len(), 2);
        assert!(be.has_medium(StorageMedium::Ssd));
        assert_eq!(be.capacity_bytes(StorageMedium::Hdd), 100 * GB);
        assert_eq!(be.load_score(StorageMedium::Hdd), 0.0);
    }

    #[test]
    fn paths_by_usage_sorts_ascending() {
        let be = BackendLoadStatistic {
            backend_id: 1,
            host: "h1".to_string(),
            available: true,
            location: None,
            paths: vec![
                path(1, StorageMedium::Hdd, 100 * GB, 70 * GB),
                path(2, StorageMedium::Hdd, 100 * GB, 20 * GB),
                path(3, StorageMedium::Hdd, 100 * GB, 40 * GB),
            ],
            replica_counts: BTreeMap::new(),
            load_scores: BTreeMap::new(),
            mix_load_score: 0.0,
        };
        let order: Vec<PathHash> = be
            .paths_by_usage(StorageMedium::Hdd)
            .iter()
            .map(|p| p.path_hash)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }
}
