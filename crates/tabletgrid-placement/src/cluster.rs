//! Cluster-wide load snapshot.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tabletgrid_state::{Backend, BackendId, Catalog, ClusterInfo, StorageMedium};

use crate::load::{BackendLoadStatistic, RootPathLoadStatistic};

/// Immutable view of per-backend utilization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterLoadStatistic {
    pub backends: Vec<BackendLoadStatistic>,
    /// Cluster-wide used fraction per medium.
    pub used_percent: BTreeMap<StorageMedium, f64>,
    pub created_at_ms: u64,
}

impl ClusterLoadStatistic {
    /// Build from membership and the replica placement in the catalog.
    ///
    /// Replicas are attributed to the medium of the disk they sit on,
    /// falling back to the backend's first disk when the path is unknown.
    pub fn build(cluster: &dyn ClusterInfo, catalog: &dyn Catalog, now_ms: u64) -> Self {
        let backends: Vec<Backend> = cluster.backends().into_iter().filter(|b| b.alive).collect();
        let mut counts: HashMap<BackendId, BTreeMap<StorageMedium, u64>> = HashMap::new();
        for backend in &backends {
            let per_medium = counts.entry(backend.id).or_default();
            let fallback = backend.disks.first().map(|d| d.medium);
            for (_, replica) in catalog.replicas_on_backend(backend.id) {
                let medium = replica
                    .path_hash
                    .and_then(|p| backend.disk(p))
                    .map(|d| d.medium)
                    .or(fallback);
                if let Some(medium) = medium {
                    *per_medium.entry(medium).or_default() += 1;
                }
            }
        }
        Self::from_parts(&backends, &counts, now_ms)
    }

    pub fn from_parts(
        backends: &[Backend],
        replica_counts: &HashMap<BackendId, BTreeMap<StorageMedium, u64>>,
        now_ms: u64,
    ) -> Self {
        let mut stats: Vec<BackendLoadStatistic> = backends
            .iter()
            .map(|be| BackendLoadStatistic {
                backend_id: be.id,
                host: be.host.clone(),
                available: be.is_available(),
                location: be.location.clone(),
                paths: be
                    .disks
                    .iter()
                    .filter_map(|d| {
                        d.path_hash.map(|hash| RootPathLoadStatistic {
                            backend_id: be.id,
                            path_hash: hash,
                            root_path: d.root_path.clone(),
                            medium: d.medium,
                            state: d.state,
                            capacity_bytes: d.total_capacity_bytes,
                            used_capacity_bytes: d.used_capacity_bytes(),
                        })
                    })
                    .collect(),
                replica_counts: replica_counts.get(&be.id).cloned().unwrap_or_default(),
                load_scores: BTreeMap::new(),
                mix_load_score: 0.0,
            })
            .collect();

        let mut used_percent = BTreeMap::new();
        for medium in StorageMedium::ALL {
            let members: Vec<usize> = (0..stats.len())
                .filter(|i| stats[*i].has_medium(medium))
                .collect();
            if members.is_empty() {
                continue;
            }
            let total_capacity: u64 = members.iter().map(|i| stats[*i].capacity_bytes(medium)).sum();
            let total_used: u64 = members.iter().map(|i| stats[*i].used_capacity_bytes(medium)).sum();
            let total_replicas: u64 = members.iter().map(|i| stats[*i].replica_count(medium)).sum();

            let cluster_used = if total_capacity == 0 {
                0.0
            } else {
                total_used as f64 / total_capacity as f64
            };
            used_percent.insert(medium, cluster_used);
            let avg_replicas = total_replicas as f64 / members.len() as f64;
            let coefficient = (2.0 * cluster_used - 0.5).clamp(0.5, 1.0);

            for i in members {
                let be = &mut stats[i];
                let capacity = be.capacity_bytes(medium);
                let be_used = if capacity == 0 {
                    0.0
                } else {
                    be.used_capacity_bytes(medium) as f64 / capacity as f64
                };
                let used_ratio = if cluster_used > 0.0 { be_used / cluster_used } else { 0.0 };
                let replica_ratio = if avg_replicas > 0.0 {
                    be.replica_count(medium) as f64 / avg_replicas
                } else {
                    0.0
                };
                let score = coefficient * used_ratio + (1.0 - coefficient) * replica_ratio;
                be.load_scores.insert(medium, score);
            }
        }

        for be in &mut stats {
            if !be.load_scores.is_empty() {
                be.mix_load_score =
                    be.load_scores.values().sum::<f64>() / be.load_scores.len() as f64;
            }
        }

        debug!(backends = stats.len(), "cluster load statistic built");
        Self {
            backends: stats,
            used_percent,
            created_at_ms: now_ms,
        }
    }

    pub fn backend(&self, backend_id: BackendId) -> Option<&BackendLoadStatistic> {
        self.backends.iter().find(|b| b.backend_id == backend_id)
    }

    /// Backends ordered by mixed load score, least loaded first.
    pub fn sorted_by_mix_score(&self) -> Vec<&BackendLoadStatistic> {
        let mut sorted: Vec<&BackendLoadStatistic> = self.backends.iter().collect();
        sorted.sort_by(|a, b| {
            a.mix_load_score
                .total_cmp(&b.mix_load_score)
                .then(a.backend_id.cmp(&b.backend_id))
        });
        sorted
    }

    /// Backends holding `medium`, least loaded first by that medium's score.
    pub fn sorted_by_medium_score(&self, medium: StorageMedium) -> Vec<&BackendLoadStatistic> {
        let mut sorted: Vec<&BackendLoadStatistic> =
            self.backends.iter().filter(|b| b.has_medium(medium)).collect();
        sorted.sort_by(|a, b| {
            a.load_score(medium)
                .total_cmp(&b.load_score(medium))
                .then(a.backend_id.cmp(&b.backend_id))
        });
        sorted
    }

    /// One line per medium for periodic logging.
    pub fn brief(&self) -> String {
        let mut parts = Vec::new();
        for (medium, used) in &self.used_percent {
            let scores: Vec<String> = self
                .sorted_by_medium_score(*medium)
                .iter()
                .map(|b| format!("{}={:.3}", b.backend_id, b.load_score(*medium)))
                .collect();
            parts.push(format!(
                "{medium}: used {:.1}% [{}]",
                used * 100.0,
                scores.join(", ")
            ));
        }
        parts.join("; ")
    }
}
