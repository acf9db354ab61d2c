//! Cluster topology bootstrap.
//!
//! A topology file lists backends, databases and tables. Each table gets
//! one logical partition per entry in `partitions`, one physical partition
//! and base index per logical partition, and `buckets` tablets per index.
//! Replicas are laid out round-robin over the alive backends, or along the
//! bucket backend sets of the table's colocate group.
//!
//! ```toml
//! [[backends]]
//! id = 1
//! host = "10.0.0.1"
//! alive = true
//! [[backends.disks]]
//! root_path = "/data1"
//! medium = "HDD"
//! total_capacity_bytes = 107374182400
//! available_capacity_bytes = 96636764160
//!
//! [[databases]]
//! id = 1
//! name = "sales"
//!
//! [[tables]]
//! id = 10
//! db_id = 1
//! name = "orders"
//! buckets = 4
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::{info, warn};

use tabletgrid_core::path_hash;
use tabletgrid_state::{
    Backend, BackendId, ColocateGroupId, Database, DbId, JournalStore, KeysType, LocationRequirement,
    MaterializedIndex, MemoryCatalog, MemoryCluster, Partition, PhysicalPartition, Replica,
    StorageMedium, Table, TableId, Tablet, TabletMeta,
};

/// First id handed out to generated catalog objects.
const FIRST_GENERATED_ID: u64 = 1_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub backends: Vec<Backend>,
    pub databases: Vec<Database>,
    pub tables: Vec<TableSpec>,
    pub colocate_groups: Vec<ColocateGroupSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableSpec {
    pub id: TableId,
    pub db_id: DbId,
    pub name: String,
    #[serde(default)]
    pub keys_type: KeysType,
    #[serde(default = "default_partitions")]
    pub partitions: Vec<String>,
    #[serde(default = "default_replication_num")]
    pub replication_num: u16,
    #[serde(default = "default_medium")]
    pub storage_medium: StorageMedium,
    #[serde(default = "default_buckets")]
    pub buckets: usize,
    #[serde(default = "default_visible_version")]
    pub visible_version: u64,
    #[serde(default)]
    pub colocate_group: Option<ColocateGroupId>,
    #[serde(default)]
    pub location: Option<LocationRequirement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColocateGroupSpec {
    pub id: ColocateGroupId,
    /// Backend set per bucket.
    pub buckets: Vec<BTreeSet<BackendId>>,
}

fn default_partitions() -> Vec<String> {
    vec!["p0".to_string()]
}

fn default_replication_num() -> u16 {
    3
}

fn default_medium() -> StorageMedium {
    StorageMedium::Hdd
}

fn default_buckets() -> usize {
    1
}

fn default_visible_version() -> u64 {
    1
}

/// What [`Topology::load_into`] produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub backends: usize,
    pub tables: usize,
    pub tablets: usize,
    pub replicas: usize,
}

impl Topology {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read topology {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut topology: Topology = toml::from_str(content)?;
        topology.fill_path_hashes();
        topology.validate()?;
        Ok(topology)
    }

    /// Backends that omit a path hash get one derived from host and path.
    fn fill_path_hashes(&mut self) {
        for backend in &mut self.backends {
            for disk in &mut backend.disks {
                if disk.path_hash.is_none() {
                    disk.path_hash = Some(path_hash(&backend.host, &disk.root_path));
                }
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for table in &self.tables {
            if !self.databases.iter().any(|d| d.id == table.db_id) {
                bail!("table {} refers to unknown database {}", table.name, table.db_id);
            }
            if table.replication_num == 0 {
                bail!("table {} must have at least one replica", table.name);
            }
            if let Some(group) = table.colocate_group {
                let Some(spec) = self.colocate_groups.iter().find(|g| g.id == group) else {
                    bail!("table {} refers to unknown colocate group {group}", table.name);
                };
                if spec.buckets.len() != table.buckets {
                    bail!(
                        "table {} has {} buckets but colocate group {group} has {}",
                        table.name,
                        table.buckets,
                        spec.buckets.len()
                    );
                }
            }
        }
        Ok(())
    }

    pub fn load_into(&self, catalog: &MemoryCatalog, cluster: &MemoryCluster) -> LoadSummary {
        let mut summary = LoadSummary::default();
        for backend in &self.backends {
            cluster.upsert(backend.clone());
            summary.backends += 1;
        }
        for db in &self.databases {
            catalog.add_database(db.clone());
        }
        for group in &self.colocate_groups {
            catalog.set_colocate_backends(group.id, group.buckets.clone());
        }

        let placeable: Vec<&Backend> = self.backends.iter().filter(|b| b.alive).collect();
        let mut next_id = FIRST_GENERATED_ID;
        let mut alloc = || {
            next_id += 1;
            next_id
        };
        let mut rr = 0usize;

        for spec in &self.tables {
            catalog.add_table(Table {
                id: spec.id,
                db_id: spec.db_id,
                name: spec.name.clone(),
                state: Default::default(),
                keys_type: spec.keys_type,
                colocate_group: spec.colocate_group,
                location: spec.location.clone(),
            });
            summary.tables += 1;
            let group = spec
                .colocate_group
                .and_then(|g| self.colocate_groups.iter().find(|c| c.id == g));

            for name in &spec.partitions {
                let partition_id = alloc();
                let physical_id = alloc();
                let index_id = alloc();
                catalog.add_partition(Partition {
                    id: partition_id,
                    table_id: spec.id,
                    name: name.clone(),
                    state: Default::default(),
                    replication_num: spec.replication_num,
                    storage_medium: spec.storage_medium,
                });
                catalog.add_physical_partition(PhysicalPartition {
                    id: physical_id,
                    parent_id: partition_id,
                    table_id: spec.id,
                    visible_version: spec.visible_version,
                    visible_version_time_ms: 0,
                    committed_version: spec.visible_version,
                    visible_txn_id: 0,
                });
                catalog.add_index(MaterializedIndex {
                    id: index_id,
                    physical_partition_id: physical_id,
                    schema_hash: (spec.id as u32).wrapping_mul(31).wrapping_add(index_id as u32),
                    tablets: vec![],
                });
                let meta = TabletMeta {
                    db_id: spec.db_id,
                    table_id: spec.id,
                    physical_partition_id: physical_id,
                    index_id,
                };

                for bucket in 0..spec.buckets {
                    let hosts: Vec<&Backend> = match group {
                        Some(g) => self
                            .backends
                            .iter()
                            .filter(|b| g.buckets[bucket].contains(&b.id))
                            .take(spec.replication_num as usize)
                            .collect(),
                        None if placeable.is_empty() => Vec::new(),
                        None => (0..(spec.replication_num as usize).min(placeable.len()))
                            .map(|i| placeable[(rr + i) % placeable.len()])
                            .collect(),
                    };
                    rr += 1;
                    let replicas: Vec<Replica> = hosts
                        .iter()
                        .map(|b| Replica::new(alloc(), b.id, disk_for(b, spec.storage_medium), spec.visible_version))
                        .collect();
                    summary.replicas += replicas.len();
                    catalog.add_tablet(meta, Tablet { id: alloc(), replicas });
                    summary.tablets += 1;
                }
            }
        }
        catalog.reserve_ids_through(next_id);
        summary
    }
}

/// First path on the backend with the wanted medium, else its first path.
fn disk_for(backend: &Backend, medium: StorageMedium) -> Option<u64> {
    backend
        .disks
        .iter()
        .find(|d| d.medium == medium)
        .or_else(|| backend.disks.first())
        .and_then(|d| d.path_hash)
}

/// Re-apply the journal on top of the freshly loaded topology. Ids used by
/// replayed replicas are reserved so new replicas never collide with them.
pub fn replay_journal(journal: &JournalStore, catalog: &MemoryCatalog) -> anyhow::Result<usize> {
    let records = journal.records_since(0)?;
    if let Some(max_id) = records.iter().map(|(_, info)| info.replica_id).max() {
        catalog.reserve_ids_through(max_id);
    }
    let applied = journal.replay(catalog)?;
    if applied < records.len() {
        warn!(total = records.len(), applied, "some journal records no longer match the topology");
    }
    info!(applied, "journal applied to catalog");
    Ok(applied)
}
