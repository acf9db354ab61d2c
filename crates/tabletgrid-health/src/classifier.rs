//! Tablet health classification.
//!
//! Replicas are counted in three nested tiers:
//!
//! ```text
//! alive     backend in membership and alive, replica not bad, not CLONE,
//!           first replica on its host
//! complete  alive + no failed version + caught up to the visible version
//! stable    complete + backend available + replica not DECOMMISSION
//! ```
//!
//! The tiers are compared against the desired replica count in a fixed
//! precedence; the first shortfall or surplus decides the status.

use std::collections::{BTreeSet, HashMap, HashSet};

use tabletgrid_state::{Backend, BackendId, LocationRequirement, ReplicaState, Tablet};

use crate::location::{covered_locations, is_location_match};
use crate::status::{Priority, TabletHealthStatus};

/// Everything the classifier needs besides the tablet itself.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub replication_num: usize,
    pub visible_version: u64,
    pub location: Option<&'a LocationRequirement>,
    /// Membership view; backends absent here are treated as dropped.
    pub backends: &'a HashMap<BackendId, Backend>,
}

pub fn classify(tablet: &Tablet, input: &ClassifyInput<'_>) -> (TabletHealthStatus, Priority) {
    let replication_num = input.replication_num.max(1);
    let quorum = replication_num / 2 + 1;
    let alive_backends = input.backends.values().filter(|b| b.alive).count();

    let mut hosts: HashSet<&str> = HashSet::new();
    let mut on_alive_backends = 0;
    let mut alive = 0;
    let mut complete = 0;
    let mut stable = 0;
    let mut flagged = false;
    let mut on_decommissioned_disk = false;
    let mut stable_backends: Vec<&Backend> = Vec::new();

    for replica in &tablet.replicas {
        let Some(backend) = input.backends.get(&replica.backend_id) else {
            continue;
        };
        if !backend.alive {
            continue;
        }
        on_alive_backends += 1;
        if replica.bad
            || replica.state == ReplicaState::Clone
            || !hosts.insert(backend.host.as_str())
        {
            continue;
        }
        alive += 1;

        if !replica.is_version_complete(input.visible_version) {
            continue;
        }
        complete += 1;
        flagged |= replica.need_further_repair;

        if !backend.is_available() || replica.state == ReplicaState::Decommission {
            continue;
        }
        stable += 1;
        stable_backends.push(backend);
        if replica
            .path_hash
            .is_some_and(|p| backend.is_disk_decommissioned(p))
        {
            on_decommissioned_disk = true;
        }
    }

    // Existing replicas occupy every alive backend, so one has to go
    // before a new one can be placed. Single-replica tablets are left to
    // operators.
    if alive < replication_num
        && on_alive_backends >= alive_backends
        && alive_backends >= replication_num
        && replication_num > 1
    {
        return (TabletHealthStatus::ForceRedundant, Priority::VeryHigh);
    }
    if alive < quorum {
        return (TabletHealthStatus::ReplicaMissing, Priority::High);
    }
    if alive < replication_num {
        return (TabletHealthStatus::ReplicaMissing, Priority::Normal);
    }

    if complete < quorum {
        return (TabletHealthStatus::VersionIncomplete, Priority::High);
    }
    if complete < replication_num {
        return (TabletHealthStatus::VersionIncomplete, Priority::Normal);
    }
    if complete > replication_num {
        if flagged {
            return (TabletHealthStatus::NeedFurtherRepair, Priority::High);
        }
        return (TabletHealthStatus::Redundant, Priority::VeryHigh);
    }

    if stable < replication_num {
        let priority = if stable < quorum { Priority::High } else { Priority::Normal };
        return (TabletHealthStatus::ReplicaRelocating, priority);
    }

    if let Some(requirement) = input.location.filter(|r| !r.is_empty()) {
        if location_mismatch(requirement, &stable_backends, input.backends, replication_num) {
            return (TabletHealthStatus::LocationMismatch, Priority::Low);
        }
    }

    if on_decommissioned_disk {
        return (TabletHealthStatus::DiskMigration, Priority::Normal);
    }

    if tablet.replicas.len() > replication_num {
        return (TabletHealthStatus::Redundant, Priority::VeryHigh);
    }

    if flagged {
        return (TabletHealthStatus::NeedFurtherRepair, Priority::High);
    }

    (TabletHealthStatus::Healthy, Priority::Normal)
}

/// A stable replica violates the requirement while enough matching
/// backends exist, or fewer distinct locations are covered than the
/// cluster could provide.
fn location_mismatch(
    requirement: &LocationRequirement,
    stable_backends: &[&Backend],
    backends: &HashMap<BackendId, Backend>,
    replication_num: usize,
) -> bool {
    let available: Vec<&Backend> = backends.values().filter(|b| b.is_available()).collect();
    let matched_available = available
        .iter()
        .filter(|b| is_location_match(requirement, b.location.as_ref()))
        .count();
    let violating = stable_backends
        .iter()
        .any(|b| !is_location_match(requirement, b.location.as_ref()));
    if violating && matched_available >= replication_num {
        return true;
    }
    let covered = covered_locations(requirement, stable_backends.iter().copied()).len();
    let achievable = covered_locations(requirement, available).len().min(replication_num);
    covered < achievable
}

/// Classify a colocated tablet against the backend set its bucket is
/// pinned to.
pub fn classify_colocate(
    tablet: &Tablet,
    backend_set: &BTreeSet<BackendId>,
    input: &ClassifyInput<'_>,
) -> (TabletHealthStatus, Priority) {
    let replica_backends = tablet.backend_ids();
    if backend_set.iter().any(|be| !replica_backends.contains(be)) {
        return (TabletHealthStatus::ColocateMismatch, Priority::High);
    }

    let in_set = tablet
        .replicas
        .iter()
        .filter(|r| backend_set.contains(&r.backend_id));
    for replica in in_set {
        if replica.bad && tablet.replicas.len() > 1 {
            return (TabletHealthStatus::ColocateRedundant, Priority::High);
        }
        if !replica.is_version_complete(input.visible_version) {
            return (TabletHealthStatus::VersionIncomplete, Priority::High);
        }
    }

    if tablet.replicas.len() > input.replication_num.max(1) {
        return (TabletHealthStatus::ColocateRedundant, Priority::High);
    }

    (TabletHealthStatus::Healthy, Priority::High)
}
