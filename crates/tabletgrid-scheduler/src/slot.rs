//! Per-path clone concurrency slots.
//!
//! Every disk path of every backend carries a bounded number of slots.
//! A clone acquires one slot on the source path and one on the
//! destination path before it is dispatched, and releases both when the
//! context is finalized or retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::debug;

use tabletgrid_state::{Backend, BackendId, PathHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub total: i32,
    pub available: i32,
    /// Bytes copied by finished clones touching this path.
    pub copy_size: u64,
    pub copy_time_ms: u64,
}

impl Slot {
    pub fn new(total: i32) -> Self {
        let mut slot = Self { total, available: total, copy_size: 0, copy_time_ms: 0 };
        slot.rectify();
        slot
    }

    pub fn rectify(&mut self) {
        if self.total <= 0 {
            self.total = 1;
        }
        self.available = self.available.clamp(0, self.total);
    }

    /// Bytes per second, zero until a copy time has been recorded.
    pub fn avg_rate(&self) -> u64 {
        if self.copy_time_ms / 1000 == 0 {
            return 0;
        }
        self.copy_size / (self.copy_time_ms / 1000)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SlotInfo {
    pub backend_id: BackendId,
    pub path_hash: PathHash,
    pub available: i32,
    pub total: i32,
    /// Bytes per second over finished clones.
    pub avg_rate: u64,
}

/// Slots of one backend, keyed by path hash.
#[derive(Debug)]
pub struct PathSlot {
    backend_id: BackendId,
    slots: Mutex<HashMap<PathHash, Slot>>,
}

impl PathSlot {
    pub fn new(backend_id: BackendId, paths: &[PathHash], slot_num: i32) -> Self {
        Self {
            backend_id,
            slots: Mutex::new(paths.iter().map(|p| (*p, Slot::new(slot_num))).collect()),
        }
    }

    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    /// Take one slot, returning the path hash on success. An unknown
    /// path or an exhausted one yields `None`.
    pub fn take_slot(&self, path_hash: PathHash) -> Option<PathHash> {
        let mut slots = self.slots.lock().expect("slot lock");
        let slot = slots.get_mut(&path_hash)?;
        if slot.available <= 0 {
            return None;
        }
        slot.available -= 1;
        Some(path_hash)
    }

    pub fn free_slot(&self, path_hash: PathHash) {
        let mut slots = self.slots.lock().expect("slot lock");
        if let Some(slot) = slots.get_mut(&path_hash) {
            slot.available += 1;
            slot.rectify();
        }
    }

    pub fn peek_slot(&self, path_hash: PathHash) -> Option<i32> {
        let slots = self.slots.lock().expect("slot lock");
        slots.get(&path_hash).map(|s| s.available)
    }

    /// Replace the tracked path set. Surviving paths keep their usage.
    pub fn update_paths(&self, paths: &[PathHash], slot_num: i32) {
        let mut slots = self.slots.lock().expect("slot lock");
        slots.retain(|p, _| paths.contains(p));
        for path in paths {
            slots.entry(*path).or_insert_with(|| Slot::new(slot_num));
        }
    }

    /// Shift both total and available of every path by `delta`.
    pub fn update_slot(&self, delta: i32) {
        let mut slots = self.slots.lock().expect("slot lock");
        for slot in slots.values_mut() {
            slot.total += delta;
            slot.available += delta;
            slot.rectify();
        }
    }

    pub fn update_statistic(&self, path_hash: PathHash, copy_size: u64, copy_time_ms: u64) {
        let mut slots = self.slots.lock().expect("slot lock");
        if let Some(slot) = slots.get_mut(&path_hash) {
            slot.copy_size += copy_size;
            slot.copy_time_ms += copy_time_ms;
        }
    }

    pub fn slot_info(&self) -> Vec<SlotInfo> {
        let slots = self.slots.lock().expect("slot lock");
        let mut infos: Vec<SlotInfo> = slots
            .iter()
            .map(|(path, slot)| SlotInfo {
                backend_id: self.backend_id,
                path_hash: *path,
                available: slot.available,
                total: slot.total,
                avg_rate: slot.avg_rate(),
            })
            .collect();
        infos.sort_by_key(|i| i.path_hash);
        infos
    }
}

/// Slot allocators of all backends.
#[derive(Debug, Default)]
pub struct BackendSlots {
    backends: RwLock<HashMap<BackendId, Arc<PathSlot>>>,
}

impl BackendSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, backend_id: BackendId) -> Option<Arc<PathSlot>> {
        self.backends.read().expect("slots lock").get(&backend_id).cloned()
    }

    /// Take a slot on `path_hash` of `backend_id`.
    pub fn take(&self, backend_id: BackendId, path_hash: PathHash) -> Option<PathHash> {
        self.get(backend_id)?.take_slot(path_hash)
    }

    pub fn free(&self, backend_id: BackendId, path_hash: PathHash) {
        if let Some(slot) = self.get(backend_id) {
            slot.free_slot(path_hash);
        }
    }

    /// Track membership: new backends get fresh slots, known backends
    /// refresh their path set, vanished backends are dropped.
    pub fn sync(&self, backends: &[Backend], slot_num: i32) {
        let mut map = self.backends.write().expect("slots lock");
        map.retain(|id, _| backends.iter().any(|b| b.id == *id));
        for backend in backends {
            let paths = backend.path_hashes();
            match map.get(&backend.id) {
                Some(slot) => slot.update_paths(&paths, slot_num),
                None => {
                    debug!(backend_id = backend.id, paths = paths.len(), "tracking backend slots");
                    map.insert(backend.id, Arc::new(PathSlot::new(backend.id, &paths, slot_num)));
                }
            }
        }
    }

    pub fn update_all(&self, delta: i32) {
        for slot in self.backends.read().expect("slots lock").values() {
            slot.update_slot(delta);
        }
    }

    pub fn slot_info(&self) -> Vec<SlotInfo> {
        let map = self.backends.read().expect("slots lock");
        let mut infos: Vec<SlotInfo> = map.values().flat_map(|s| s.slot_info()).collect();
        infos.sort_by_key(|i| (i.backend_id, i.path_hash));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletgrid_state::{DiskInfo, DiskState, StorageMedium};

    fn backend(id: BackendId, paths: &[PathHash]) -> Backend {
        Backend {
            id,
            host: format!("host{id}"),
            alive: true,
            decommissioned: false,
            location: None,
            disks: paths
                .iter()
                .map(|p| DiskInfo {
                    root_path: format!("/data{p}"),
                    path_hash: Some(*p),
                    medium: StorageMedium::Hdd,
                    state: DiskState::Online,
                    total_capacity_bytes: 100,
                    available_capacity_bytes: 100,
                    data_used_capacity_bytes: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn take_until_exhausted_then_free() {
        let slot = PathSlot::new(1, &[10], 2);
        assert_eq!(slot.take_slot(10), Some(10));
        assert_eq!(slot.take_slot(10), Some(10));
        assert_eq!(slot.take_slot(10), None);
        assert_eq!(slot.peek_slot(10), Some(0));
        slot.free_slot(10);
        assert_eq!(slot.peek_slot(10), Some(1));
    }

    #[test]
    fn unknown_path_has_no_slot() {
        let slot = PathSlot::new(1, &[10], 2);
        assert_eq!(slot.take_slot(99), None);
        assert_eq!(slot.peek_slot(99), None);
    }

    #[test]
    fn free_never_exceeds_total() {
        let slot = PathSlot::new(1, &[10], 2);
        slot.free_slot(10);
        slot.free_slot(10);
        assert_eq!(slot.peek_slot(10), Some(2));
    }

    #[test]
    fn delta_keeps_in_flight_usage() {
        let slot = PathSlot::new(1, &[10], 4);
        slot.take_slot(10);
        slot.update_slot(2);
        let info = &slot.slot_info()[0];
        assert_eq!((info.total, info.available), (6, 5));

        slot.update_slot(-5);
        let info = &slot.slot_info()[0];
        assert_eq!((info.total, info.available), (1, 0));
    }

    #[test]
    fn update_paths_keeps_surviving_usage() {
        let slot = PathSlot::new(1, &[10, 20], 4);
        slot.take_slot(10);
        slot.update_paths(&[10, 30], 4);
        assert_eq!(slot.peek_slot(10), Some(3));
        assert_eq!(slot.peek_slot(20), None);
        assert_eq!(slot.peek_slot(30), Some(4));
    }

    #[test]
    fn avg_rate_from_statistic() {
        let slot = PathSlot::new(1, &[10], 2);
        assert_eq!(slot.slot_info()[0].avg_rate, 0);
        slot.update_statistic(10, 10_000, 2_000);
        assert_eq!(slot.slot_info()[0].avg_rate, 5_000);
        assert_eq!(Slot { total: 1, available: 1, copy_size: 100, copy_time_ms: 500 }.avg_rate(), 0);
    }

    #[test]
    fn backend_slots_follow_membership() {
        let slots = BackendSlots::new();
        slots.sync(&[backend(1, &[10]), backend(2, &[20])], 2);
        assert_eq!(slots.take(1, 10), Some(10));
        assert_eq!(slots.take(3, 30), None);

        slots.sync(&[backend(1, &[10])], 2);
        assert!(slots.get(2).is_none());
        assert_eq!(slots.get(1).unwrap().peek_slot(10), Some(1));

        slots.free(1, 10);
        slots.update_all(1);
        let info = slots.slot_info();
        assert_eq!(info.len(), 1);
        assert_eq!((info[0].total, info[0].available), (3, 3));
    }
}
