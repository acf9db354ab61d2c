//! Priority-ordered pending queue.
//!
//! Higher dynamic priority is scheduled first; among equal priorities the
//! context visited longest ago wins.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::context::SchedulingContext;

struct Queued(SchedulingContext);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .dynamic_priority
            .cmp(&other.0.dynamic_priority)
            .then_with(|| other.0.last_visited_time_ms.cmp(&self.0.last_visited_time_ms))
    }
}

#[derive(Default)]
pub struct PendingQueue {
    heap: BinaryHeap<Queued>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ctx: SchedulingContext) {
        self.heap.push(Queued(ctx));
    }

    pub fn pop(&mut self) -> Option<SchedulingContext> {
        self.heap.pop().map(|q| q.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn drain(&mut self) -> Vec<SchedulingContext> {
        self.heap.drain().map(|q| q.0).collect()
    }

    /// Apply `f` to every context and rebuild the heap order.
    pub fn update_all(&mut self, mut f: impl FnMut(&mut SchedulingContext)) {
        let mut items = self.drain();
        for ctx in &mut items {
            f(ctx);
        }
        self.heap = items.into_iter().map(Queued).collect();
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchedulingContext> {
        self.heap.iter().map(|q| &q.0)
    }

    /// Contexts in scheduling order, without consuming the queue.
    pub fn sorted(&self) -> Vec<&SchedulingContext> {
        let mut items: Vec<&Queued> = self.heap.iter().collect();
        items.sort_by(|a, b| b.cmp(a));
        items.into_iter().map(|q| &q.0).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SchedType;
    use tabletgrid_health::Priority;
    use tabletgrid_state::TabletMeta;

    fn ctx(tablet_id: u64, priority: Priority, last_visited: u64) -> SchedulingContext {
        let meta = TabletMeta { db_id: 1, table_id: 2, physical_partition_id: 3, index_id: 4 };
        let mut ctx = SchedulingContext::new(SchedType::Repair, meta, tablet_id, 0);
        ctx.set_orig_priority(priority);
        ctx.last_visited_time_ms = last_visited;
        ctx
    }

    #[test]
    fn pops_by_priority_then_oldest_visit() {
        let mut queue = PendingQueue::new();
        queue.push(ctx(1, Priority::Normal, 10));
        queue.push(ctx(2, Priority::VeryHigh, 50));
        queue.push(ctx(3, Priority::Normal, 5));
        queue.push(ctx(4, Priority::Low, 0));
        queue.push(ctx(5, Priority::High, 0));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|c| c.tablet_id()).collect();
        assert_eq!(order, vec![2, 5, 3, 1, 4]);
    }

    #[test]
    fn update_all_reorders() {
        let mut queue = PendingQueue::new();
        queue.push(ctx(1, Priority::High, 0));
        queue.push(ctx(2, Priority::Low, 0));
        queue.update_all(|c| {
            if c.tablet_id() == 2 {
                c.set_orig_priority(Priority::VeryHigh);
            }
        });
        let sorted: Vec<u64> = queue.sorted().iter().map(|c| c.tablet_id()).collect();
        assert_eq!(sorted, vec![2, 1]);
        assert_eq!(queue.pop().map(|c| c.tablet_id()), Some(2));
        assert_eq!(queue.len(), 1);
    }
}
