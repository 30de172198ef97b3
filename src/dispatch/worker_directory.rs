//! # Worker Directory
//!
//! Bookkeeping for the worker tasks owned by one Shiftboss: bus client id,
//! NUMA node hint, and the count of work orders currently queued on each. The
//! directory has a single writer (the owning Shiftboss loop) and is
//! append-only; worker indices stay stable for the lifetime of the node.

use crate::bus::ClientId;

/// One worker task's entry.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    client_id: ClientId,
    numa_node: i32,
    num_queued_work_orders: usize,
}

impl WorkerEntry {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn numa_node(&self) -> i32 {
        self.numa_node
    }

    pub fn num_queued_work_orders(&self) -> usize {
        self.num_queued_work_orders
    }
}

/// Stable-index roster of a node's workers.
#[derive(Debug, Default)]
pub struct WorkerDirectory {
    workers: Vec<WorkerEntry>,
}

impl WorkerDirectory {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
        }
    }

    /// Appends a worker and returns its stable index. `numa_node` is -1 when
    /// the worker is not pinned.
    pub fn add_worker(&mut self, client_id: ClientId, numa_node: i32) -> usize {
        self.workers.push(WorkerEntry {
            client_id,
            numa_node,
            num_queued_work_orders: 0,
        });
        self.workers.len() - 1
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, index: usize) -> Option<&WorkerEntry> {
        self.workers.get(index)
    }

    pub fn client_id(&self, index: usize) -> Option<ClientId> {
        self.workers.get(index).map(|entry| entry.client_id)
    }

    pub fn increment_queued(&mut self, index: usize) {
        if let Some(entry) = self.workers.get_mut(index) {
            entry.num_queued_work_orders += 1;
        }
    }

    pub fn decrement_queued(&mut self, index: usize) {
        if let Some(entry) = self.workers.get_mut(index) {
            entry.num_queued_work_orders = entry.num_queued_work_orders.saturating_sub(1);
        }
    }

    /// Total work orders queued across all workers.
    pub fn total_queued(&self) -> usize {
        self.workers
            .iter()
            .map(|entry| entry.num_queued_work_orders)
            .sum()
    }

    /// Index of the worker with the fewest queued work orders. Ties go to the
    /// smallest index; the scan only moves on strict improvement.
    pub fn least_loaded_worker(&self) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (index, entry) in self.workers.iter().enumerate() {
            match best {
                Some((_, load)) if entry.num_queued_work_orders >= load => {}
                _ => best = Some((index, entry.num_queued_work_orders)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// Index of the worker with the most queued work orders, smallest index
    /// on ties.
    pub fn most_loaded_worker(&self) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (index, entry) in self.workers.iter().enumerate() {
            match best {
                Some((_, load)) if entry.num_queued_work_orders <= load => {}
                _ => best = Some((index, entry.num_queued_work_orders)),
            }
        }
        best.map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_with_loads(loads: &[usize]) -> WorkerDirectory {
        let mut directory = WorkerDirectory::new();
        for (index, &load) in loads.iter().enumerate() {
            directory.add_worker(100 + index as ClientId, -1);
            for _ in 0..load {
                directory.increment_queued(index);
            }
        }
        directory
    }

    #[test]
    fn test_add_worker_assigns_stable_indices() {
        let mut directory = WorkerDirectory::new();
        assert_eq!(directory.add_worker(10, 0), 0);
        assert_eq!(directory.add_worker(11, 1), 1);
        assert_eq!(directory.add_worker(12, -1), 2);
        assert_eq!(directory.num_workers(), 3);
        assert_eq!(directory.client_id(1), Some(11));
        assert_eq!(directory.worker(2).unwrap().numa_node(), -1);
    }

    #[test]
    fn test_least_loaded_prefers_smallest_index_on_tie() {
        let directory = directory_with_loads(&[2, 1, 1, 3]);
        assert_eq!(directory.least_loaded_worker(), Some(1));
    }

    #[test]
    fn test_most_loaded_prefers_smallest_index_on_tie() {
        let directory = directory_with_loads(&[3, 1, 3, 2]);
        assert_eq!(directory.most_loaded_worker(), Some(0));
    }

    #[test]
    fn test_empty_directory_has_no_extremes() {
        let directory = WorkerDirectory::new();
        assert_eq!(directory.least_loaded_worker(), None);
        assert_eq!(directory.most_loaded_worker(), None);
    }

    #[test]
    fn test_extremes_agree_with_naive_scan() {
        use proptest::prelude::*;

        proptest!(ProptestConfig::with_cases(64), |(loads in proptest::collection::vec(0usize..10, 1..16))| {
            let directory = directory_with_loads(&loads);

            let naive_least = loads
                .iter()
                .enumerate()
                .min_by_key(|&(index, &load)| (load, index))
                .map(|(index, _)| index);
            let naive_most = loads
                .iter()
                .enumerate()
                .max_by_key(|&(index, &load)| (load, std::cmp::Reverse(index)))
                .map(|(index, _)| index);

            prop_assert_eq!(directory.least_loaded_worker(), naive_least);
            prop_assert_eq!(directory.most_loaded_worker(), naive_most);
        });
    }

    #[test]
    fn test_decrement_saturates_at_zero() {
        let mut directory = directory_with_loads(&[0]);
        directory.decrement_queued(0);
        assert_eq!(directory.worker(0).unwrap().num_queued_work_orders(), 0);
        directory.increment_queued(0);
        directory.decrement_queued(0);
        assert_eq!(directory.total_queued(), 0);
    }
}
