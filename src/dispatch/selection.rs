//! # Worker Selection Policies
//!
//! Pluggable strategies a Shiftboss uses to pick which worker receives the
//! next work order. All policies read the live [`WorkerDirectory`], so a
//! roster that grows between calls is picked up immediately.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{DispatchError, Result};

use super::worker_directory::WorkerDirectory;

/// Strategy seam for work-order placement. Policy objects live inside a
/// spawned dispatch task, so they must be safe to hold across awaits.
pub trait WorkerSelectionPolicy: Send + Sync {
    /// Picks the index of the worker that should run the next work order.
    /// The directory is guaranteed non-empty by construction-time checks,
    /// but policies re-read its size on every call.
    fn next_worker_index(&mut self, directory: &WorkerDirectory) -> usize;
}

fn ensure_workers(directory: &WorkerDirectory) -> Result<()> {
    if directory.is_empty() {
        return Err(DispatchError::Configuration {
            message: "worker selection requires at least one worker".into(),
        });
    }
    Ok(())
}

/// Cycles through worker indices starting at a caller-chosen worker. The
/// successor of each pick is computed against the roster size at pick time,
/// so a worker appended after pick N-1 is selected next.
pub struct RoundRobinPolicy {
    start_index: usize,
    previous_index: Option<usize>,
}

impl RoundRobinPolicy {
    /// `start_index` is the first worker this policy will pick.
    pub fn new(directory: &WorkerDirectory, start_index: usize) -> Result<Self> {
        ensure_workers(directory)?;
        if start_index >= directory.num_workers() {
            return Err(DispatchError::Configuration {
                message: format!(
                    "round robin start index {start_index} is out of range for {} workers",
                    directory.num_workers()
                ),
            });
        }
        Ok(Self {
            start_index,
            previous_index: None,
        })
    }
}

impl WorkerSelectionPolicy for RoundRobinPolicy {
    fn next_worker_index(&mut self, directory: &WorkerDirectory) -> usize {
        let chosen = match self.previous_index {
            None => self.start_index,
            Some(previous) => (previous + 1) % directory.num_workers(),
        };
        self.previous_index = Some(chosen);
        chosen
    }
}

/// Picks the least-loaded worker, re-scanning queued counts on every call.
pub struct LoadBalancingPolicy;

impl LoadBalancingPolicy {
    pub fn new(directory: &WorkerDirectory) -> Result<Self> {
        ensure_workers(directory)?;
        Ok(Self)
    }
}

impl WorkerSelectionPolicy for LoadBalancingPolicy {
    fn next_worker_index(&mut self, directory: &WorkerDirectory) -> usize {
        // Construction checked non-emptiness and the directory is append-only.
        directory.least_loaded_worker().unwrap_or(0)
    }
}

/// Picks a uniformly random worker from its own seeded generator, so a
/// policy instance is deterministic given its seed.
pub struct RandomPolicy {
    rng: StdRng,
}

impl RandomPolicy {
    pub fn new(directory: &WorkerDirectory) -> Result<Self> {
        ensure_workers(directory)?;
        Ok(Self {
            rng: StdRng::from_entropy(),
        })
    }

    #[cfg(test)]
    pub fn with_seed(directory: &WorkerDirectory, seed: u64) -> Result<Self> {
        ensure_workers(directory)?;
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl WorkerSelectionPolicy for RandomPolicy {
    fn next_worker_index(&mut self, directory: &WorkerDirectory) -> usize {
        self.rng.gen_range(0..directory.num_workers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(n: usize) -> WorkerDirectory {
        let mut directory = WorkerDirectory::new();
        for index in 0..n {
            directory.add_worker(50 + index as u32, -1);
        }
        directory
    }

    #[test]
    fn test_policies_reject_empty_roster() {
        let directory = WorkerDirectory::new();
        assert!(RoundRobinPolicy::new(&directory, 0).is_err());
        assert!(LoadBalancingPolicy::new(&directory).is_err());
        assert!(RandomPolicy::new(&directory).is_err());
    }

    #[test]
    fn test_policy_objects_are_task_safe() {
        fn assert_task_safe<T: Send + Sync + ?Sized>() {}
        assert_task_safe::<dyn WorkerSelectionPolicy>();
    }

    #[test]
    fn test_round_robin_cycles_from_start_index() {
        let directory = roster(3);
        let mut policy = RoundRobinPolicy::new(&directory, 0).unwrap();
        let picks: Vec<usize> = (0..7).map(|_| policy.next_worker_index(&directory)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);

        let mut offset = RoundRobinPolicy::new(&directory, 2).unwrap();
        let picks: Vec<usize> = (0..4).map(|_| offset.next_worker_index(&directory)).collect();
        assert_eq!(picks, vec![2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_rejects_out_of_range_start_index() {
        let directory = roster(2);
        assert!(RoundRobinPolicy::new(&directory, 2).is_err());
    }

    #[test]
    fn test_round_robin_picks_newly_added_worker_next() {
        let mut directory = roster(2);
        let mut policy = RoundRobinPolicy::new(&directory, 1).unwrap();
        assert_eq!(policy.next_worker_index(&directory), 1);

        // The successor of the last index must be the worker appended after
        // that pick, not a wrap back to 0.
        directory.add_worker(99, -1);
        assert_eq!(policy.next_worker_index(&directory), 2);
        assert_eq!(policy.next_worker_index(&directory), 0);
    }

    #[test]
    fn test_load_balancing_tracks_queued_counts() {
        let mut directory = roster(3);
        let mut policy = LoadBalancingPolicy::new(&directory).unwrap();

        // All idle: smallest index wins.
        assert_eq!(policy.next_worker_index(&directory), 0);
        directory.increment_queued(0);
        assert_eq!(policy.next_worker_index(&directory), 1);
        directory.increment_queued(1);
        assert_eq!(policy.next_worker_index(&directory), 2);
        directory.increment_queued(2);

        // Completion frees worker 1; the next pick follows.
        directory.decrement_queued(1);
        assert_eq!(policy.next_worker_index(&directory), 1);
    }

    #[test]
    fn test_load_balancing_spreads_five_orders_over_three_workers() {
        let mut directory = roster(3);
        let mut policy = LoadBalancingPolicy::new(&directory).unwrap();

        // Five placements with no completions in between.
        for _ in 0..5 {
            let chosen = policy.next_worker_index(&directory);
            directory.increment_queued(chosen);
        }
        let loads: Vec<usize> = (0..3)
            .map(|index| directory.worker(index).unwrap().num_queued_work_orders())
            .collect();
        assert_eq!(loads, vec![2, 2, 1]);
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let directory = roster(4);
        let mut policy = RandomPolicy::with_seed(&directory, 42).unwrap();
        for _ in 0..200 {
            assert!(policy.next_worker_index(&directory) < 4);
        }
    }

    #[test]
    fn test_random_is_deterministic_per_seed() {
        let directory = roster(5);
        let mut first = RandomPolicy::with_seed(&directory, 7).unwrap();
        let mut second = RandomPolicy::with_seed(&directory, 7).unwrap();
        for _ in 0..50 {
            assert_eq!(
                first.next_worker_index(&directory),
                second.next_worker_index(&directory)
            );
        }
    }
}
