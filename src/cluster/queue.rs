//! Restart admission queue.
//!
//! Holds worker pids waiting for permission to restart, in request order,
//! each pid at most once. The queue itself knows nothing about capacity:
//! [`RestartQueue::release`] takes the current [`ClusterState`] and only
//! yields a pid while the cluster is at full capacity and not shutting down.
//! The supervisor marks the released worker non-listening before asking for
//! the next one, so at most one deliberate restart is in flight.

use std::collections::{HashSet, VecDeque};

use super::types::{ClusterState, Pid};

/// FIFO of pids pending restart, deduplicated.
#[derive(Debug, Default)]
pub struct RestartQueue {
    order: VecDeque<Pid>,
    members: HashSet<Pid>,
}

impl RestartQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `pid`. Returns false if it was already queued.
    pub fn push(&mut self, pid: Pid) -> bool {
        if !self.members.insert(pid) {
            return false;
        }
        self.order.push_back(pid);
        true
    }

    /// Drop `pid` wherever it sits (e.g. the worker exited on its own).
    pub fn remove(&mut self, pid: Pid) -> bool {
        if !self.members.remove(&pid) {
            return false;
        }
        self.order.retain(|queued| *queued != pid);
        true
    }

    /// Pop the head if the cluster may lose one worker right now.
    pub fn release(&mut self, cluster: &ClusterState) -> Option<Pid> {
        if cluster.shutdown_requested || !cluster.at_full_capacity() {
            return None;
        }
        let pid = self.order.pop_front()?;
        self.members.remove(&pid);
        Some(pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.members.contains(&pid)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Queued pids, head first.
    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.order.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(desired: usize, listening: usize) -> ClusterState {
        ClusterState {
            desired_workers: desired,
            current_workers: desired,
            listening_workers: listening,
            shutdown_requested: false,
        }
    }

    #[test]
    fn test_push_deduplicates() {
        let mut queue = RestartQueue::new();
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(1));
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_release_is_fifo_at_full_capacity() {
        let mut queue = RestartQueue::new();
        queue.push(10);
        queue.push(20);

        assert_eq!(queue.release(&cluster(2, 2)), Some(10));
        assert_eq!(queue.release(&cluster(2, 2)), Some(20));
        assert_eq!(queue.release(&cluster(2, 2)), None);
    }

    #[test]
    fn test_release_blocked_below_capacity() {
        let mut queue = RestartQueue::new();
        queue.push(10);

        assert_eq!(queue.release(&cluster(3, 2)), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_release_blocked_during_shutdown() {
        let mut queue = RestartQueue::new();
        queue.push(10);
        let mut state = cluster(1, 1);
        state.shutdown_requested = true;

        assert_eq!(queue.release(&state), None);
        assert!(queue.contains(10));
    }

    #[test]
    fn test_released_pid_can_be_queued_again() {
        let mut queue = RestartQueue::new();
        queue.push(10);
        assert_eq!(queue.release(&cluster(1, 1)), Some(10));
        assert!(queue.push(10));
    }

    #[test]
    fn test_remove() {
        let mut queue = RestartQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert!(queue.remove(2));
        assert!(!queue.remove(2));
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![1, 3]);
    }
}
