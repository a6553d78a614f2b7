//! Property-based tests for the rolling restart protocol.
//!
//! These tests drive a [`ClusterSupervisor`] over a recording process
//! control with arbitrary interleavings of worker events and check:
//! - At most one deliberate restart is in flight at a time
//! - Served capacity never drops below `desired - 1` because of a restart
//! - The restart queue never holds duplicates or dead pids
//! - Every queued worker is eventually restarted
//!
//! # Running Tests
//!
//! ```bash
//! cargo test property_tests
//! ```

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use crate::cluster::ipc::Message;
    use crate::cluster::signals::SignalEvent;
    use crate::cluster::supervisor::{ClusterSupervisor, Event, SupervisorConfig};
    use crate::cluster::testing::RecordingControl;
    use crate::cluster::types::{ExitStatus, Pid, Worker};

    // ============================================================================
    // Test Strategies - Input Generation
    // ============================================================================

    /// One step of the outside world. Indices pick a worker by fork order.
    #[derive(Debug, Clone)]
    enum Op {
        /// A worker that is not serving yet finished binding.
        Listen(usize),
        /// The operator sent the restart signal.
        RestartAll,
        /// A worker asked to be restarted.
        Request(usize),
        /// A disconnected worker finished draining and exited.
        FinishDrain,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..16usize).prop_map(Op::Listen),
            1 => Just(Op::RestartAll),
            2 => (0..16usize).prop_map(Op::Request),
            3 => Just(Op::FinishDrain),
        ]
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(op(), 1..120)
    }

    // ============================================================================
    // Harness
    // ============================================================================

    fn started(workers: usize) -> ClusterSupervisor<RecordingControl> {
        let mut sup = ClusterSupervisor::new(
            SupervisorConfig {
                workers,
                nodemon_compat: false,
            },
            RecordingControl::new(),
        );
        sup.start().unwrap();
        let pids: Vec<Pid> = sup.workers().iter().map(|w| w.pid()).collect();
        for pid in pids {
            sup.handle(Event::WorkerListening { pid }).unwrap();
        }
        sup
    }

    /// The `index`-th worker (cyclically) matching `filter`, in fork order.
    fn pick(
        sup: &ClusterSupervisor<RecordingControl>,
        index: usize,
        filter: impl Fn(&Worker) -> bool,
    ) -> Option<Pid> {
        let matching: Vec<Pid> = sup
            .workers()
            .into_iter()
            .filter(|w| filter(w))
            .map(Worker::pid)
            .collect();
        if matching.is_empty() {
            None
        } else {
            Some(matching[index % matching.len()])
        }
    }

    fn apply(sup: &mut ClusterSupervisor<RecordingControl>, op: &Op) {
        let event = match *op {
            Op::Listen(i) => pick(sup, i, |w| !w.is_listening() && !w.is_disconnecting())
                .map(|pid| Event::WorkerListening { pid }),
            Op::RestartAll => Some(Event::Signal(SignalEvent::Restart)),
            Op::Request(i) => {
                let live: Vec<Pid> = sup.workers().iter().map(|w| w.pid()).collect();
                live.get(i % live.len().max(1)).map(|&pid| Event::WorkerMessage {
                    pid,
                    message: Message::Restart { pid },
                })
            },
            Op::FinishDrain => pick(sup, 0, Worker::is_disconnecting).map(|pid| Event::WorkerExited {
                pid,
                status: ExitStatus::Code(0),
            }),
        };
        if let Some(event) = event {
            sup.handle(event).unwrap();
        }
    }

    fn disconnecting(sup: &ClusterSupervisor<RecordingControl>) -> usize {
        sup.workers().iter().filter(|w| w.is_disconnecting()).count()
    }

    // ============================================================================
    // Restart Invariants
    // ============================================================================

    proptest! {
        /// Invariant: only one worker is deliberately restarting at a time.
        #[test]
        fn one_restart_in_flight(workers in 1..6usize, script in ops()) {
            let mut sup = started(workers);
            for op in &script {
                apply(&mut sup, op);
                prop_assert!(disconnecting(&sup) <= 1, "after {:?}", op);
            }
        }

        /// Invariant: restarts never take more than one worker out of service.
        #[test]
        fn capacity_stays_above_desired_minus_one(workers in 1..6usize, script in ops()) {
            let mut sup = started(workers);
            for op in &script {
                apply(&mut sup, op);
                let state = sup.cluster_state();
                prop_assert!(
                    state.listening_workers + 1 >= state.desired_workers,
                    "listening {} of {} after {:?}",
                    state.listening_workers,
                    state.desired_workers,
                    op
                );
            }
        }

        /// Invariant: the queue holds each live pid at most once.
        #[test]
        fn queue_is_unique_and_live(workers in 1..6usize, script in ops()) {
            let mut sup = started(workers);
            for op in &script {
                apply(&mut sup, op);
                let queued: Vec<Pid> = sup.queue().iter().collect();
                let unique: HashSet<Pid> = queued.iter().copied().collect();
                prop_assert_eq!(queued.len(), unique.len());
                for pid in queued {
                    prop_assert!(sup.worker(pid).is_some(), "dead pid {} queued", pid);
                }
            }
        }

        /// Invariant: once the outside world settles, every queued worker
        /// has been replaced and the cluster is back at full capacity.
        #[test]
        fn restarts_complete_when_workers_cooperate(workers in 1..6usize, script in ops()) {
            let mut sup = started(workers);
            for op in &script {
                apply(&mut sup, op);
            }

            // Let every replacement come up and every drain finish.
            for _ in 0..(workers * 8 + 16) {
                apply(&mut sup, &Op::Listen(0));
                apply(&mut sup, &Op::FinishDrain);
            }

            prop_assert!(sup.queue().is_empty());
            prop_assert_eq!(disconnecting(&sup), 0);
            prop_assert!(sup.cluster_state().at_full_capacity());
        }
    }
}
