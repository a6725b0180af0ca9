//! Rendezvous scenarios: pairing both ways, many-to-many exchange, and
//! the two-children boat puzzle as a communicator/condition stress.

mod common;

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, atomic::{AtomicBool, Ordering}},
};

use queso_kernel::{
    Kernel, SchedPolicy,
    sync::{Communicator, Condition, Lock},
    thread,
    thread::Thread,
};
use rstest::rstest;

#[rstest]
#[case::priority(SchedPolicy::Priority)]
#[case::lottery(SchedPolicy::Lottery)]
fn speaker_first_pairs_with_later_listener(#[case] policy: SchedPolicy) {
    common::run(policy, |k| {
        let comm = Arc::new(Communicator::new(k));
        let t = Thread::new(k, "speaker");
        {
            let comm = comm.clone();
            thread::fork(k, &t, move || comm.speak(42));
        }
        // Let the speaker queue up first.
        k.alarm().wait_until(600);
        assert_eq!(comm.listen(), 42);
        thread::join(k, &t);
    });
}

#[rstest]
#[case::priority(SchedPolicy::Priority)]
#[case::lottery(SchedPolicy::Lottery)]
fn listener_first_pairs_with_later_speaker(#[case] policy: SchedPolicy) {
    common::run(policy, |k| {
        let comm = Arc::new(Communicator::new(k));
        let heard = Arc::new(Mutex::new(None));
        let t = Thread::new(k, "listener");
        {
            let (comm, heard) = (comm.clone(), heard.clone());
            thread::fork(k, &t, move || {
                *heard.lock().unwrap() = Some(comm.listen());
            });
        }
        k.alarm().wait_until(600);
        comm.speak(-7);
        thread::join(k, &t);
        assert_eq!(*heard.lock().unwrap(), Some(-7));
    });
}

/// Five speakers and five listeners; every word is delivered to exactly
/// one listener.
#[rstest]
#[case::priority(SchedPolicy::Priority)]
#[case::lottery(SchedPolicy::Lottery)]
fn words_are_delivered_exactly_once(#[case] policy: SchedPolicy) {
    common::run(policy, |k| {
        const N: i32 = 5;
        let comm = Arc::new(Communicator::new(k));
        let heard: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

        let mut threads = Vec::new();
        for word in 0..N {
            let t = Thread::new(k, format!("speaker-{word}"));
            let comm = comm.clone();
            thread::fork(k, &t, move || comm.speak(word));
            threads.push(t);
        }
        for i in 0..N {
            let t = Thread::new(k, format!("listener-{i}"));
            let (comm, heard) = (comm.clone(), heard.clone());
            thread::fork(k, &t, move || {
                let word = comm.listen();
                heard.lock().unwrap().push(word);
            });
            threads.push(t);
        }
        for t in &threads {
            thread::join(k, t);
        }

        let mut heard = heard.lock().unwrap().clone();
        heard.sort_unstable();
        assert_eq!(heard, (0..N).collect::<Vec<_>>());
    });
}

/// The boat puzzle, 0 adults and 2 children on Oahu. The grader checks
/// that every boat operation is legal (right person, right shore) and
/// that no two operations interleave.
mod boat {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Op {
        ChildRowToMolokai,
        ChildRideToMolokai,
        ChildRowToOahu,
    }

    /// Stands in for the course grader: records operations and validates
    /// boat position as they happen.
    pub struct Grader {
        ops: Mutex<Vec<Op>>,
        /// True while the boat is at Oahu.
        boat_in_oahu: Mutex<bool>,
        in_op: AtomicBool,
    }

    impl Grader {
        pub fn new() -> Self {
            Self {
                ops: Mutex::new(Vec::new()),
                boat_in_oahu: Mutex::new(true),
                in_op: AtomicBool::new(false),
            }
        }

        pub fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn record(&self, op: Op) {
            // Operations on the boat must not interleave; callers hold
            // the boat lock.
            assert!(!self.in_op.swap(true, Ordering::SeqCst));
            let mut at_oahu = self.boat_in_oahu.lock().unwrap();
            match op {
                Op::ChildRowToMolokai => {
                    assert!(*at_oahu, "rowing to Molokai without the boat");
                    *at_oahu = false;
                }
                Op::ChildRideToMolokai => {
                    assert!(!*at_oahu, "riding after the boat already left");
                }
                Op::ChildRowToOahu => {
                    assert!(!*at_oahu, "rowing to Oahu without the boat");
                    *at_oahu = true;
                }
            }
            drop(at_oahu);
            self.ops.lock().unwrap().push(op);
            self.in_op.store(false, Ordering::SeqCst);
        }

        pub fn child_row_to_molokai(&self) {
            self.record(Op::ChildRowToMolokai);
        }

        pub fn child_ride_to_molokai(&self) {
            self.record(Op::ChildRideToMolokai);
        }

        pub fn child_row_to_oahu(&self) {
            self.record(Op::ChildRowToOahu);
        }
    }

    struct Island {
        boat_in_oahu: bool,
        game_over: bool,
        children_in_oahu: u32,
        adults_in_oahu: u32,
        child_in_boat: Option<u64>,
        in_molokai: HashSet<u64>,
    }

    pub struct Puzzle {
        pub grader: Grader,
        lock: Arc<Lock>,
        boat: Condition,
        state: Mutex<Island>,
    }

    impl Puzzle {
        pub fn new(k: &Arc<Kernel>, adults: u32, children: u32) -> Self {
            let lock = Arc::new(Lock::new(k));
            Self {
                grader: Grader::new(),
                boat: Condition::new(k, lock.clone()),
                lock,
                state: Mutex::new(Island {
                    boat_in_oahu: true,
                    game_over: false,
                    children_in_oahu: children,
                    adults_in_oahu: adults,
                    child_in_boat: None,
                    in_molokai: HashSet::new(),
                }),
            }
        }

        pub fn done(&self) -> bool {
            self.state.lock().unwrap().game_over
        }

        pub fn children_in_molokai(&self) -> usize {
            self.state.lock().unwrap().in_molokai.len()
        }

        /// Wake whoever waits at the boat, then wait there ourselves.
        fn sleep_on_boat(&self) {
            self.boat.wake();
            self.boat.sleep();
        }

        pub fn child(&self, k: &Arc<Kernel>) {
            let me = thread::current(k).id();
            while !self.done() {
                self.lock.acquire();
                let state = self.state.lock().unwrap();
                let here = !state.in_molokai.contains(&me);
                if state.boat_in_oahu && here {
                    if state.child_in_boat.is_none() {
                        // First into the boat: a lone child rows alone.
                        let alone =
                            state.adults_in_oahu == 0 && state.children_in_oahu == 1;
                        drop(state);
                        let mut state = self.state.lock().unwrap();
                        if alone {
                            self.grader.child_row_to_molokai();
                            state.children_in_oahu -= 1;
                            state.boat_in_oahu = false;
                            state.in_molokai.insert(me);
                            state.game_over = state.adults_in_oahu == 0
                                && state.children_in_oahu == 0;
                            drop(state);
                        } else {
                            state.child_in_boat = Some(me);
                            drop(state);
                            self.sleep_on_boat();
                        }
                    } else {
                        // Second child: row both across.
                        drop(state);
                        self.grader.child_row_to_molokai();
                        self.grader.child_ride_to_molokai();
                        let mut state = self.state.lock().unwrap();
                        let passenger = state.child_in_boat.take().unwrap();
                        state.in_molokai.insert(me);
                        state.in_molokai.insert(passenger);
                        state.children_in_oahu -= 2;
                        state.boat_in_oahu = false;
                        state.game_over =
                            state.adults_in_oahu == 0 && state.children_in_oahu == 0;
                        drop(state);
                        self.boat.wake();
                    }
                } else if !state.boat_in_oahu && !here {
                    // Bring the boat back if more people still wait.
                    let finished = state.game_over;
                    drop(state);
                    if !finished {
                        self.grader.child_row_to_oahu();
                        let mut state = self.state.lock().unwrap();
                        state.in_molokai.remove(&me);
                        state.children_in_oahu += 1;
                        state.boat_in_oahu = true;
                        drop(state);
                    }
                    self.sleep_on_boat();
                } else {
                    drop(state);
                    self.sleep_on_boat();
                }
                self.lock.release();
            }
        }
    }

    #[rstest]
    #[case::priority(SchedPolicy::Priority)]
    #[case::lottery(SchedPolicy::Lottery)]
    fn two_children_cross(#[case] policy: SchedPolicy) {
        common::run(policy, |k| {
            let puzzle = Arc::new(Puzzle::new(k, 0, 2));

            for i in 0..2 {
                let t = Thread::new(k, format!("child-{i}"));
                let (kernel, puzzle) = (k.clone(), puzzle.clone());
                thread::fork(k, &t, move || puzzle.child(&kernel));
            }

            while !puzzle.done() {
                k.alarm().wait_until(500);
            }
            assert_eq!(puzzle.children_in_molokai(), 2);
            let ops = puzzle.grader.ops();
            assert_eq!(ops, [Op::ChildRowToMolokai, Op::ChildRideToMolokai]);
        });
    }
}
