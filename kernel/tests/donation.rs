//! Donation scenarios for both policies.

mod common;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use queso_kernel::{SchedPolicy, sync::Lock, thread, thread::Thread};

/// Donation through a lock under the priority policy.
///
/// T3 (default priority) holds the lock; T1 (priority 5) blocks on it
/// while T2 (priority 4) is merely ready. T3 must run on T1's donated
/// priority, and after the release T1 must run before T2.
#[test]
fn priority_donates_through_a_lock() {
    common::run(SchedPolicy::Priority, |k| {
        let lock = Arc::new(Lock::new(k));
        let order: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));
        let holding = Arc::new(AtomicBool::new(false));
        let observed = Arc::new(Mutex::new(Vec::<i64>::new()));

        let me = k.current_thread();

        let t3 = Thread::new(k, "t3");
        {
            let (kernel, lock) = (k.clone(), lock.clone());
            let (holding, observed) = (holding.clone(), observed.clone());
            let t3_self = t3.clone();
            thread::fork(k, &t3, move || {
                lock.acquire();
                holding.store(true, Ordering::Relaxed);
                // Run until the donation arrives, then record it.
                loop {
                    let e = kernel.effective_priority_of(&t3_self);
                    if e > kernel.priority_of(&t3_self) {
                        observed.lock().unwrap().push(e);
                        break;
                    }
                    thread::yield_now(&kernel);
                }
                lock.release();
                observed
                    .lock()
                    .unwrap()
                    .push(kernel.effective_priority_of(&t3_self));
            });
        }

        // Let T3 take the lock, then stage the rest at top priority so
        // nothing runs early.
        while !holding.load(Ordering::Relaxed) {
            thread::yield_now(k);
        }
        k.set_priority(&me, 7);

        let t2 = Thread::new(k, "t2");
        let t1 = Thread::new(k, "t1");
        k.set_priority(&t2, 4);
        k.set_priority(&t1, 5);
        {
            let (kernel, order) = (k.clone(), order.clone());
            thread::fork(k, &t2, move || {
                thread::yield_now(&kernel);
                order.lock().unwrap().push("t2");
            });
        }
        {
            let (lock, order) = (lock.clone(), order.clone());
            thread::fork(k, &t1, move || {
                lock.acquire();
                order.lock().unwrap().push("t1");
                lock.release();
            });
        }

        // Step aside: T1 blocks on the lock, T3 inherits 5 and runs ahead
        // of T2, releases, and T1 beats T2 to the processor.
        k.set_priority(&me, 1);
        for t in [&t1, &t2, &t3] {
            thread::join(k, t);
        }

        assert_eq!(*observed.lock().unwrap(), [5, 1]);
        assert_eq!(*order.lock().unwrap(), ["t1", "t2"]);
    });
}

/// A chain: A waits on L1 held by B, B waits on L2 held by C, so A's
/// priority must reach C through B.
#[test]
fn priority_donates_across_a_chain_of_holders() {
    common::run(SchedPolicy::Priority, |k| {
        let l1 = Arc::new(Lock::new(k));
        let l2 = Arc::new(Lock::new(k));
        let c_holding = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));

        let me = k.current_thread();
        k.set_priority(&me, 7);

        let c = Thread::new(k, "c");
        {
            let (kernel, l2) = (k.clone(), l2.clone());
            let (c_holding, release) = (c_holding.clone(), release.clone());
            thread::fork(k, &c, move || {
                l2.acquire();
                c_holding.store(true, Ordering::Relaxed);
                // Park in the alarm rather than spinning: a boosted C must
                // not starve the low-priority orchestrator.
                while !release.load(Ordering::Relaxed) {
                    kernel.alarm().wait_until(100);
                }
                l2.release();
            });
        }
        while !c_holding.load(Ordering::Relaxed) {
            thread::yield_now(k);
        }

        let b = Thread::new(k, "b");
        k.set_priority(&b, 3);
        {
            let (l1, l2) = (l1.clone(), l2.clone());
            thread::fork(k, &b, move || {
                l1.acquire();
                l2.acquire();
                l2.release();
                l1.release();
            });
        }
        // B holds L1 and blocks on L2, pushing its 3 into C.
        while k.effective_priority_of(&c) != 3 {
            thread::yield_now(k);
        }

        let a = Thread::new(k, "a");
        k.set_priority(&a, 7);
        {
            let l1 = l1.clone();
            thread::fork(k, &a, move || {
                l1.acquire();
                l1.release();
            });
        }
        while k.effective_priority_of(&b) != 7 || k.effective_priority_of(&c) != 7 {
            thread::yield_now(k);
        }
        assert_eq!(k.priority_of(&c), 1);
        assert_eq!(k.priority_of(&b), 3);

        release.store(true, Ordering::Relaxed);
        for t in [&a, &b, &c] {
            thread::join(k, t);
        }
    });
}

#[test]
fn set_priority_round_trips_and_bounds_effective() {
    common::run(SchedPolicy::Priority, |k| {
        let t = Thread::new(k, "idle");
        for p in [0, 3, 7] {
            k.set_priority(&t, p);
            assert_eq!(k.priority_of(&t), p);
            assert!(k.effective_priority_of(&t) >= p);
        }
    });
}

#[test]
fn increase_and_decrease_priority_are_bounded() {
    common::run(SchedPolicy::Priority, |k| {
        let me = k.current_thread();
        k.set_priority(&me, 7);
        assert!(!k.increase_priority());
        assert!(k.decrease_priority());
        assert_eq!(k.priority_of(&me), 6);

        k.set_priority(&me, 0);
        assert!(!k.decrease_priority());
        assert!(k.increase_priority());
        assert_eq!(k.priority_of(&me), 1);
    });
}

/// Ticket donation adds: a holder with 5 tickets and blocked waiters of 3
/// and 7 runs with 15, and drops back to 5 once it releases.
#[test]
fn lottery_donation_is_additive_through_a_lock() {
    common::run(SchedPolicy::Lottery, |k| {
        let lock = Arc::new(Lock::new(k));
        let observed = Arc::new(Mutex::new(Vec::<i64>::new()));

        let holder = Thread::new(k, "holder");
        k.set_priority(&holder, 5);
        {
            let (kernel, lock, observed) = (k.clone(), lock.clone(), observed.clone());
            let me = holder.clone();
            thread::fork(k, &holder, move || {
                lock.acquire();
                loop {
                    let e = kernel.effective_priority_of(&me);
                    if e == 5 + 3 + 7 {
                        observed.lock().unwrap().push(e);
                        break;
                    }
                    thread::yield_now(&kernel);
                }
                lock.release();
                observed
                    .lock()
                    .unwrap()
                    .push(kernel.effective_priority_of(&me));
            });
        }

        let mut waiters = Vec::new();
        for (name, tickets) in [("w3", 3_i64), ("w7", 7)] {
            let t = Thread::new(k, name);
            k.set_priority(&t, tickets);
            let lock = lock.clone();
            thread::fork(k, &t, move || {
                lock.acquire();
                lock.release();
            });
            waiters.push(t);
        }

        // Wait without joining: a joiner would donate its own ticket into
        // the holder and spoil the expected sum.
        while observed.lock().unwrap().len() < 2 {
            k.alarm().wait_until(100);
        }
        thread::join(k, &holder);
        for t in &waiters {
            thread::join(k, t);
        }

        assert_eq!(*observed.lock().unwrap(), [15, 5]);
    });
}

/// Scenario: three threads with tickets 3, 7 and 10 share a queue; over
/// 10 000 draws each must win in proportion to its tickets, within three
/// points.
#[test]
fn lottery_draws_match_ticket_shares() {
    common::run(SchedPolicy::Lottery, |k| {
        const DRAWS: usize = 10_000;

        let threads: Vec<_> = [("t3", 3_i64), ("t7", 7), ("t10", 10)]
            .into_iter()
            .map(|(name, tickets)| {
                let t = Thread::new(k, name);
                k.set_priority(&t, tickets);
                t
            })
            .collect();

        let queue = k.interrupt().with_disabled(|| k.new_wait_queue(false));
        let mut wins = [0_usize; 3];
        k.interrupt().with_disabled(|| {
            for t in &threads {
                queue.wait_for_access(t);
            }
            for _ in 0..DRAWS {
                let winner = queue.next_thread().expect("three threads are queued");
                let slot = threads
                    .iter()
                    .position(|t| Arc::ptr_eq(t, &winner))
                    .unwrap();
                wins[slot] += 1;
                queue.wait_for_access(&winner);
            }
        });

        let shares = [0.15, 0.35, 0.50];
        for (slot, expected) in shares.iter().enumerate() {
            let got = wins[slot] as f64 / DRAWS as f64;
            assert!(
                (got - expected).abs() < 0.03,
                "slot {slot}: {got:.3} vs {expected:.3} ({wins:?})"
            );
        }
    });
}
