//! The priority policy: donation by maximum.
//!
//! A thread's effective priority is the maximum of its own priority and the
//! effective priorities of all waiters on transferring queues it holds.
//! Selection picks the waiter with the highest effective priority, oldest
//! first on ties. Each queue caches its current best waiter; the cache is
//! invalidated whenever a waiter's effective priority changes, the waiter
//! set changes, or the holder changes.

use std::sync::{Arc, Mutex, MutexGuard};

use queso_machine::Machine;

use crate::{
    param::{PRIORITY_DEFAULT, PRIORITY_MAX, PRIORITY_MIN},
    thread::Thread,
};

use super::{Graph, QueueId, Scheduler};

pub struct PriorityScheduler {
    machine: Arc<Machine>,
    graph: Mutex<Graph>,
}

impl PriorityScheduler {
    pub fn new(machine: Arc<Machine>) -> Self {
        Self {
            machine,
            graph: Mutex::new(Graph::default()),
        }
    }

    fn graph(&self) -> MutexGuard<'_, Graph> {
        debug_assert!(
            !self.machine.interrupt().is_enabled(),
            "scheduler touched with interrupts enabled"
        );
        self.graph.lock().unwrap()
    }
}

/// Best waiter by effective priority, oldest first on ties, through the
/// per-queue cache.
fn queue_best(g: &mut Graph, queue: QueueId) -> Option<u64> {
    if let Some(best) = g.queue(queue).best {
        return Some(best);
    }
    let waiters: Vec<u64> = g.queue(queue).waiters.iter().copied().collect();
    let mut best: Option<(u64, i64)> = None;
    for w in waiters {
        let e = g.thread(w).effective;
        if best.is_none_or(|(_, be)| e > be) {
            best = Some((w, e));
        }
    }
    let best = best.map(|(w, _)| w);
    g.queue_mut(queue).best = best;
    best
}

/// The largest effective priority donated to `tid` by waiters on the
/// transferring queues it holds.
fn donated(g: &mut Graph, tid: u64) -> Option<i64> {
    let held: Vec<QueueId> = g.thread(tid).held.clone();
    let mut best: Option<i64> = None;
    for q in held {
        if !g.queue(q).transfer {
            continue;
        }
        if let Some(w) = queue_best(g, q) {
            let e = g.thread(w).effective;
            if best.is_none_or(|b| e > b) {
                best = Some(e);
            }
        }
    }
    best
}

/// Recomputes `tid`'s effective priority and pushes any change along its
/// waiter-to-holder chain. `path` carries the threads already visited on
/// this propagation; reaching one of them again (mutual join) stops the
/// walk.
fn refresh(g: &mut Graph, tid: u64, path: &mut Vec<u64>) {
    if path.contains(&tid) {
        return;
    }
    let own = g.thread(tid).own;
    let effective = own.max(donated(g, tid).unwrap_or(own));
    if g.thread(tid).effective == effective {
        return;
    }
    g.thread_mut(tid).effective = effective;

    let Some(queue) = g.thread(tid).waiting_on else {
        return;
    };
    // Our standing as a waiter changed.
    g.queue_mut(queue).best = None;
    let (transfer, holder) = {
        let q = g.queue(queue);
        (q.transfer, q.holder)
    };
    if transfer && let Some(holder) = holder && holder != tid {
        path.push(tid);
        refresh(g, holder, path);
        path.pop();
    }
}

impl Scheduler for PriorityScheduler {
    fn default_priority(&self) -> i64 {
        PRIORITY_DEFAULT
    }

    fn min_priority(&self) -> i64 {
        PRIORITY_MIN
    }

    fn max_priority(&self) -> i64 {
        PRIORITY_MAX
    }

    fn create_queue(&self, transfer: bool) -> QueueId {
        self.graph().create_queue(transfer)
    }

    fn register(&self, thread: &Arc<Thread>) {
        self.graph().register(thread, PRIORITY_DEFAULT);
    }

    fn unregister(&self, thread: &Thread) {
        self.graph().unregister(thread.id());
    }

    fn priority_of(&self, thread: &Thread) -> i64 {
        self.graph().thread(thread.id()).own
    }

    fn effective_priority_of(&self, thread: &Thread) -> i64 {
        self.graph().thread(thread.id()).effective
    }

    fn set_priority(&self, thread: &Thread, priority: i64) {
        assert!(
            (PRIORITY_MIN..=PRIORITY_MAX).contains(&priority),
            "priority {priority} out of range"
        );
        let mut g = self.graph();
        g.thread_mut(thread.id()).own = priority;
        refresh(&mut g, thread.id(), &mut Vec::new());
    }

    fn wait_for_access(&self, queue: QueueId, thread: &Arc<Thread>) {
        let mut g = self.graph();
        let tid = thread.id();
        g.add_waiter(queue, tid);
        let holder = g.queue(queue).holder;
        if g.queue(queue).transfer
            && let Some(holder) = holder
            && holder != tid
        {
            refresh(&mut g, holder, &mut vec![tid]);
        }
    }

    fn acquire(&self, queue: QueueId, thread: &Arc<Thread>) {
        let mut g = self.graph();
        g.assert_unowned_and_empty(queue);
        g.install_holder(queue, thread.id());
    }

    fn next_thread(&self, queue: QueueId) -> Option<Arc<Thread>> {
        let mut g = self.graph();
        if let Some(out) = g.release_holder(queue) {
            // The outgoing holder keeps only what its remaining queues
            // donate.
            refresh(&mut g, out, &mut Vec::new());
        }
        if g.queue(queue).waiters.is_empty() {
            return None;
        }
        let winner = queue_best(&mut g, queue).expect("non-empty queue has a best waiter");
        g.remove_waiter(queue, winner);
        g.install_holder(queue, winner);
        refresh(&mut g, winner, &mut Vec::new());
        Some(g.thread(winner).thread.clone())
    }
}
