//! The scheduling substrate: wait queues with donation bookkeeping.
//!
//! A scheduler hands out wait queues; everything that can block a thread —
//! the ready set, locks, condition variables, per-thread join queues — is
//! one of these queues. A queue may have a *resource holder*, and a queue
//! created with `transfer = true` donates scheduling weight from its
//! waiters to that holder, which is how priority inversion is mitigated
//! across chains of held and waited-for resources.
//!
//! Both concrete policies share the same bookkeeping, kept in a [`Graph`]:
//! per thread its own and effective weight, the queues it holds, and the
//! single queue it waits on; per queue its waiters in arrival order, its
//! holder, and cached ticket sums. The policies differ in how donation
//! combines (maximum vs. addition) and in how a winner is picked (best
//! effective vs. weighted random draw).
//!
//! Every operation here requires interrupts to be disabled; that is the
//! only lock the scheduler relies on.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use crate::thread::Thread;

mod lottery;
mod priority;

pub use self::{lottery::LotteryScheduler, priority::PriorityScheduler};

pub(crate) type QueueId = usize;

/// Scheduling policy surface.
///
/// `priority` means priority under [`PriorityScheduler`] and tickets under
/// [`LotteryScheduler`]; `effective` is the value donation may have boosted
/// and is what selection actually uses.
pub trait Scheduler: Send + Sync {
    fn default_priority(&self) -> i64;
    fn min_priority(&self) -> i64;
    fn max_priority(&self) -> i64;

    /// Creates a wait queue; see [`WaitQueue`].
    fn create_queue(&self, transfer: bool) -> QueueId;

    /// Adds a thread to the scheduling state with the default weight.
    fn register(&self, thread: &Arc<Thread>);

    /// Drops a finished thread from the scheduling state. The thread must
    /// hold no queue and wait on none.
    fn unregister(&self, thread: &Thread);

    fn priority_of(&self, thread: &Thread) -> i64;
    fn effective_priority_of(&self, thread: &Thread) -> i64;
    fn set_priority(&self, thread: &Thread, priority: i64);

    fn wait_for_access(&self, queue: QueueId, thread: &Arc<Thread>);
    fn acquire(&self, queue: QueueId, thread: &Arc<Thread>);
    fn next_thread(&self, queue: QueueId) -> Option<Arc<Thread>>;
}

/// A handle to one wait queue of the kernel's scheduler.
#[derive(Clone)]
pub struct WaitQueue {
    sched: Arc<dyn Scheduler>,
    id: QueueId,
}

impl WaitQueue {
    pub(crate) fn new(sched: Arc<dyn Scheduler>, transfer: bool) -> Self {
        let id = sched.create_queue(transfer);
        Self { sched, id }
    }

    /// Enqueues `thread` as a waiter. Interrupts must be disabled and the
    /// thread must not be waiting anywhere else.
    pub fn wait_for_access(&self, thread: &Arc<Thread>) {
        self.sched.wait_for_access(self.id, thread);
    }

    /// Makes `thread` the resource holder of this (empty, unheld) queue.
    pub fn acquire(&self, thread: &Arc<Thread>) {
        self.sched.acquire(self.id, thread);
    }

    /// Releases the current holder and dequeues the next one per policy,
    /// installing it as the new holder. `None` if nobody waits.
    pub fn next_thread(&self) -> Option<Arc<Thread>> {
        self.sched.next_thread(self.id)
    }
}

/// Per-thread scheduling state.
pub(crate) struct ThreadSched {
    pub(crate) thread: Arc<Thread>,
    /// The thread's own priority / ticket count.
    pub(crate) own: i64,
    /// What selection uses; own plus whatever donation contributes.
    pub(crate) effective: i64,
    /// Queues this thread currently holds.
    pub(crate) held: Vec<QueueId>,
    /// The single queue this thread waits on, if any.
    pub(crate) waiting_on: Option<QueueId>,
}

/// Per-queue state.
pub(crate) struct QueueState {
    pub(crate) transfer: bool,
    /// Waiters in arrival order; ties and draws scan in this order.
    pub(crate) waiters: VecDeque<u64>,
    pub(crate) holder: Option<u64>,
    /// Sum of waiters' own tickets (lottery bookkeeping).
    pub(crate) sum_own: i64,
    /// Sum of waiters' effective tickets (lottery bookkeeping).
    pub(crate) sum_effective: i64,
    /// Cached best waiter (priority policy); `None` when stale.
    pub(crate) best: Option<u64>,
}

/// The donation graph both policies operate on.
#[derive(Default)]
pub(crate) struct Graph {
    threads: HashMap<u64, ThreadSched>,
    queues: Vec<QueueState>,
}

impl Graph {
    pub(crate) fn create_queue(&mut self, transfer: bool) -> QueueId {
        self.queues.push(QueueState {
            transfer,
            waiters: VecDeque::new(),
            holder: None,
            sum_own: 0,
            sum_effective: 0,
            best: None,
        });
        self.queues.len() - 1
    }

    pub(crate) fn register(&mut self, thread: &Arc<Thread>, own: i64) {
        let previous = self.threads.insert(
            thread.id(),
            ThreadSched {
                thread: thread.clone(),
                own,
                effective: own,
                held: Vec::new(),
                waiting_on: None,
            },
        );
        assert!(previous.is_none(), "thread registered twice");
    }

    pub(crate) fn unregister(&mut self, id: u64) {
        let state = self.threads.remove(&id).expect("unregistering an unknown thread");
        assert!(state.waiting_on.is_none(), "thread died on a wait queue");
        // The last thread a queue handed out stays its holder until the
        // next dequeue, so a dying thread may still "hold" condition-style
        // queues; those are quietly released. Dying while holding a
        // donating queue is a lock leak and fatal.
        for q in state.held {
            let queue = self.queue_mut(q);
            assert!(!queue.transfer, "thread died holding a donating queue");
            debug_assert_eq!(queue.holder, Some(id));
            queue.holder = None;
            queue.best = None;
        }
    }

    pub(crate) fn thread(&self, id: u64) -> &ThreadSched {
        &self.threads[&id]
    }

    pub(crate) fn thread_mut(&mut self, id: u64) -> &mut ThreadSched {
        self.threads.get_mut(&id).expect("unknown thread")
    }

    pub(crate) fn queue(&self, id: QueueId) -> &QueueState {
        &self.queues[id]
    }

    pub(crate) fn queue_mut(&mut self, id: QueueId) -> &mut QueueState {
        &mut self.queues[id]
    }

    /// Appends `tid` to the waiter list, maintaining sums and invalidating
    /// the selection cache.
    pub(crate) fn add_waiter(&mut self, queue: QueueId, tid: u64) {
        let (own, effective) = {
            let t = self.thread(tid);
            debug_assert!(t.waiting_on.is_none(), "thread already waits on a queue");
            (t.own, t.effective)
        };
        let q = self.queue_mut(queue);
        debug_assert!(!q.waiters.contains(&tid));
        q.waiters.push_back(tid);
        q.sum_own += own;
        q.sum_effective += effective;
        q.best = None;
        self.thread_mut(tid).waiting_on = Some(queue);
    }

    /// Removes `tid` from the waiter list, maintaining sums and
    /// invalidating the selection cache.
    pub(crate) fn remove_waiter(&mut self, queue: QueueId, tid: u64) {
        let (own, effective) = {
            let t = self.thread(tid);
            (t.own, t.effective)
        };
        let q = self.queue_mut(queue);
        let pos = q
            .waiters
            .iter()
            .position(|&w| w == tid)
            .expect("removing a thread that does not wait here");
        q.waiters.remove(pos);
        q.sum_own -= own;
        q.sum_effective -= effective;
        q.best = None;
        self.thread_mut(tid).waiting_on = None;
    }

    pub(crate) fn install_holder(&mut self, queue: QueueId, tid: u64) {
        let q = self.queue_mut(queue);
        debug_assert!(q.holder.is_none());
        q.holder = Some(tid);
        q.best = None;
        self.thread_mut(tid).held.push(queue);
    }

    /// Clears the holder and detaches the queue from its `held` set.
    pub(crate) fn release_holder(&mut self, queue: QueueId) -> Option<u64> {
        let tid = self.queue_mut(queue).holder.take()?;
        self.queue_mut(queue).best = None;
        self.thread_mut(tid).held.retain(|&q| q != queue);
        Some(tid)
    }

    /// Asserts the public `acquire` precondition: free and empty.
    pub(crate) fn assert_unowned_and_empty(&self, queue: QueueId) {
        let q = self.queue(queue);
        assert!(
            q.holder.is_none() && q.waiters.is_empty(),
            "acquire on a queue that is held or has waiters"
        );
    }
}
