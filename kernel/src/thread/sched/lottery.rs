//! The lottery policy: donation by addition.
//!
//! A thread's effective ticket count is its own tickets plus the effective
//! tickets of every waiter on transferring queues it holds; each queue
//! keeps running sums over its waiters so a draw needs no per-ticket
//! storage. Updates are applied as signed deltas pushed along the
//! waiter-to-holder chain.
//!
//! Selection draws a uniform number below the relevant sum and scans the
//! waiters in arrival order until the running total passes the draw.

use std::sync::{Arc, Mutex, MutexGuard};

use queso_machine::Machine;
use rand::{Rng, SeedableRng, rngs::SmallRng};

use crate::{
    param::{TICKETS_DEFAULT, TICKETS_MAX, TICKETS_MIN},
    thread::Thread,
};

use super::{Graph, QueueId, Scheduler};

pub struct LotteryScheduler {
    machine: Arc<Machine>,
    graph: Mutex<Graph>,
    rng: Mutex<SmallRng>,
}

impl LotteryScheduler {
    pub fn new(machine: Arc<Machine>) -> Self {
        let rng = SmallRng::seed_from_u64(machine.seed());
        Self {
            machine,
            graph: Mutex::new(Graph::default()),
            rng: Mutex::new(rng),
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

/// Applies `delta` to `tid`'s effective tickets and donates it onward
/// along the waiter-to-holder chain. `path` carries the threads already
/// credited on this walk; crossing back into one of them (mutual join)
/// stops the propagation.
fn donate(g: &mut Graph, tid: u64, delta: i64, path: &mut Vec<u64>) {
    if delta == 0 {
        return;
    }
    g.thread_mut(tid).effective += delta;
    let Some(queue) = g.thread(tid).waiting_on else {
        return;
    };
    g.queue_mut(queue).sum_effective += delta;
    let (transfer, holder) = {
        let q = g.queue(queue);
        (q.transfer, q.holder)
    };
    if transfer
        && let Some(holder) = holder
        && holder != tid
        && !path.contains(&holder)
    {
        path.push(tid);
        donate(g, holder, delta, path);
        path.pop();
    }
}

impl Scheduler for LotteryScheduler {
    fn default_priority(&self) -> i64 {
        TICKETS_DEFAULT
    }

    fn min_priority(&self) -> i64 {
        TICKETS_MIN
    }

    fn max_priority(&self) -> i64 {
        TICKETS_MAX
    }

    fn create_queue(&self, transfer: bool) -> QueueId {
        self.graph().create_queue(transfer)
    }

    fn register(&self, thread: &Arc<Thread>) {
        self.graph().register(thread, TICKETS_DEFAULT);
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

    fn set_priority(&self, thread: &Thread, tickets: i64) {
        assert!(
            (TICKETS_MIN..=TICKETS_MAX).contains(&tickets),
            "ticket count {tickets} out of range"
        );
        let mut g = self.graph();
        let tid = thread.id();
        let delta = tickets - g.thread(tid).own;
        g.thread_mut(tid).own = tickets;
        if let Some(queue) = g.thread(tid).waiting_on {
            g.queue_mut(queue).sum_own += delta;
        }
        donate(&mut g, tid, delta, &mut Vec::new());
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
            // Mutual join: the holder already waits on a queue we hold. Its
            // effective count carries our stale credit; zero it back to its
            // own tickets before donating, breaking the feedback loop.
            let back_edge = g
                .thread(holder)
                .waiting_on
                .is_some_and(|q| g.queue(q).holder == Some(tid));
            if back_edge {
                let reset = g.thread(holder).own - g.thread(holder).effective;
                donate(&mut g, holder, reset, &mut vec![tid]);
            }
            let amount = g.thread(tid).effective;
            donate(&mut g, holder, amount, &mut vec![tid]);
        }
    }

    fn acquire(&self, queue: QueueId, thread: &Arc<Thread>) {
        let mut g = self.graph();
        g.assert_unowned_and_empty(queue);
        g.install_holder(queue, thread.id());
    }

    fn next_thread(&self, queue: QueueId) -> Option<Arc<Thread>> {
        let mut g = self.graph();
        if let Some(out) = g.release_holder(queue)
            && g.queue(queue).transfer
        {
            // The outgoing holder loses this queue's donation credit.
            let credit = g.queue(queue).sum_effective;
            donate(&mut g, out, -credit, &mut Vec::new());
        }
        if g.queue(queue).waiters.is_empty() {
            return None;
        }

        let (transfer, total) = {
            let q = g.queue(queue);
            let total = if q.transfer { q.sum_effective } else { q.sum_own };
            (q.transfer, total)
        };
        debug_assert!(total > 0, "a waiter always holds at least one ticket");
        let draw = self.rng.lock().unwrap().random_range(0..total);

        let waiters: Vec<u64> = g.queue(queue).waiters.iter().copied().collect();
        let mut running = 0;
        let mut winner = *waiters.last().expect("queue is not empty");
        for w in waiters {
            let t = g.thread(w);
            running += if transfer { t.effective } else { t.own };
            if running > draw {
                winner = w;
                break;
            }
        }

        g.remove_waiter(queue, winner);
        g.install_holder(queue, winner);
        if transfer {
            // The new holder picks up what the remaining waiters donate.
            let credit = g.queue(queue).sum_effective;
            donate(&mut g, winner, credit, &mut Vec::new());
        }
        Some(g.thread(winner).thread.clone())
    }
}
