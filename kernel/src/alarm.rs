//! The alarm: timer-driven sleeps.
//!
//! Threads that call [`Alarm::wait_until`] park themselves in a min-heap
//! keyed by wake time. The timer interrupt pops everything whose deadline
//! has passed and puts it back on the ready set, then asks the current
//! thread to yield, which is what makes the timer preemptive.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{Kernel, thread, thread::ThreadState};

struct Waiter {
    wake: u64,
    seq: u64,
    thread: Arc<thread::Thread>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        (self.wake, self.seq) == (other.wake, other.seq)
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.wake, self.seq).cmp(&(other.wake, other.seq))
    }
}

pub struct Alarm {
    kernel: Weak<Kernel>,
    waiters: Mutex<BinaryHeap<Reverse<Waiter>>>,
    seq: AtomicU64,
}

impl Alarm {
    /// Builds the alarm and hooks it up as the machine's timer handler.
    /// One alarm per machine.
    pub(crate) fn new(kernel: &Arc<Kernel>) -> Arc<Alarm> {
        let alarm = Arc::new(Alarm {
            kernel: Arc::downgrade(kernel),
            waiters: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        });
        let handler = alarm.clone();
        kernel.machine().timer().set_handler(move || {
            handler.timer_interrupt();
        });
        alarm
    }

    fn kernel(&self) -> Arc<Kernel> {
        self.kernel.upgrade().expect("kernel is gone")
    }

    /// Blocks the calling thread for at least `x` ticks.
    ///
    /// The comparator in the interrupt handler is strict, so a thread
    /// whose deadline lands exactly on a timer tick sleeps one more
    /// period.
    pub fn wait_until(&self, x: u64) {
        let kernel = self.kernel();
        let timer = kernel.machine().timer();
        let wake = timer.time() + x;
        while timer.time() < wake {
            let status = kernel.interrupt().disable();
            let thread = thread::current(&kernel);
            self.waiters.lock().unwrap().push(Reverse(Waiter {
                wake,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                thread,
            }));
            thread::sleep(&kernel);
            kernel.interrupt().restore(status);
        }
    }

    /// The timer interrupt: wake everything past due, then give up the
    /// processor.
    fn timer_interrupt(&self) {
        let kernel = self.kernel();
        let status = kernel.interrupt().disable();
        let now = kernel.machine().timer().time();
        loop {
            let mut waiters = self.waiters.lock().unwrap();
            if !waiters.peek().is_some_and(|Reverse(w)| w.wake < now) {
                break;
            }
            let Reverse(waiter) = waiters.pop().unwrap();
            drop(waiters);
            thread::ready(&kernel, &waiter.thread);
        }
        kernel.interrupt().restore(status);

        // The tick may also land while the clock is idling forward on
        // behalf of a thread that is mid-block; only a running thread can
        // give up the processor.
        let current = thread::current(&kernel);
        if current.state() == ThreadState::Running {
            thread::yield_now(&kernel);
        }
    }
}
