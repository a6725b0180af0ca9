//! Condition variables over a non-transferring wait queue.
//!
//! The queue must not transfer donation: a condition has no resource
//! holder, so blocked waiters would be donating to nobody.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use crate::{Kernel, sync::Lock, thread, thread::sched::WaitQueue};

pub struct Condition {
    kernel: Weak<Kernel>,
    lock: Arc<Lock>,
    queue: WaitQueue,
    /// Set when the last dequeue came up empty; cleared by `sleep`.
    /// `wake_all` drains until this flips. Callers hold the associated
    /// lock, so the flag cannot race with a new sleeper.
    empty: AtomicBool,
}

impl Condition {
    /// Creates a condition tied to `lock`. The current thread must hold
    /// `lock` whenever it sleeps on or wakes this condition.
    pub fn new(kernel: &Arc<Kernel>, lock: Arc<Lock>) -> Condition {
        Condition {
            kernel: Arc::downgrade(kernel),
            lock,
            queue: kernel
                .interrupt()
                .with_disabled(|| kernel.new_wait_queue(false)),
            empty: AtomicBool::new(false),
        }
    }

    fn kernel(&self) -> Arc<Kernel> {
        self.kernel.upgrade().expect("kernel is gone")
    }

    /// Atomically releases the lock and blocks until woken, then
    /// reacquires the lock.
    pub fn sleep(&self) {
        assert!(self.lock.is_held_by_current_thread());
        let kernel = self.kernel();

        self.lock.release();
        let status = kernel.interrupt().disable();
        self.empty.store(false, Ordering::Relaxed);
        self.queue.wait_for_access(&thread::current(&kernel));
        thread::sleep(&kernel);
        kernel.interrupt().restore(status);
        self.lock.acquire();
    }

    /// Wakes at most one sleeping thread.
    pub fn wake(&self) {
        assert!(self.lock.is_held_by_current_thread());
        let kernel = self.kernel();

        let status = kernel.interrupt().disable();
        if let Some(next) = self.queue.next_thread() {
            thread::ready(&kernel, &next);
        } else {
            self.empty.store(true, Ordering::Relaxed);
        }
        kernel.interrupt().restore(status);
    }

    /// Wakes every sleeping thread.
    pub fn wake_all(&self) {
        assert!(self.lock.is_held_by_current_thread());
        while !self.empty.load(Ordering::Relaxed) {
            self.wake();
        }
    }
}
