//! A binary mutex over a transferring wait queue.

use std::sync::{Arc, Mutex, Weak};

use crate::{
    Kernel, thread,
    thread::{Thread, sched::WaitQueue},
};

/// A lock that at most one thread holds at a time.
///
/// Waiters donate their scheduling weight to the holder through the inner
/// queue, and a release hands the lock to the queue's pick directly: there
/// is no window in which another thread can observe the lock unowned.
pub struct Lock {
    kernel: Weak<Kernel>,
    queue: WaitQueue,
    holder: Mutex<Option<Arc<Thread>>>,
}

impl Lock {
    pub fn new(kernel: &Arc<Kernel>) -> Lock {
        Lock {
            kernel: Arc::downgrade(kernel),
            queue: kernel
                .interrupt()
                .with_disabled(|| kernel.new_wait_queue(true)),
            holder: Mutex::new(None),
        }
    }

    fn kernel(&self) -> Arc<Kernel> {
        self.kernel.upgrade().expect("kernel is gone")
    }

    /// Acquires the lock, blocking while another thread holds it. On
    /// wakeup the caller is already the holder, installed by the release.
    pub fn acquire(&self) {
        let kernel = self.kernel();
        assert!(!self.is_held_by_current_thread(), "lock is not reentrant");

        let status = kernel.interrupt().disable();
        let thread = thread::current(&kernel);
        let held = self.holder.lock().unwrap().is_some();
        if held {
            self.queue.wait_for_access(&thread);
            thread::sleep(&kernel);
            debug_assert!(self.is_held_by_current_thread());
        } else {
            self.queue.acquire(&thread);
            *self.holder.lock().unwrap() = Some(thread);
        }
        kernel.interrupt().restore(status);
    }

    /// Releases the lock, waking and installing the next holder if anyone
    /// waits.
    pub fn release(&self) {
        let kernel = self.kernel();
        assert!(
            self.is_held_by_current_thread(),
            "lock released by a thread that does not hold it"
        );

        let status = kernel.interrupt().disable();
        let next = self.queue.next_thread();
        *self.holder.lock().unwrap() = next.clone();
        if let Some(next) = next {
            thread::ready(&kernel, &next);
        }
        kernel.interrupt().restore(status);
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        let kernel = self.kernel();
        let holder = self.holder.lock().unwrap();
        holder
            .as_ref()
            .is_some_and(|h| Arc::ptr_eq(h, &thread::current(&kernel)))
    }
}
