//! The kernel-wide free-frame pool.
//!
//! Every physical frame a process maps comes from here and goes back here
//! on exit. Ordinary allocation is lock-guarded and fails fast; the page
//! fault path instead blocks the faulting thread until some process exit
//! returns frames. There is no out-of-memory error surface on faults.

use std::sync::{Arc, Mutex, Weak};

use crate::{
    Kernel, sync::Lock, thread,
    thread::{Thread, ThreadState},
};

pub struct FramePool {
    kernel: Weak<Kernel>,
    lock: Lock,
    free: Mutex<Vec<u32>>,
    waiters_lock: Lock,
    /// Threads blocked in a page fault because the pool ran dry.
    waiters: Mutex<Vec<Arc<Thread>>>,
}

impl FramePool {
    pub(crate) fn new(kernel: &Arc<Kernel>, num_frames: usize) -> FramePool {
        FramePool {
            kernel: Arc::downgrade(kernel),
            lock: Lock::new(kernel),
            free: Mutex::new((0..num_frames as u32).rev().collect()),
            waiters_lock: Lock::new(kernel),
            waiters: Mutex::new(Vec::new()),
        }
    }

    fn kernel(&self) -> Arc<Kernel> {
        self.kernel.upgrade().expect("kernel is gone")
    }

    pub fn num_free(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Takes one frame, or `None` if the pool is dry.
    pub fn allocate(&self) -> Option<u32> {
        self.lock.acquire();
        let frame = self.free.lock().unwrap().pop();
        self.lock.release();
        frame
    }

    /// Returns frames to the pool.
    pub fn release(&self, frames: impl IntoIterator<Item = u32>) {
        self.lock.acquire();
        self.free.lock().unwrap().extend(frames);
        self.lock.release();
    }

    /// Takes one frame, blocking through frame starvation. Only the page
    /// fault path uses this; it can wait across an arbitrary number of
    /// process exits.
    pub(crate) fn allocate_blocking(&self) -> u32 {
        let kernel = self.kernel();
        loop {
            if let Some(frame) = self.allocate() {
                return frame;
            }
            let thread = thread::current(&kernel);
            self.waiters_lock.acquire();
            self.waiters.lock().unwrap().push(thread.clone());
            self.waiters_lock.release();

            // Sleep only if, atomically against the wake path, the pool is
            // still dry and we are still enrolled. Anything else means a
            // release slipped in; withdraw and try again.
            let status = kernel.interrupt().disable();
            let dry = self.free.lock().unwrap().is_empty();
            let enrolled = self
                .waiters
                .lock()
                .unwrap()
                .iter()
                .any(|w| Arc::ptr_eq(w, &thread));
            if dry && enrolled {
                thread::sleep(&kernel);
            } else if enrolled {
                self.waiters
                    .lock()
                    .unwrap()
                    .retain(|w| !Arc::ptr_eq(w, &thread));
            }
            kernel.interrupt().restore(status);
        }
    }

    /// Returns a dead process's frames and wakes every frame-starved
    /// thread so it can retry its fault.
    pub fn release_and_wake(&self, frames: impl IntoIterator<Item = u32>) {
        let kernel = self.kernel();
        self.release(frames);

        self.waiters_lock.acquire();
        let woken: Vec<_> = self.waiters.lock().unwrap().drain(..).collect();
        self.waiters_lock.release();

        let status = kernel.interrupt().disable();
        for thread in woken {
            // A waiter that enrolled but has not gone to sleep yet will
            // see the refilled pool when it re-checks under disable.
            if thread.state() == ThreadState::Blocked {
                thread::ready(&kernel, &thread);
            }
        }
        kernel.interrupt().restore(status);
    }
}
