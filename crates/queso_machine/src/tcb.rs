//! Thread control blocks: the raw context switch.
//!
//! Every simulated kernel thread is backed by a host thread, and a baton
//! decides which one may execute. A switch grants the baton to the target
//! and then blocks on our own; the invariant that at most one baton is
//! granted at a time is what makes interrupt-disable a sufficient lock for
//! the kernel above.
//!
//! A finishing thread cannot return through its own call stack (it may be
//! arbitrarily deep in kernel frames), so it hands the baton over and then
//! unwinds the host thread with a sentinel caught by the trampoline.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, Once},
    thread,
};

/// Payload used to unwind a host thread whose simulated thread is done.
struct ExitToken;

struct Baton {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            granted: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn grant(&self) {
        let mut granted = self.granted.lock().unwrap();
        debug_assert!(!*granted, "granting a baton that is already granted");
        *granted = true;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut granted = self.granted.lock().unwrap();
        while !*granted {
            granted = self.cv.wait(granted).unwrap();
        }
        *granted = false;
    }
}

/// A thread control block bound to one host thread.
///
/// Clones share the baton; cloning exists so a switch can be performed
/// without holding whatever lock stores the block.
#[derive(Clone)]
pub struct Tcb {
    baton: Arc<Baton>,
}

impl Tcb {
    /// Spawns the host thread for a new simulated thread.
    ///
    /// `body` does not run until the first [`grant`]; it is expected to
    /// diverge (via [`exit_thread`]) rather than return.
    ///
    /// [`grant`]: Tcb::grant
    pub fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> Tcb {
        install_exit_hook();
        let baton = Arc::new(Baton::new());
        let handoff = baton.clone();
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                handoff.wait();
                match panic::catch_unwind(AssertUnwindSafe(body)) {
                    Ok(()) => {}
                    Err(payload) if payload.is::<ExitToken>() => {}
                    Err(payload) => panic::resume_unwind(payload),
                }
            })
            .expect("spawning a host thread");
        Tcb { baton }
    }

    /// Makes the target runnable. Used to start the very first thread; a
    /// running thread switches with [`switch_to`] instead.
    ///
    /// [`switch_to`]: Tcb::switch_to
    pub fn grant(&self) {
        self.baton.grant();
    }

    /// Suspends the calling thread and resumes `next`.
    ///
    /// Returns when somebody grants our baton back.
    pub fn switch_to(&self, next: &Tcb) {
        next.baton.grant();
        self.baton.wait();
    }

    /// Resumes `next` and tears down the calling host thread.
    pub fn switch_and_exit(&self, next: &Tcb) -> ! {
        next.baton.grant();
        exit_thread();
    }
}

/// Tears down the calling host thread without resuming anybody.
///
/// Must not be called while holding any lock.
pub fn exit_thread() -> ! {
    panic::panic_any(ExitToken);
}

/// Whether a caught unwind payload is the sentinel from [`exit_thread`].
///
/// Code that wraps simulated-thread bodies in its own `catch_unwind` must
/// re-raise such payloads instead of treating them as failures.
pub fn is_exit_payload(payload: &(dyn std::any::Any + Send)) -> bool {
    payload.is::<ExitToken>()
}

/// Keeps the default panic hook from reporting sentinel unwinds.
fn install_exit_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().is::<ExitToken>() {
                return;
            }
            previous(info);
        }));
    });
}
