//! Utilities for controlling interrupt enability and the simulated clock.
//!
//! Interrupt disable is the single mutual-exclusion primitive the kernel
//! has. Exactly one simulated thread executes at a time (see [`crate::tcb`]),
//! so the enabled flag is not protecting against real parallelism; it decides
//! whether the clock may deliver pending device interrupts.
//!
//! Time only passes when something happens: re-enabling interrupts advances
//! the clock by [`KERNEL_TICK`], and every guest memory or syscall operation
//! advances it by [`USER_TICK`]. Handlers always run with interrupts off.

use std::{collections::BTreeMap, sync::Mutex};

/// Clock advance for each disabled-to-enabled transition.
pub const KERNEL_TICK: u64 = 10;
/// Clock advance for each guest operation.
pub const USER_TICK: u64 = 1;

type Handler = Box<dyn FnOnce() + Send>;

struct IntState {
    enabled: bool,
    ticks: u64,
    /// Scheduled device interrupts, keyed by (due tick, arrival order).
    pending: BTreeMap<(u64, u64), Handler>,
    seq: u64,
}

/// The interrupt controller and tick clock of the simulated machine.
pub struct Interrupt {
    state: Mutex<IntState>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IntState {
                enabled: false,
                ticks: 0,
                pending: BTreeMap::new(),
                seq: 0,
            }),
        }
    }

    /// Disables interrupts, returning the previous status for [`restore`].
    ///
    /// [`restore`]: Interrupt::restore
    pub fn disable(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        std::mem::replace(&mut st.enabled, false)
    }

    /// Restores the status saved by a matching [`disable`].
    ///
    /// [`disable`]: Interrupt::disable
    pub fn restore(&self, status: bool) {
        if status {
            self.enable();
        }
    }

    /// Enables interrupts.
    ///
    /// The disabled-to-enabled transition is where kernel time passes and
    /// where due device interrupts are delivered.
    pub fn enable(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.enabled {
                return;
            }
            st.enabled = true;
        }
        self.advance(KERNEL_TICK);
    }

    /// Returns `true` if interrupts are enabled.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    /// Current simulated time, in ticks.
    pub fn time(&self) -> u64 {
        self.state.lock().unwrap().ticks
    }

    /// Runs `f` with interrupts disabled, restoring the previous status
    /// afterwards. `f` may suspend the calling thread; the status is
    /// restored once it resumes.
    pub fn with_disabled<R>(&self, f: impl FnOnce() -> R) -> R {
        let status = self.disable();
        let r = f();
        self.restore(status);
        r
    }

    /// Schedules `handler` to fire `delay` ticks from now.
    pub fn schedule(&self, delay: u64, handler: Handler) {
        let mut st = self.state.lock().unwrap();
        let when = st.ticks + delay;
        let seq = st.seq;
        st.seq += 1;
        st.pending.insert((when, seq), handler);
    }

    /// Advances the clock by `n` ticks if interrupts are enabled, delivering
    /// any interrupts that come due.
    pub fn tick(&self, n: u64) {
        {
            let mut st = self.state.lock().unwrap();
            if !st.enabled {
                return;
            }
            st.ticks += n;
        }
        self.service();
    }

    /// Advances the clock to the next pending interrupt and delivers it.
    ///
    /// Called when no thread is ready to run; the caller must have
    /// interrupts disabled (the handler therefore runs in the usual
    /// interrupts-off regime). Returns `false` if nothing is pending, which
    /// the caller must treat as a dead machine.
    pub fn idle(&self) -> bool {
        let handler = {
            let mut st = self.state.lock().unwrap();
            debug_assert!(!st.enabled, "idling with interrupts enabled");
            let Some((&(when, _), _)) = st.pending.first_key_value() else {
                return false;
            };
            if st.ticks < when {
                st.ticks = when;
            }
            let (_, handler) = st.pending.pop_first().unwrap();
            handler
        };
        log::trace!("clock idles forward");
        handler();
        true
    }

    fn advance(&self, n: u64) {
        {
            let mut st = self.state.lock().unwrap();
            st.ticks += n;
        }
        self.service();
    }

    /// Delivers every due interrupt. The enabled flag is cleared while a
    /// handler runs; the handler may suspend the current thread, in which
    /// case delivery resumes when the thread is scheduled again.
    fn service(&self) {
        loop {
            let handler = {
                let mut st = self.state.lock().unwrap();
                if !st.enabled {
                    return;
                }
                let due = st
                    .pending
                    .first_key_value()
                    .is_some_and(|(&(when, _), _)| when <= st.ticks);
                if !due {
                    return;
                }
                st.enabled = false;
                let (_, handler) = st.pending.pop_first().unwrap();
                handler
            };
            handler();
            self.state.lock().unwrap().enabled = true;
        }
    }
}
