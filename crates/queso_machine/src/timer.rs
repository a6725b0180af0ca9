//! The periodic timer device.
//!
//! Fires roughly every [`Machine`] config period (500 ticks by default),
//! invoking the handler the kernel installed — queso's alarm — and asking
//! for the next interrupt. Mirrors the shape of a hardware timer that must
//! be re-armed from its own interrupt.

use std::sync::{Arc, Mutex, Weak};

use crate::Machine;

type TimerHandler = Arc<dyn Fn() + Send + Sync>;

pub struct Timer {
    machine: Weak<Machine>,
    period: u64,
    handler: Mutex<Option<TimerHandler>>,
}

impl Timer {
    pub(crate) fn new(machine: Weak<Machine>, period: u64) -> Self {
        Self {
            machine,
            period,
            handler: Mutex::new(None),
        }
    }

    /// Current simulated time, in ticks.
    pub fn time(&self) -> u64 {
        self.machine
            .upgrade()
            .map_or(0, |m| m.interrupt().time())
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    /// Installs the interrupt handler and asks for the first interrupt.
    pub fn set_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        let previous = self.handler.lock().unwrap().replace(Arc::new(handler));
        assert!(previous.is_none(), "the timer handler is already installed");
        self.schedule_next();
    }

    fn schedule_next(&self) {
        let Some(machine) = self.machine.upgrade() else {
            return;
        };
        let weak = self.machine.clone();
        machine.interrupt().schedule(
            self.period,
            Box::new(move || {
                if let Some(machine) = weak.upgrade() {
                    machine.timer().fire();
                }
            }),
        );
    }

    fn fire(&self) {
        self.schedule_next();
        // Do not hold the lock across the call: the handler may switch
        // threads, and the next firing must be able to get at it.
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}
