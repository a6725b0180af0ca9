//! queso: a didactic kernel on a simulated machine.
//!
//! The core is the donation-aware scheduling substrate in [`thread`]:
//! wait queues that carry priority (or lottery-ticket) donation from
//! waiters to resource holders, under two pluggable policies. On top of
//! it sit the alarm, locks, condition variables, a rendezvous channel,
//! and a user-process subsystem with demand-allocated pages and a
//! ten-call syscall surface.
//!
//! A [`Kernel`] is bound to one [`queso_machine::Machine`]; everything is
//! instance-based, so tests can boot as many kernels as they like, in
//! parallel.

use std::{
    any::Any,
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use queso_machine::{Interrupt, Machine, MachineConfig};

pub mod alarm;
pub mod error;
pub mod memory;
pub mod param;
pub mod proc;
pub mod progs;
pub mod sync;
pub mod syscall;
pub mod thread;

use self::{
    alarm::Alarm,
    memory::frame::FramePool,
    sync::Lock,
    thread::{
        Thread,
        sched::{LotteryScheduler, PriorityScheduler, Scheduler, WaitQueue},
    },
};

/// Which scheduling policy the kernel boots with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Donation by maximum, selection by highest effective priority.
    #[default]
    Priority,
    /// Donation by addition, selection by weighted random draw.
    Lottery,
}

#[derive(Debug, Clone, Default)]
pub struct KernelConfig {
    pub policy: SchedPolicy,
    pub machine: MachineConfig,
}

/// Pieces that need a live `Arc<Kernel>` to build, filled in right after
/// allocation.
struct Late {
    alarm: Option<Arc<Alarm>>,
    frame_pool: Option<Arc<FramePool>>,
    pid_lock: Option<Arc<Lock>>,
}

pub struct Kernel {
    machine: Arc<Machine>,
    scheduler: Arc<dyn Scheduler>,
    runtime: thread::Runtime,
    late: Mutex<Late>,
    /// pid to thread, for join and liveness; guarded by its own lock.
    pids: Mutex<HashMap<u32, Arc<Thread>>>,
    next_pid: AtomicU32,
    /// A panic that escaped the boot body, re-raised by the driver.
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Kernel {
    /// Builds a machine and a kernel on it. The kernel is idle until
    /// [`run`] starts the first thread.
    ///
    /// [`run`]: Kernel::run
    pub fn start(config: &KernelConfig) -> Arc<Kernel> {
        let machine = Machine::new(&config.machine);
        let scheduler: Arc<dyn Scheduler> = match config.policy {
            SchedPolicy::Priority => Arc::new(PriorityScheduler::new(machine.clone())),
            SchedPolicy::Lottery => Arc::new(LotteryScheduler::new(machine.clone())),
        };

        let kernel = Arc::new(Kernel {
            machine: machine.clone(),
            scheduler,
            runtime: thread::Runtime::new(),
            late: Mutex::new(Late {
                alarm: None,
                frame_pool: None,
                pid_lock: None,
            }),
            pids: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(0),
            panic: Mutex::new(None),
        });

        kernel
            .runtime
            .init_ready(kernel.interrupt().with_disabled(|| kernel.new_wait_queue(false)));
        {
            let mut late = kernel.late.lock().unwrap();
            late.alarm = Some(Alarm::new(&kernel));
            late.frame_pool = Some(Arc::new(FramePool::new(
                &kernel,
                machine.num_phys_pages(),
            )));
            late.pid_lock = Some(Arc::new(Lock::new(&kernel)));
        }

        let weak = Arc::downgrade(&kernel);
        machine.processor().set_exception_handler(move |exception| {
            let kernel = weak.upgrade().expect("kernel is gone");
            let process = kernel
                .current_process()
                .expect("guest exception outside a process");
            process.handle_exception(exception);
        });

        kernel
    }

    /// Runs `body` as the first kernel thread and blocks the calling
    /// (host) thread until the machine shuts down: when `body` returns,
    /// when a root `halt` succeeds, or when the last process exits.
    ///
    /// A panic inside the simulation (a failed test assertion) is
    /// re-raised here.
    pub fn run(self: &Arc<Self>, body: impl FnOnce() + Send + 'static) {
        thread::boot(self, body);
        self.machine.wait_shutdown();
        if let Some(payload) = self.panic.lock().unwrap().take() {
            std::panic::resume_unwind(payload);
        }
    }

    /// Boots the root process: runs `program` with `args` as pid 0 and
    /// waits for the machine to stop.
    pub fn run_program(self: &Arc<Self>, program: &str, args: &[String]) {
        let kernel = self.clone();
        let program = program.to_owned();
        let args = args.to_vec();
        self.run(move || {
            let root = proc::Process::new(&kernel);
            assert!(
                root.execute(&program, &args),
                "root program {program} failed to load"
            );
            thread::finish(&kernel);
        });
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn interrupt(&self) -> &Interrupt {
        self.machine.interrupt()
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub(crate) fn runtime(&self) -> &thread::Runtime {
        &self.runtime
    }

    pub fn alarm(&self) -> Arc<Alarm> {
        self.late.lock().unwrap().alarm.clone().expect("kernel is booted")
    }

    pub fn frame_pool(&self) -> Arc<FramePool> {
        self.late
            .lock()
            .unwrap()
            .frame_pool
            .clone()
            .expect("kernel is booted")
    }

    /// A new scheduler wait queue. Interrupts must be disabled.
    pub fn new_wait_queue(&self, transfer: bool) -> WaitQueue {
        WaitQueue::new(self.scheduler.clone(), transfer)
    }

    pub fn current_thread(&self) -> Arc<Thread> {
        thread::current(self)
    }

    pub fn current_process(&self) -> Option<Arc<proc::Process>> {
        thread::current(self).process()
    }

    // Scheduling-state surface: own and effective weight of a thread, and
    // the bounded ±1 adjustments for the calling thread.

    pub fn priority_of(&self, thread: &Thread) -> i64 {
        self.interrupt()
            .with_disabled(|| self.scheduler.priority_of(thread))
    }

    pub fn effective_priority_of(&self, thread: &Thread) -> i64 {
        self.interrupt()
            .with_disabled(|| self.scheduler.effective_priority_of(thread))
    }

    pub fn set_priority(&self, thread: &Thread, priority: i64) {
        self.interrupt()
            .with_disabled(|| self.scheduler.set_priority(thread, priority));
    }

    pub fn increase_priority(&self) -> bool {
        self.interrupt().with_disabled(|| {
            let thread = thread::current(self);
            let priority = self.scheduler.priority_of(&thread);
            if priority == self.scheduler.max_priority() {
                return false;
            }
            self.scheduler.set_priority(&thread, priority + 1);
            true
        })
    }

    pub fn decrease_priority(&self) -> bool {
        self.interrupt().with_disabled(|| {
            let thread = thread::current(self);
            let priority = self.scheduler.priority_of(&thread);
            if priority == self.scheduler.min_priority() {
                return false;
            }
            self.scheduler.set_priority(&thread, priority - 1);
            true
        })
    }

    // Process bookkeeping.

    pub(crate) fn allocate_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_process(&self, pid: u32, thread: &Arc<Thread>) {
        self.with_pid_lock(|| {
            self.pids.lock().unwrap().insert(pid, thread.clone());
        });
    }

    /// Drops `pid` from the map, returning how many processes remain.
    pub(crate) fn remove_process(&self, pid: u32) -> usize {
        self.with_pid_lock(|| {
            let mut pids = self.pids.lock().unwrap();
            pids.remove(&pid);
            pids.len()
        })
    }

    pub fn thread_by_pid(&self, pid: u32) -> Option<Arc<Thread>> {
        self.with_pid_lock(|| self.pids.lock().unwrap().get(&pid).cloned())
    }

    /// Runs `f` under the pid-map lock. The lock is a kernel [`Lock`], so
    /// it must be cloned out before acquiring: acquiring may block, and
    /// nothing else can be held across that.
    fn with_pid_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let lock = self
            .late
            .lock()
            .unwrap()
            .pid_lock
            .clone()
            .expect("kernel is booted");
        lock.acquire();
        let r = f();
        lock.release();
        r
    }

    pub(crate) fn store_panic(&self, payload: Box<dyn Any + Send>) {
        *self.panic.lock().unwrap() = Some(payload);
    }
}
