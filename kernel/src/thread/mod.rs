//! Kernel threads.
//!
//! A thread moves through New, Ready, Running, Blocked and Finished. All
//! state transitions happen with interrupts disabled; the ready set is
//! itself a scheduler wait queue, and the running thread is its resource
//! holder. Each thread carries a transferring join queue whose holder is
//! the thread itself, so joiners donate their scheduling weight to the
//! thread they wait for.

use std::{
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use queso_machine::tcb::Tcb;

use crate::{Kernel, proc::Process, thread::sched::WaitQueue};

pub mod sched;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    New,
    Ready,
    Running,
    Blocked,
    Finished,
}

type StateHook = Box<dyn Fn() + Send + Sync>;

pub struct Thread {
    id: u64,
    name: String,
    state: Mutex<ThreadState>,
    tcb: Mutex<Option<Tcb>>,
    join_queue: WaitQueue,
    /// Runs when the thread is switched away from; user-process threads
    /// snapshot the register file here.
    save_hook: Mutex<Option<StateHook>>,
    /// Runs on every switch-in; user-process threads point the processor
    /// at their page table and restore their registers here.
    restore_hook: Mutex<Option<StateHook>>,
    process: Mutex<Option<Weak<Process>>>,
}

impl Thread {
    /// Creates a thread in the New state, registered with the scheduler.
    /// Its join queue transfers donation and is held by the thread itself
    /// from the start.
    pub fn new(kernel: &Arc<Kernel>, name: impl Into<String>) -> Arc<Thread> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        kernel.interrupt().with_disabled(|| {
            let thread = Arc::new(Thread {
                id,
                name: name.into(),
                state: Mutex::new(ThreadState::New),
                tcb: Mutex::new(None),
                join_queue: kernel.new_wait_queue(true),
                save_hook: Mutex::new(None),
                restore_hook: Mutex::new(None),
                process: Mutex::new(None),
            });
            kernel.scheduler().register(&thread);
            thread.join_queue.acquire(&thread);
            thread
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn set_tcb(&self, tcb: Tcb) {
        let previous = self.tcb.lock().unwrap().replace(tcb);
        assert!(previous.is_none(), "thread forked twice");
    }

    fn tcb(&self) -> Tcb {
        self.tcb.lock().unwrap().clone().expect("thread has no tcb")
    }

    pub(crate) fn set_save_hook(&self, hook: StateHook) {
        *self.save_hook.lock().unwrap() = Some(hook);
    }

    pub(crate) fn set_restore_hook(&self, hook: StateHook) {
        *self.restore_hook.lock().unwrap() = Some(hook);
    }

    pub(crate) fn set_process(&self, process: &Arc<Process>) {
        *self.process.lock().unwrap() = Some(Arc::downgrade(process));
    }

    pub(crate) fn process(&self) -> Option<Arc<Process>> {
        self.process.lock().unwrap().as_ref()?.upgrade()
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Current-thread tracking and the ready set.
pub(crate) struct Runtime {
    current: Mutex<Option<Arc<Thread>>>,
    ready: Mutex<Option<WaitQueue>>,
}

impl Runtime {
    pub(crate) fn new() -> Self {
        Self {
            current: Mutex::new(None),
            ready: Mutex::new(None),
        }
    }

    pub(crate) fn init_ready(&self, queue: WaitQueue) {
        *self.ready.lock().unwrap() = Some(queue);
    }

    pub(crate) fn ready_queue(&self) -> WaitQueue {
        self.ready.lock().unwrap().clone().expect("runtime not booted")
    }
}

/// The running thread.
pub fn current(kernel: &Kernel) -> Arc<Thread> {
    kernel
        .runtime()
        .current
        .lock()
        .unwrap()
        .clone()
        .expect("no thread is running")
}

/// Starts a New thread: binds its control block and puts it on the ready
/// set. `body` runs with interrupts enabled and the thread finishes when
/// it returns.
pub fn fork(kernel: &Arc<Kernel>, thread: &Arc<Thread>, body: impl FnOnce() + Send + 'static) {
    assert_eq!(thread.state(), ThreadState::New, "forking a used thread");
    log::trace!("forking {thread}");

    let k = kernel.clone();
    let tcb = Tcb::spawn(thread.name(), move || {
        k.machine().interrupt().enable();
        body();
        finish(&k);
    });
    thread.set_tcb(tcb);

    kernel.interrupt().with_disabled(|| ready(kernel, thread));
}

/// Moves a non-running thread onto the ready set.
pub(crate) fn ready(kernel: &Kernel, thread: &Arc<Thread>) {
    debug_assert!(!kernel.interrupt().is_enabled());
    debug_assert!(!matches!(
        thread.state(),
        ThreadState::Ready | ThreadState::Finished
    ));
    thread.set_state(ThreadState::Ready);
    kernel.runtime().ready_queue().wait_for_access(thread);
}

/// Yields the processor for one scheduling round.
pub fn yield_now(kernel: &Kernel) {
    let status = kernel.interrupt().disable();
    let thread = current(kernel);
    debug_assert_eq!(thread.state(), ThreadState::Running);
    ready(kernel, &thread);
    schedule(kernel);
    kernel.interrupt().restore(status);
}

/// Blocks the calling thread. Interrupts must be disabled, and the caller
/// must already have arranged its wakeup (a wait queue, the alarm, the
/// frame pool). Returns once somebody calls [`ready`] on it.
pub fn sleep(kernel: &Kernel) {
    assert!(
        !kernel.interrupt().is_enabled(),
        "sleeping with interrupts enabled"
    );
    let thread = current(kernel);
    thread.set_state(ThreadState::Blocked);
    schedule(kernel);
}

/// Blocks until `target` finishes. Donation flows to the target through
/// its join queue; a finished target returns immediately.
pub fn join(kernel: &Kernel, target: &Arc<Thread>) {
    let status = kernel.interrupt().disable();
    let thread = current(kernel);
    assert!(!Arc::ptr_eq(&thread, target), "thread joining itself");
    if target.state() != ThreadState::Finished {
        log::trace!("{thread} joins {target}");
        target.join_queue.wait_for_access(&thread);
        thread.set_state(ThreadState::Blocked);
        schedule(kernel);
    }
    kernel.interrupt().restore(status);
}

/// Terminates the calling thread: wakes all joiners, releases its
/// scheduling state and never returns.
pub fn finish(kernel: &Kernel) -> ! {
    kernel.interrupt().disable();
    let thread = current(kernel);
    log::trace!("{thread} finished");
    while let Some(joiner) = thread.join_queue.next_thread() {
        ready(kernel, &joiner);
    }
    thread.set_state(ThreadState::Finished);
    schedule_and_exit(kernel, &thread)
}

/// Picks the next ready thread, letting the clock idle forward when the
/// ready set is empty.
fn next_ready(kernel: &Kernel) -> Arc<Thread> {
    let mut idles: u64 = 0;
    loop {
        if let Some(next) = kernel.runtime().ready_queue().next_thread() {
            return next;
        }
        assert!(
            kernel.machine().interrupt().idle(),
            "no threads ready and no pending interrupts"
        );
        // The timer always re-arms itself, so a machine whose threads are
        // all blocked on each other would idle forever; give up instead.
        idles += 1;
        assert!(idles < 10_000_000, "machine deadlock: nothing ever wakes");
    }
}

fn switch_in(kernel: &Kernel, next: &Arc<Thread>) {
    next.set_state(ThreadState::Running);
    *kernel.runtime().current.lock().unwrap() = Some(next.clone());
    let hook = next.restore_hook.lock().unwrap();
    if let Some(hook) = hook.as_ref() {
        hook();
    }
}

/// Hands the processor to the next ready thread. The caller has already
/// left the Running state; control returns here once the thread is
/// scheduled again.
pub(crate) fn schedule(kernel: &Kernel) {
    let thread = current(kernel);
    debug_assert_ne!(thread.state(), ThreadState::Running);
    let next = next_ready(kernel);
    if Arc::ptr_eq(&next, &thread) {
        // The clock idled forward and our own wakeup came due.
        thread.set_state(ThreadState::Running);
        return;
    }
    log::trace!("switch {thread} -> {next}");
    {
        let hook = thread.save_hook.lock().unwrap();
        if let Some(hook) = hook.as_ref() {
            hook();
        }
    }
    let from = thread.tcb();
    let to = next.tcb();
    switch_in(kernel, &next);
    from.switch_to(&to);
}

fn schedule_and_exit(kernel: &Kernel, thread: &Arc<Thread>) -> ! {
    let next = next_ready(kernel);
    debug_assert!(!Arc::ptr_eq(&next, thread));
    kernel.scheduler().unregister(thread);
    let from = thread.tcb();
    let to = next.tcb();
    switch_in(kernel, &next);
    from.switch_and_exit(&to)
}

/// Sets up the very first thread and starts the simulation. The boot
/// thread acquires the ready set (the running thread is its holder) and
/// signals machine shutdown when `body` returns; a body that instead
/// finishes (a kernel that boots a root process) leaves shutdown to the
/// exit path.
pub(crate) fn boot(kernel: &Arc<Kernel>, body: impl FnOnce() + Send + 'static) {
    let main = Thread::new(kernel, "main");
    let k = kernel.clone();
    let tcb = Tcb::spawn("main", move || {
        k.machine().interrupt().enable();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
        match result {
            Ok(()) => {}
            Err(payload) if queso_machine::tcb::is_exit_payload(&*payload) => {
                std::panic::resume_unwind(payload)
            }
            Err(payload) => kernel_panic(&k, payload),
        }
        k.machine().request_shutdown();
        queso_machine::tcb::exit_thread();
    });
    main.set_tcb(tcb);

    kernel.interrupt().with_disabled(|| {
        kernel.runtime().ready_queue().acquire(&main);
        main.set_state(ThreadState::Running);
        *kernel.runtime().current.lock().unwrap() = Some(main.clone());
    });
    main.tcb().grant();
}

/// Records a panic out of the boot body so the driver can re-raise it.
fn kernel_panic(kernel: &Kernel, payload: Box<dyn std::any::Any + Send>) {
    kernel.store_panic(payload);
}
