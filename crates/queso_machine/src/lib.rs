//! The simulated hardware that the queso kernel runs on.
//!
//! One [`Machine`] bundles an interrupt controller with a tick clock, a
//! periodic timer, byte memory behind a page/frame split, a processor with
//! registers and an exception vector, a console, and an in-memory file
//! system. Machines are self-contained: several can coexist in one host
//! process, which is what lets kernel tests run in parallel.
//!
//! The kernel consumes all of this through narrow seams — interrupt
//! disable/restore, the timer's time and handler hook, processor registers
//! and page-table pointer, the loader's section walk, `FileSystem`, and the
//! raw context switch in [`tcb`].

use std::{
    sync::{Arc, Condvar, Mutex, Weak},
    time::Duration,
};

pub mod console;
pub mod fs;
pub mod interrupt;
pub mod loader;
pub mod mem;
pub mod processor;
pub mod tcb;
pub mod timer;

pub use self::{
    console::Console,
    fs::{FileSystem, MemFileSystem, OpenFile},
    interrupt::Interrupt,
    loader::{Binary, Image},
    mem::{EntryFlags, MainMemory, PAGE_SIZE, TranslationEntry},
    processor::{Exception, GuestCpu, Processor, Program, Registers},
    timer::Timer,
};

/// How long the driver waits for the simulation before declaring it hung.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Knobs for building a [`Machine`].
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Number of physical memory pages.
    pub phys_pages: usize,
    /// Ticks between timer interrupts.
    pub timer_period: u64,
    /// Seed for whatever randomness the kernel wants (lottery draws).
    pub seed: u64,
    /// Bytes preloaded into console input.
    pub console_input: Vec<u8>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            phys_pages: 32,
            timer_period: 500,
            seed: 0x9e37_79b9,
            console_input: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Shutdown {
    done: Mutex<bool>,
    cv: Condvar,
}

/// The assembled machine.
pub struct Machine {
    seed: u64,
    interrupt: Interrupt,
    timer: Timer,
    memory: Mutex<MainMemory>,
    processor: Processor,
    console: Console,
    fs: MemFileSystem,
    shutdown: Shutdown,
}

impl Machine {
    pub fn new(config: &MachineConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Machine>| Self {
            seed: config.seed,
            interrupt: Interrupt::new(),
            timer: Timer::new(weak.clone(), config.timer_period),
            memory: Mutex::new(MainMemory::new(config.phys_pages)),
            processor: Processor::new(config.phys_pages),
            console: Console::new(config.console_input.clone()),
            fs: MemFileSystem::new(),
            shutdown: Shutdown::default(),
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// The stub file system, as the kernel-facing trait.
    pub fn file_system(&self) -> &dyn FileSystem {
        &self.fs
    }

    /// The stub file system with its test/tool surface.
    pub fn stub_file_system(&self) -> &MemFileSystem {
        &self.fs
    }

    pub fn num_phys_pages(&self) -> usize {
        self.processor.num_phys_pages()
    }

    /// Runs `f` over physical memory.
    ///
    /// The lock is held only for the duration of `f`; callers must not
    /// suspend inside.
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut MainMemory) -> R) -> R {
        f(&mut self.memory.lock().unwrap())
    }

    /// Registers an executable with the stub file system.
    pub fn install_binary(&self, name: &str, binary: Binary) {
        self.fs.install_binary(name, binary);
    }

    /// Resolves `name` to an installed executable.
    pub fn load_binary(&self, name: &str) -> Option<Binary> {
        self.fs.binary(name)
    }

    /// Executes a guest program on the calling (simulated) thread.
    pub fn run_guest(&self, program: &dyn Program) {
        let cpu = GuestCpu::new(self);
        program.run(&cpu);
    }

    /// Stops the machine: lets the driver return. The calling simulated
    /// thread is torn down and never runs again.
    pub fn halt(&self) -> ! {
        log::debug!("machine halting at tick {}", self.interrupt.time());
        self.request_shutdown();
        tcb::exit_thread();
    }

    /// Signals the driver without tearing down the calling thread.
    pub fn request_shutdown(&self) {
        let mut done = self.shutdown.done.lock().unwrap();
        *done = true;
        self.shutdown.cv.notify_all();
    }

    /// Blocks the driver (host) thread until the simulation stops.
    ///
    /// Panics if the machine is still running after a generous wall-clock
    /// timeout, so a deadlocked simulation fails loudly instead of hanging
    /// its test.
    pub fn wait_shutdown(&self) {
        let mut done = self.shutdown.done.lock().unwrap();
        while !*done {
            let (guard, timeout) = self
                .shutdown
                .cv
                .wait_timeout(done, SHUTDOWN_TIMEOUT)
                .unwrap();
            done = guard;
            assert!(
                !(timeout.timed_out() && !*done),
                "machine did not shut down within {SHUTDOWN_TIMEOUT:?}"
            );
        }
    }
}
