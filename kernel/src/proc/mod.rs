//! User processes.
//!
//! A process owns a page table over the machine's full virtual range, the
//! frames backing its valid pages, a table of open files, its children,
//! and the kernel thread its program runs on. Pages other than the loaded
//! sections and the argv page appear on first touch: the page fault
//! handler takes a frame from the kernel-wide pool, blocking through
//! starvation if it must.

mod exec;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use queso_machine::{Exception, OpenFile, PAGE_SIZE, Registers, TranslationEntry};

use crate::{
    Kernel,
    error::KernelError,
    memory::{self, PageTable},
    param::MAX_ARG_LEN,
    thread,
    thread::Thread,
};

pub(crate) use exec::Layout;

/// Open files, keyed by monotonically assigned descriptor ids.
pub(crate) struct FdTable {
    next: i32,
    map: HashMap<i32, Box<dyn OpenFile>>,
}

impl FdTable {
    fn new() -> Self {
        Self {
            next: 0,
            map: HashMap::new(),
        }
    }

    pub(crate) fn install(&mut self, file: Box<dyn OpenFile>) -> Result<i32, KernelError> {
        let fd = self.next;
        self.next += 1;
        // Ids only ever grow, so the slot cannot be taken; the refusal is
        // kept anyway rather than silently overwriting a descriptor.
        if self.map.contains_key(&fd) {
            return Err(KernelError::FileDescriptorInUse(fd));
        }
        self.map.insert(fd, file);
        Ok(fd)
    }

    pub(crate) fn get_mut(&mut self, fd: i32) -> Result<&mut Box<dyn OpenFile>, KernelError> {
        self.map
            .get_mut(&fd)
            .ok_or(KernelError::FileDescriptorNotFound(fd))
    }

    pub(crate) fn remove(&mut self, fd: i32) -> Option<Box<dyn OpenFile>> {
        self.map.remove(&fd)
    }

    fn close_all(&mut self) {
        self.map.clear();
    }
}

pub struct Process {
    kernel: Weak<Kernel>,
    pid: u32,
    page_table: PageTable,
    /// Frames this process took from the pool.
    frames: Mutex<Vec<u32>>,
    pub(crate) files: Mutex<FdTable>,
    pub(crate) children: Mutex<HashMap<u32, Arc<Process>>>,
    exit_status: Mutex<Option<i32>>,
    thread: Mutex<Option<Arc<Thread>>>,
    binary: Mutex<Option<queso_machine::Binary>>,
    pub(crate) layout: Mutex<Option<Layout>>,
    /// The register file while this process is switched out.
    user_regs: Mutex<Registers>,
}

impl Process {
    /// Allocates a process with a fresh pid and an all-invalid page table.
    pub fn new(kernel: &Arc<Kernel>) -> Arc<Process> {
        let pid = kernel.allocate_pid();
        Arc::new(Process {
            kernel: Arc::downgrade(kernel),
            pid,
            page_table: memory::new_page_table(kernel.machine().num_phys_pages()),
            frames: Mutex::new(Vec::new()),
            files: Mutex::new(FdTable::new()),
            children: Mutex::new(HashMap::new()),
            exit_status: Mutex::new(None),
            thread: Mutex::new(None),
            binary: Mutex::new(None),
            layout: Mutex::new(None),
            user_regs: Mutex::new(Registers::default()),
        })
    }

    pub(crate) fn kernel(&self) -> Arc<Kernel> {
        self.kernel.upgrade().expect("kernel is gone")
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock().unwrap()
    }

    /// The kernel thread running this process, once `execute` succeeds.
    pub fn thread(&self) -> Option<Arc<Thread>> {
        self.thread.lock().unwrap().clone()
    }

    /// Loads `name`, mounts the console as fd 0 and 1, and forks a thread
    /// running the program. `false` if the load fails.
    pub fn execute(self: &Arc<Self>, name: &str, args: &[String]) -> bool {
        let kernel = self.kernel();
        if let Err(e) = self.load(name, args) {
            log::debug!("pid {}: load of {name} failed: {e}", self.pid);
            return false;
        }

        {
            let console = kernel.machine().console().clone();
            let mut files = self.files.lock().unwrap();
            files.install(console.open_for_reading()).expect("fd 0 is free");
            files.install(console.open_for_writing()).expect("fd 1 is free");
        }

        let thread = Thread::new(&kernel, name);
        thread.set_process(self);
        {
            // On a switch away the register file belongs to us and gets
            // snapshotted; on a switch back it is reinstalled along with
            // the page table.
            let machine = kernel.machine().clone();
            let process = Arc::downgrade(self);
            thread.set_save_hook(Box::new(move || {
                if let Some(process) = process.upgrade() {
                    *process.user_regs.lock().unwrap() =
                        machine.processor().with_registers(|regs| *regs);
                }
            }));
            let machine = kernel.machine().clone();
            let process = Arc::downgrade(self);
            let table = self.page_table.clone();
            thread.set_restore_hook(Box::new(move || {
                machine.processor().set_page_table(table.clone());
                if let Some(process) = process.upgrade() {
                    let saved = *process.user_regs.lock().unwrap();
                    machine.processor().with_registers(|regs| *regs = saved);
                }
            }));
        }
        *self.thread.lock().unwrap() = Some(thread.clone());
        kernel.register_process(self.pid, &thread);

        let process = self.clone();
        thread::fork(&kernel, &thread, move || process.run_guest());
        true
    }

    /// Thread body of a user process: registers, then the program.
    fn run_guest(self: Arc<Self>) {
        let kernel = self.kernel();
        let layout = self.layout.lock().unwrap().expect("process is loaded");
        kernel.machine().processor().with_registers(|regs| {
            *regs = Registers::default();
            regs.pc = layout.entry as i32;
            regs.next_pc = layout.entry as i32 + 4;
            regs.sp = layout.sp as i32;
            regs.a0 = layout.argc;
            regs.a1 = layout.argv as i32;
        });

        let program = {
            let binary = self.binary.lock().unwrap();
            binary.as_ref().expect("process is loaded").program()
        };
        kernel.machine().run_guest(&*program);

        // The program returned instead of invoking exit.
        self.exit(0);
    }

    /// Terminates the process: closes files, returns frames (waking any
    /// frame-starved thread), drops it from the kernel's map, and stops
    /// the machine when it was the last one.
    pub fn exit(self: &Arc<Self>, status: i32) -> ! {
        let kernel = self.kernel();
        log::debug!("pid {} exits with status {status}", self.pid);

        self.files.lock().unwrap().close_all();
        *self.exit_status.lock().unwrap() = Some(status);
        self.unload();

        let remaining = kernel.remove_process(self.pid);
        if remaining == 0 {
            kernel.machine().halt();
        }
        thread::finish(&kernel)
    }

    /// Returns every owned frame and invalidates the page table.
    /// Idempotent; also used to back out of a failed load.
    pub(crate) fn unload(&self) {
        let frames: Vec<u32> = self.frames.lock().unwrap().drain(..).collect();
        {
            let mut table = self.page_table.lock().unwrap();
            for entry in table.iter_mut() {
                *entry = TranslationEntry::invalid(entry.vpn);
            }
        }
        if !frames.is_empty() {
            self.kernel().frame_pool().release_and_wake(frames);
        }
    }

    pub(crate) fn map_page(&self, vpn: usize, ppn: u32, read_only: bool) {
        use queso_machine::EntryFlags;
        let mut flags = EntryFlags::VALID;
        if read_only {
            flags |= EntryFlags::READ_ONLY;
        }
        self.page_table.lock().unwrap()[vpn] = TranslationEntry {
            vpn: vpn as u32,
            ppn,
            flags,
        };
        self.frames.lock().unwrap().push(ppn);
    }

    /// Serves a fault on `vpn`: takes a frame from the pool, blocking
    /// through starvation, and maps the page writable.
    pub fn allocate_page(&self, vpn: usize) -> Result<(), KernelError> {
        let kernel = self.kernel();
        {
            let table = self.page_table.lock().unwrap();
            let entry = table
                .get(vpn)
                .ok_or(KernelError::BadVirtualAddress((vpn * PAGE_SIZE) as u32))?;
            if entry.is_valid() {
                // Raced with our own earlier service; nothing to do.
                return Ok(());
            }
        }
        let frame = kernel.frame_pool().allocate_blocking();
        self.map_page(vpn, frame, false);
        log::trace!("pid {}: faulted page {vpn} into frame {frame}", self.pid);
        Ok(())
    }

    /// Dispatches a guest exception raised while this process ran.
    pub(crate) fn handle_exception(self: &Arc<Self>, exception: Exception) {
        let kernel = self.kernel();
        match exception {
            Exception::Syscall => crate::syscall::dispatch(self),
            Exception::PageFault => {
                let bad = kernel.machine().processor().with_registers(|r| r.bad_vaddr) as u32;
                if let Err(e) = self.allocate_page(bad as usize / PAGE_SIZE) {
                    log::warn!(
                        "pid {}: unserviceable page fault at {bad:#x}: {e}",
                        self.pid
                    );
                    self.exit(exception as i32);
                }
                // The faulting access is re-issued by the processor, which
                // is the rewind of the faulting instruction.
            }
            _ => {
                log::warn!("pid {}: fatal exception {exception}", self.pid);
                self.exit(exception as i32);
            }
        }
    }

    /// Single bounded transfer out of user memory; see [`memory`].
    pub fn read_virtual_memory(&self, vaddr: u32, buf: &mut [u8]) -> usize {
        let kernel = self.kernel();
        memory::read_virtual(kernel.machine(), &self.page_table, vaddr, buf)
    }

    /// Single bounded transfer into user memory; see [`memory`].
    pub fn write_virtual_memory(&self, vaddr: u32, data: &[u8]) -> usize {
        let kernel = self.kernel();
        memory::write_virtual(kernel.machine(), &self.page_table, vaddr, data)
    }

    /// Whole-buffer read across page boundaries; stops early at the first
    /// untransferable byte.
    pub fn read_user(&self, vaddr: u32, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_virtual_memory(vaddr + done as u32, &mut buf[done..]);
            if n == 0 {
                break;
            }
            done += n;
        }
        done
    }

    /// Whole-buffer write across page boundaries; `false` if any byte
    /// could not be placed.
    pub fn write_user(&self, vaddr: u32, data: &[u8]) -> bool {
        let mut done = 0;
        while done < data.len() {
            let n = self.write_virtual_memory(vaddr + done as u32, &data[done..]);
            if n == 0 {
                return false;
            }
            done += n;
        }
        true
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes from user
    /// memory.
    pub fn read_virtual_memory_str(&self, vaddr: u32, max_len: usize) -> Result<String, KernelError> {
        let mut buf = vec![0_u8; max_len + 1];
        let n = self.read_user(vaddr, &mut buf);
        let Some(len) = buf[..n].iter().position(|&b| b == 0) else {
            return Err(KernelError::UnterminatedString(vaddr, max_len));
        };
        String::from_utf8(buf[..len].to_vec()).map_err(|_| KernelError::InvalidArgument)
    }

    /// Reads one NUL-terminated syscall string argument (256-byte limit).
    pub(crate) fn read_arg_str(&self, vaddr: i32) -> Result<String, KernelError> {
        if vaddr <= 0 {
            return Err(KernelError::BadVirtualAddress(vaddr as u32));
        }
        self.read_virtual_memory_str(vaddr as u32, MAX_ARG_LEN)
    }
}
