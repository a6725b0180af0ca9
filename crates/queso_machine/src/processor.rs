//! The simulated processor: registers, translation, exceptions, and guest
//! execution.
//!
//! There is no instruction decoder. A guest program is a [`Program`] trait
//! object whose code performs loads, stores and syscalls through a
//! [`GuestCpu`], and every one of those operations goes through the real
//! translation and exception machinery: a store to an unmapped page raises
//! a page fault into the kernel's handler and is retried afterwards, which
//! is observably the rewind-and-re-execute of a faulting instruction.

use std::sync::{Arc, Mutex};

use strum::{Display, FromRepr};

use crate::{
    Machine,
    interrupt::USER_TICK,
    mem::{EntryFlags, PAGE_SIZE, TranslationEntry},
};

/// The user-visible register file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub v0: i32,
    pub v1: i32,
    pub a0: i32,
    pub a1: i32,
    pub a2: i32,
    pub a3: i32,
    pub sp: i32,
    pub pc: i32,
    pub next_pc: i32,
    pub bad_vaddr: i32,
    pub cause: i32,
}

/// Causes of a transfer from guest code into the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(i32)]
pub enum Exception {
    Syscall = 0,
    PageFault = 1,
    TlbMiss = 2,
    ReadOnly = 3,
    BusError = 4,
    AddressError = 5,
    Overflow = 6,
    IllegalInstruction = 7,
}

type ExceptionHandler = Arc<dyn Fn(Exception) + Send + Sync>;

type SharedPageTable = Arc<Mutex<Vec<TranslationEntry>>>;

/// Processor state shared between guest execution and the kernel.
pub struct Processor {
    num_phys_pages: usize,
    regs: Mutex<Registers>,
    page_table: Mutex<Option<SharedPageTable>>,
    handler: Mutex<Option<ExceptionHandler>>,
}

impl Processor {
    pub(crate) fn new(num_phys_pages: usize) -> Self {
        Self {
            num_phys_pages,
            regs: Mutex::new(Registers::default()),
            page_table: Mutex::new(None),
            handler: Mutex::new(None),
        }
    }

    pub fn num_phys_pages(&self) -> usize {
        self.num_phys_pages
    }

    /// Installs the kernel's exception handler.
    pub fn set_exception_handler(&self, handler: impl Fn(Exception) + Send + Sync + 'static) {
        *self.handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Points translation at a process's page table. The table is shared,
    /// not copied: used/dirty bits set during guest execution land in the
    /// process's own entries.
    pub fn set_page_table(&self, table: SharedPageTable) {
        *self.page_table.lock().unwrap() = Some(table);
    }

    /// Runs `f` over the register file.
    pub fn with_registers<R>(&self, f: impl FnOnce(&mut Registers) -> R) -> R {
        f(&mut self.regs.lock().unwrap())
    }

    /// Shifts `next_pc` into `pc`, as after a completed instruction.
    pub fn advance_pc(&self) {
        let mut regs = self.regs.lock().unwrap();
        regs.pc = regs.next_pc;
        regs.next_pc += 4;
    }

    /// Translates a guest address, maintaining used/dirty bits.
    ///
    /// No locks are held when this returns, so a raised exception may
    /// freely re-enter the processor.
    fn translate(&self, vaddr: u32, write: bool) -> Result<usize, Exception> {
        let vpn = vaddr as usize / PAGE_SIZE;
        let offset = vaddr as usize % PAGE_SIZE;

        let table = self
            .page_table
            .lock()
            .unwrap()
            .clone()
            .ok_or(Exception::TlbMiss)?;
        let mut table = table.lock().unwrap();
        let Some(entry) = table.get_mut(vpn) else {
            return Err(Exception::AddressError);
        };
        if !entry.is_valid() {
            return Err(Exception::PageFault);
        }
        if write && entry.is_read_only() {
            return Err(Exception::ReadOnly);
        }
        entry.flags.insert(EntryFlags::USED);
        if write {
            entry.flags.insert(EntryFlags::DIRTY);
        }

        let paddr = entry.ppn as usize * PAGE_SIZE + offset;
        if paddr >= self.num_phys_pages * PAGE_SIZE {
            return Err(Exception::BusError);
        }
        Ok(paddr)
    }

    /// Transfers control to the kernel's exception handler.
    fn raise(&self, exception: Exception, bad_vaddr: u32) {
        {
            let mut regs = self.regs.lock().unwrap();
            regs.cause = exception as i32;
            if exception != Exception::Syscall {
                regs.bad_vaddr = bad_vaddr as i32;
            }
        }
        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .expect("no exception handler installed");
        handler(exception);
    }
}

/// Behavior attached to an executable image; runs on the process's thread.
pub trait Program: Send + Sync {
    /// The program body. Exits by invoking the exit syscall, which never
    /// returns; returning from `run` is treated by the kernel as a normal
    /// exit with status 0.
    fn run(&self, cpu: &GuestCpu);
}

/// Handle through which a [`Program`] touches the machine.
pub struct GuestCpu<'m> {
    machine: &'m Machine,
}

impl<'m> GuestCpu<'m> {
    pub(crate) fn new(machine: &'m Machine) -> Self {
        Self { machine }
    }

    /// Reads a register file snapshot.
    pub fn registers(&self) -> Registers {
        self.machine.processor().with_registers(|regs| *regs)
    }

    /// Reads guest memory at `vaddr`, faulting pages in as needed.
    pub fn load(&self, vaddr: u32, buf: &mut [u8]) {
        self.span(vaddr, buf.len(), false, |machine, paddr, range| {
            machine.with_memory(|mem| mem.read(paddr, &mut buf[range]));
        });
    }

    /// Writes guest memory at `vaddr`, faulting pages in as needed.
    pub fn store(&self, vaddr: u32, data: &[u8]) {
        self.span(vaddr, data.len(), true, |machine, paddr, range| {
            machine.with_memory(|mem| mem.write(paddr, &data[range]));
        });
    }

    /// Reads a little-endian word from guest memory.
    pub fn load_u32(&self, vaddr: u32) -> u32 {
        let mut bytes = [0; 4];
        self.load(vaddr, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Performs a system call: code in V0, arguments in A0..A3, result
    /// read back from V0. May not return (exit).
    ///
    /// The clock ticks before the registers are loaded: a preemption at
    /// the tick could hand the register file to another process, but from
    /// the load until the kernel has read its arguments there is no
    /// preemption point.
    pub fn syscall(&self, code: i32, args: [i32; 4]) -> i32 {
        self.machine.interrupt().tick(USER_TICK);
        let processor = self.machine.processor();
        processor.with_registers(|regs| {
            regs.v0 = code;
            [regs.a0, regs.a1, regs.a2, regs.a3] = args;
        });
        processor.raise(Exception::Syscall, 0);
        processor.with_registers(|regs| regs.v0)
    }

    /// Walks `len` bytes from `vaddr` one page span at a time, retrying
    /// each span until translation succeeds. Fatal exceptions exit the
    /// process inside the handler and never come back here.
    fn span(
        &self,
        vaddr: u32,
        len: usize,
        write: bool,
        mut op: impl FnMut(&Machine, usize, std::ops::Range<usize>),
    ) {
        let processor = self.machine.processor();
        let mut done = 0;
        while done < len {
            let at = vaddr + done as u32;
            let n = (PAGE_SIZE - at as usize % PAGE_SIZE).min(len - done);
            let paddr = loop {
                match processor.translate(at, write) {
                    Ok(paddr) => break paddr,
                    Err(e) => processor.raise(e, at),
                }
            };
            op(self.machine, paddr, done..done + n);
            self.machine.interrupt().tick(USER_TICK);
            done += n;
        }
    }
}
