//! The bridge between kernel byte buffers and user virtual memory.
//!
//! These transfers are deliberately meek: a bad page, a read-only page on
//! a write, or an address past physical memory transfers zero bytes. They
//! never fault pages in and never crash — page allocation is the fault
//! handler's job, and syscalls that hit a zero transfer report failure to
//! the guest instead.
//!
//! Each call moves at most to the end of one page; callers that want a
//! whole buffer loop until a call makes no progress.

pub mod frame;

use std::sync::{Arc, Mutex};

use queso_machine::{EntryFlags, Machine, PAGE_SIZE, TranslationEntry};

/// A process page table, shared with the simulated processor.
pub type PageTable = Arc<Mutex<Vec<TranslationEntry>>>;

/// Builds the initial all-invalid table over `num_pages` virtual pages.
pub(crate) fn new_page_table(num_pages: usize) -> PageTable {
    Arc::new(Mutex::new(
        (0..num_pages as u32).map(TranslationEntry::invalid).collect(),
    ))
}

/// Looks up `vaddr` for a transfer of up to `len` bytes, returning the
/// physical address and the clamped length.
fn translate(
    machine: &Machine,
    table: &PageTable,
    vaddr: u32,
    len: usize,
    write: bool,
) -> Option<(usize, usize)> {
    let vpn = vaddr as usize / PAGE_SIZE;
    let offset = vaddr as usize % PAGE_SIZE;

    let mut table = table.lock().unwrap();
    let entry = table.get_mut(vpn)?;
    if !entry.is_valid() || (write && entry.is_read_only()) {
        return None;
    }
    entry.flags.insert(EntryFlags::USED);
    if write {
        entry.flags.insert(EntryFlags::DIRTY);
    }

    let paddr = entry.ppn as usize * PAGE_SIZE + offset;
    let limit = machine.num_phys_pages() * PAGE_SIZE;
    if paddr >= limit {
        return None;
    }
    let n = len.min(PAGE_SIZE - offset).min(limit - paddr);
    Some((paddr, n))
}

/// Copies from user memory at `vaddr` into `buf`, returning the number of
/// bytes transferred (0 on any translation failure).
pub fn read_virtual(machine: &Machine, table: &PageTable, vaddr: u32, buf: &mut [u8]) -> usize {
    let Some((paddr, n)) = translate(machine, table, vaddr, buf.len(), false) else {
        return 0;
    };
    machine.with_memory(|mem| mem.read(paddr, &mut buf[..n]));
    n
}

/// Copies `data` into user memory at `vaddr`, returning the number of
/// bytes transferred (0 on any translation failure).
pub fn write_virtual(machine: &Machine, table: &PageTable, vaddr: u32, data: &[u8]) -> usize {
    let Some((paddr, n)) = translate(machine, table, vaddr, data.len(), true) else {
        return 0;
    };
    machine.with_memory(|mem| mem.write(paddr, &data[..n]));
    n
}
