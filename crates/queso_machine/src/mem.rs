//! Physical memory and the translation entry format.

use bitflags::bitflags;

/// Size of one page / frame, in bytes.
pub const PAGE_SIZE: usize = 1024;

bitflags! {
    /// Per-page translation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        const VALID = 1 << 0;
        const READ_ONLY = 1 << 1;
        const USED = 1 << 2;
        const DIRTY = 1 << 3;
    }
}

/// One page-table entry: a virtual page mapped (or not) to a frame.
#[derive(Debug, Clone, Copy)]
pub struct TranslationEntry {
    pub vpn: u32,
    pub ppn: u32,
    pub flags: EntryFlags,
}

impl TranslationEntry {
    /// An entry that translates nothing.
    pub const fn invalid(vpn: u32) -> Self {
        Self {
            vpn,
            ppn: 0,
            flags: EntryFlags::empty(),
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.flags.contains(EntryFlags::VALID)
    }

    pub const fn is_read_only(&self) -> bool {
        self.flags.contains(EntryFlags::READ_ONLY)
    }
}

/// The machine's byte memory, `num_pages` frames of [`PAGE_SIZE`] bytes.
pub struct MainMemory {
    bytes: Vec<u8>,
}

impl MainMemory {
    pub fn new(num_pages: usize) -> Self {
        Self {
            bytes: vec![0; num_pages * PAGE_SIZE],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn num_pages(&self) -> usize {
        self.bytes.len() / PAGE_SIZE
    }

    /// One whole frame, for the loader.
    pub fn frame_mut(&mut self, ppn: u32) -> &mut [u8] {
        let base = ppn as usize * PAGE_SIZE;
        &mut self.bytes[base..base + PAGE_SIZE]
    }

    pub fn read(&self, paddr: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.bytes[paddr..paddr + buf.len()]);
    }

    pub fn write(&mut self, paddr: usize, data: &[u8]) {
        self.bytes[paddr..paddr + data.len()].copy_from_slice(data);
    }
}
