//! Object-code images and the per-page loader.
//!
//! An image is an entry point plus ordered sections; each section knows its
//! first virtual page, its length in pages, and whether it should be mapped
//! read-only. [`Section::load_page`] copies one section page into a chosen
//! physical frame — the kernel decides frame placement, the loader only
//! moves bytes.

use std::sync::Arc;

use crate::{
    mem::{MainMemory, PAGE_SIZE},
    processor::Program,
};

/// One loadable section of an image.
pub struct Section {
    name: &'static str,
    first_vpn: u32,
    read_only: bool,
    pages: Vec<Vec<u8>>,
}

impl Section {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn first_vpn(&self) -> u32 {
        self.first_vpn
    }

    /// Length in pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Copies section page `spn` into physical frame `ppn`.
    pub fn load_page(&self, spn: usize, ppn: u32, mem: &mut MainMemory) {
        mem.frame_mut(ppn).copy_from_slice(&self.pages[spn]);
    }
}

/// A parsed executable image.
pub struct Image {
    entry: u32,
    sections: Vec<Section>,
}

impl Image {
    pub fn builder() -> ImageBuilder {
        ImageBuilder {
            entry: 0,
            next_vpn: 0,
            sections: Vec::new(),
        }
    }

    pub fn entry_point(&self) -> u32 {
        self.entry
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    pub fn section(&self, s: usize) -> &Section {
        &self.sections[s]
    }
}

/// Builds an [`Image`] from raw section payloads, padding each section to
/// whole pages.
pub struct ImageBuilder {
    entry: u32,
    next_vpn: u32,
    sections: Vec<Section>,
}

impl ImageBuilder {
    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    /// Appends a section directly after the previous one.
    pub fn section(self, name: &'static str, read_only: bool, bytes: &[u8]) -> Self {
        let vpn = self.next_vpn;
        self.section_at(name, vpn, read_only, bytes)
    }

    /// Appends a section at an explicit first page.
    pub fn section_at(
        mut self,
        name: &'static str,
        first_vpn: u32,
        read_only: bool,
        bytes: &[u8],
    ) -> Self {
        let mut pages: Vec<Vec<u8>> = bytes
            .chunks(PAGE_SIZE)
            .map(|chunk| {
                let mut page = vec![0; PAGE_SIZE];
                page[..chunk.len()].copy_from_slice(chunk);
                page
            })
            .collect();
        if pages.is_empty() {
            pages.push(vec![0; PAGE_SIZE]);
        }
        self.next_vpn = first_vpn + pages.len() as u32;
        self.sections.push(Section {
            name,
            first_vpn,
            read_only,
            pages,
        });
        self
    }

    pub fn build(self) -> Image {
        Image {
            entry: self.entry,
            sections: self.sections,
        }
    }
}

/// An executable: an image plus the behavior that runs once it is loaded.
#[derive(Clone)]
pub struct Binary {
    inner: Arc<BinaryInner>,
}

struct BinaryInner {
    image: Image,
    program: Arc<dyn Program>,
}

impl Binary {
    pub fn new(image: Image, program: Arc<dyn Program>) -> Self {
        Self {
            inner: Arc::new(BinaryInner { image, program }),
        }
    }

    pub fn image(&self) -> &Image {
        &self.inner.image
    }

    pub fn program(&self) -> Arc<dyn Program> {
        self.inner.program.clone()
    }
}
