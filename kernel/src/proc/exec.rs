//! Executable loading and the argument page.

use queso_machine::PAGE_SIZE;

use crate::{error::KernelError, param::STACK_PAGES, proc::Process};

/// Address-space facts fixed at load time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    pub num_pages: usize,
    pub entry: u32,
    pub sp: u32,
    pub argc: i32,
    pub argv: u32,
}

impl Process {
    /// Loads `name` into this process.
    ///
    /// Section pages get frames immediately, as does the argv page (it is
    /// written through `write_virtual_memory`, which does not fault pages
    /// in). The stack pages between them appear on first touch.
    pub(crate) fn load(&self, name: &str, args: &[String]) -> Result<(), KernelError> {
        let kernel = self.kernel();
        let machine = kernel.machine().clone();
        let binary = machine
            .load_binary(name)
            .ok_or(KernelError::InvalidExecutable)?;
        let image = binary.image();

        // Sections must be contiguous and start at page 0.
        let mut num_pages = 0_usize;
        for s in 0..image.num_sections() {
            let section = image.section(s);
            if section.first_vpn() as usize != num_pages {
                return Err(KernelError::InvalidExecutable);
            }
            num_pages += section.len();
        }

        // The argv array and strings must fit in one page.
        let args_size: usize = args.iter().map(|arg| 4 + arg.len() + 1).sum();
        if args_size > PAGE_SIZE {
            return Err(KernelError::ArgumentListTooLong);
        }

        let entry = image.entry_point();
        num_pages += STACK_PAGES;
        let sp = (num_pages * PAGE_SIZE) as u32;
        // The argv page is the last numbered page.
        num_pages += 1;
        if num_pages > machine.num_phys_pages() {
            return Err(KernelError::NotEnoughMemory);
        }

        let argv_base = ((num_pages - 1) * PAGE_SIZE) as u32;
        (|| -> Result<(), KernelError> {
            for s in 0..image.num_sections() {
                let section = image.section(s);
                log::trace!(
                    "pid {}: loading {} ({} pages)",
                    self.pid(),
                    section.name(),
                    section.len()
                );
                for i in 0..section.len() {
                    let vpn = section.first_vpn() as usize + i;
                    let frame = kernel
                        .frame_pool()
                        .allocate()
                        .ok_or(KernelError::NoFreeFrame)?;
                    self.map_page(vpn, frame, section.is_read_only());
                    machine.with_memory(|mem| section.load_page(i, frame, mem));
                }
            }

            let frame = kernel
                .frame_pool()
                .allocate()
                .ok_or(KernelError::NoFreeFrame)?;
            self.map_page(num_pages - 1, frame, false);

            // The pointer array, then the NUL-terminated strings.
            let mut entry_off = argv_base;
            let mut string_off = argv_base + 4 * args.len() as u32;
            for arg in args {
                assert!(self.write_user(entry_off, &string_off.to_le_bytes()));
                entry_off += 4;
                assert!(self.write_user(string_off, arg.as_bytes()));
                string_off += arg.len() as u32;
                assert!(self.write_user(string_off, &[0]));
                string_off += 1;
            }
            Ok(())
        })()
        .inspect_err(|_| self.unload())?;

        *self.layout.lock().unwrap() = Some(Layout {
            num_pages,
            entry,
            sp,
            argc: args.len() as i32,
            argv: argv_base,
        });
        *self.binary.lock().unwrap() = Some(binary);
        Ok(())
    }
}
