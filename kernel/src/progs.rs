//! Built-in guest programs.
//!
//! The machine has no instruction decoder, so guest code is Rust behavior
//! attached to an executable image (see [`queso_machine::Program`]). The
//! programs here are what the `-x` shell flag can run; tests build their
//! own the same way.

use std::sync::Arc;

use queso_machine::{Binary, GuestCpu, Image, Machine, Program};

use crate::syscall::SyscallCode;

/// A guest program written as a closure.
pub struct Script<F>(pub F);

impl<F> Program for Script<F>
where
    F: Fn(&GuestCpu) + Send + Sync,
{
    fn run(&self, cpu: &GuestCpu) {
        (self.0)(cpu);
    }
}

/// Builds an executable from a body and a default one-page code image.
pub fn binary(body: impl Fn(&GuestCpu) + Send + Sync + 'static) -> Binary {
    binary_with_image(Image::builder().section(".text", true, &[]).build(), body)
}

pub fn binary_with_image(image: Image, body: impl Fn(&GuestCpu) + Send + Sync + 'static) -> Binary {
    Binary::new(image, Arc::new(Script(body)))
}

/// Issues an exit syscall; does not return.
pub fn exit(cpu: &GuestCpu, status: i32) {
    cpu.syscall(SyscallCode::Exit as i32, [status, 0, 0, 0]);
    unreachable!("exit returned");
}

/// Reads the argument vector laid out by the loader: `argc` little-endian
/// pointers at `argv`, each to a NUL-terminated string.
pub fn read_args(cpu: &GuestCpu) -> Vec<String> {
    let regs = cpu.registers();
    let argc = regs.a0;
    let argv = regs.a1 as u32;
    (0..argc)
        .map(|i| {
            let ptr = cpu.load_u32(argv + 4 * i as u32);
            read_cstring(cpu, ptr)
        })
        .collect()
}

/// Reads a NUL-terminated string out of guest memory, byte by byte.
pub fn read_cstring(cpu: &GuestCpu, mut vaddr: u32) -> String {
    let mut bytes = Vec::new();
    loop {
        let mut byte = [0_u8];
        cpu.load(vaddr, &mut byte);
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
        vaddr += 1;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// The length of the NUL-terminated string at `vaddr`, for passing
/// in-place guest strings to syscalls.
pub fn cstring_len(cpu: &GuestCpu, vaddr: u32) -> usize {
    let mut len = 0;
    loop {
        let mut byte = [0_u8];
        cpu.load(vaddr + len as u32, &mut byte);
        if byte[0] == 0 {
            return len;
        }
        len += 1;
    }
}

/// Installs the stock programs into a machine's file system.
pub fn install(machine: &Machine) {
    // halt: ask the machine to stop; exit with the refusal if not root.
    machine.install_binary(
        "halt",
        binary(|cpu| {
            let r = cpu.syscall(SyscallCode::Halt as i32, [0, 0, 0, 0]);
            exit(cpu, r);
        }),
    );

    // echo: write each argument, space-separated, to stdout, then a
    // newline. Arguments are passed to write straight out of the argv
    // page.
    machine.install_binary(
        "echo",
        binary(|cpu| {
            let regs = cpu.registers();
            let argc = regs.a0;
            let argv = regs.a1 as u32;
            for i in 0..argc {
                let ptr = cpu.load_u32(argv + 4 * i as u32);
                let len = cstring_len(cpu, ptr);
                cpu.syscall(
                    SyscallCode::Write as i32,
                    [1, ptr as i32, len as i32, 0],
                );
                let sep = if i + 1 == argc { b"\n" } else { b" " };
                let scratch = regs.sp as u32 - 16;
                cpu.store(scratch, sep);
                cpu.syscall(SyscallCode::Write as i32, [1, scratch as i32, 1, 0]);
            }
            exit(cpu, 0);
        }),
    );

    // cat: copy stdin to stdout through a stack buffer.
    machine.install_binary(
        "cat",
        binary(|cpu| {
            let sp = cpu.registers().sp as u32;
            let buf = sp - 256;
            loop {
                let n = cpu.syscall(SyscallCode::Read as i32, [0, buf as i32, 128, 0]);
                if n <= 0 {
                    break;
                }
                cpu.syscall(SyscallCode::Write as i32, [1, buf as i32, n, 0]);
            }
            exit(cpu, 0);
        }),
    );
}
