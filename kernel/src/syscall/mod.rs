//! The syscall surface.
//!
//! The guest passes the call number in V0 and arguments in A0..A3; the
//! result goes back in V0 and the PC advances past the faulting
//! instruction. Handlers return `Result<i32, KernelError>`; any error
//! becomes the −1 wire convention, and the process keeps running.

use std::sync::Arc;

use strum::FromRepr;

use crate::{error::KernelError, proc::Process};

mod file;
mod proc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(i32)]
pub enum SyscallCode {
    Halt = 0,
    Exit = 1,
    Exec = 2,
    Join = 3,
    Create = 4,
    Open = 5,
    Read = 6,
    Write = 7,
    Close = 8,
    Unlink = 9,
}

pub(crate) fn dispatch(process: &Arc<Process>) {
    let kernel = process.kernel();
    let processor = kernel.machine().processor();
    let (code, args) = processor.with_registers(|regs| (regs.v0, [regs.a0, regs.a1, regs.a2, regs.a3]));

    let Some(code) = SyscallCode::from_repr(code) else {
        log::warn!("pid {}: unknown syscall {code}", process.pid());
        processor.with_registers(|regs| regs.v0 = -1);
        processor.advance_pc();
        return;
    };
    log::trace!("pid {}: {code:?}{args:?}", process.pid());

    let result: Result<i32, KernelError> = match code {
        SyscallCode::Halt => self::proc::sys_halt(process),
        SyscallCode::Exit => self::proc::sys_exit(process, args[0]),
        SyscallCode::Exec => self::proc::sys_exec(process, args[0], args[1], args[2]),
        SyscallCode::Join => self::proc::sys_join(process, args[0], args[1]),
        SyscallCode::Create => self::file::sys_create(process, args[0]),
        SyscallCode::Open => self::file::sys_open(process, args[0]),
        SyscallCode::Read => self::file::sys_read(process, args[0], args[1], args[2]),
        SyscallCode::Write => self::file::sys_write(process, args[0], args[1], args[2]),
        SyscallCode::Close => self::file::sys_close(process, args[0]),
        SyscallCode::Unlink => self::file::sys_unlink(process, args[0]),
    };

    let v0 = match result {
        Ok(value) => value,
        Err(e) => {
            log::debug!("pid {}: {code:?} failed: {e}", process.pid());
            -1
        }
    };
    processor.with_registers(|regs| regs.v0 = v0);
    processor.advance_pc();
}
