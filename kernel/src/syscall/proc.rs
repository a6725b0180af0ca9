//! Process syscalls: halt, exit, exec, join.

use std::sync::Arc;

use crate::{error::KernelError, param::ROOT_PID, proc::Process, thread};

pub(super) fn sys_halt(p: &Arc<Process>) -> Result<i32, KernelError> {
    if p.pid() != ROOT_PID {
        return Err(KernelError::HaltRefused);
    }
    p.kernel().machine().halt();
}

pub(super) fn sys_exit(p: &Arc<Process>, status: i32) -> Result<i32, KernelError> {
    p.exit(status);
}

pub(super) fn sys_exec(
    p: &Arc<Process>,
    name: i32,
    argc: i32,
    argv: i32,
) -> Result<i32, KernelError> {
    let name = p.read_arg_str(name)?;
    if argc < 0 || (argc > 0 && argv <= 0) {
        return Err(KernelError::InvalidArgument);
    }

    let mut args = Vec::with_capacity(argc as usize);
    for i in 0..argc {
        let mut pointer = [0_u8; 4];
        if p.read_user(argv as u32 + 4 * i as u32, &mut pointer) != 4 {
            return Err(KernelError::BadVirtualAddress(argv as u32 + 4 * i as u32));
        }
        let pointer = u32::from_le_bytes(pointer);
        args.push(p.read_arg_str(pointer as i32)?);
    }

    let kernel = p.kernel();
    let child = Process::new(&kernel);
    if !child.execute(&name, &args) {
        return Err(KernelError::InvalidExecutable);
    }
    let pid = child.pid();
    p.children.lock().unwrap().insert(pid, child);
    Ok(pid as i32)
}

pub(super) fn sys_join(p: &Arc<Process>, pid: i32, status_ptr: i32) -> Result<i32, KernelError> {
    if pid < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let child = p
        .children
        .lock()
        .unwrap()
        .get(&(pid as u32))
        .cloned()
        .ok_or(KernelError::NotChild(pid as u32))?;

    let kernel = p.kernel();
    if let Some(thread) = kernel.thread_by_pid(pid as u32) {
        thread::join(&kernel, &thread);
    }

    let status = child
        .exit_status()
        .ok_or(KernelError::ProcessNotFound(pid as u32))?;
    if !p.write_user(status_ptr as u32, &status.to_le_bytes()) {
        return Err(KernelError::BadVirtualAddress(status_ptr as u32));
    }
    Ok(i32::from(status == 0))
}
