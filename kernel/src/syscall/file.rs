//! File syscalls: create, open, read, write, close, unlink.

use std::sync::Arc;

use queso_machine::PAGE_SIZE;

use crate::{error::KernelError, proc::Process};

pub(super) fn sys_create(p: &Arc<Process>, name: i32) -> Result<i32, KernelError> {
    open_common(p, name, true)
}

pub(super) fn sys_open(p: &Arc<Process>, name: i32) -> Result<i32, KernelError> {
    open_common(p, name, false)
}

fn open_common(p: &Arc<Process>, name: i32, create: bool) -> Result<i32, KernelError> {
    let name = p.read_arg_str(name)?;
    let file = p
        .kernel()
        .machine()
        .file_system()
        .open(&name, create)
        .ok_or(KernelError::FsEntryNotFound)?;
    p.files.lock().unwrap().install(file)
}

pub(super) fn sys_read(p: &Arc<Process>, fd: i32, buf: i32, size: i32) -> Result<i32, KernelError> {
    if fd < 0 || buf <= 0 || size < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let mut files = p.files.lock().unwrap();
    let file = files.get_mut(fd)?;

    let mut total = 0_usize;
    let mut chunk = [0_u8; PAGE_SIZE];
    while total < size as usize {
        let want = chunk.len().min(size as usize - total);
        let n = file.read(&mut chunk[..want]);
        if n == 0 {
            break;
        }
        let placed = place_user(p, buf as u32 + total as u32, &chunk[..n]);
        total += placed;
        if placed < n {
            // The user buffer ran out of valid pages; report what landed.
            break;
        }
    }
    Ok(total as i32)
}

/// Copies into user memory, returning how many bytes actually landed.
fn place_user(p: &Process, vaddr: u32, data: &[u8]) -> usize {
    let mut done = 0;
    while done < data.len() {
        let n = p.write_virtual_memory(vaddr + done as u32, &data[done..]);
        if n == 0 {
            break;
        }
        done += n;
    }
    done
}

pub(super) fn sys_write(p: &Arc<Process>, fd: i32, buf: i32, size: i32) -> Result<i32, KernelError> {
    if fd < 0 || buf <= 0 || size < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let mut files = p.files.lock().unwrap();
    let file = files.get_mut(fd)?;

    // Partial writes are errors: the full `size` bytes must both come out
    // of user memory and go into the file.
    let mut total = 0_usize;
    let mut chunk = [0_u8; PAGE_SIZE];
    while total < size as usize {
        let want = chunk.len().min(size as usize - total);
        let n = p.read_virtual_memory(buf as u32 + total as u32, &mut chunk[..want]);
        if n == 0 {
            return Err(KernelError::ShortUserTransfer);
        }
        if file.write(&chunk[..n]) != n {
            return Err(KernelError::ShortUserTransfer);
        }
        total += n;
    }
    Ok(size)
}

pub(super) fn sys_close(p: &Arc<Process>, fd: i32) -> Result<i32, KernelError> {
    if fd < 0 {
        return Err(KernelError::InvalidArgument);
    }
    p.files
        .lock()
        .unwrap()
        .remove(fd)
        .map(|_| 0)
        .ok_or(KernelError::FileDescriptorNotFound(fd))
}

pub(super) fn sys_unlink(p: &Arc<Process>, name: i32) -> Result<i32, KernelError> {
    let name = p.read_arg_str(name)?;
    if p.kernel().machine().file_system().remove(&name) {
        Ok(0)
    } else {
        Err(KernelError::FsEntryNotFound)
    }
}
