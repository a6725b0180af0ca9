#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("bad virtual address: {0:#x}")]
    BadVirtualAddress(u32),
    #[error("unterminated string: addr={0:#x}, max={1}")]
    UnterminatedString(u32, usize),
    #[error("bad file descriptor: {0}")]
    FileDescriptorNotFound(i32),
    #[error("file descriptor already in use: {0}")]
    FileDescriptorInUse(i32),
    #[error("file system entry not found")]
    FsEntryNotFound,
    #[error("short transfer to user memory")]
    ShortUserTransfer,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid executable")]
    InvalidExecutable,
    #[error("argument list does not fit in one page")]
    ArgumentListTooLong,
    #[error("program needs more pages than the machine has")]
    NotEnoughMemory,
    #[error("no free frame")]
    NoFreeFrame,
    #[error("process not found: {0}")]
    ProcessNotFound(u32),
    #[error("process {0} is not a child of the caller")]
    NotChild(u32),
    #[error("halt refused: caller is not the root process")]
    HaltRefused,
}
