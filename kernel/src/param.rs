/// Default priority of a new thread under the priority policy.
pub const PRIORITY_DEFAULT: i64 = 1;
/// Minimum thread priority.
pub const PRIORITY_MIN: i64 = 0;
/// Maximum thread priority.
pub const PRIORITY_MAX: i64 = 7;

/// Default ticket count of a new thread under the lottery policy.
pub const TICKETS_DEFAULT: i64 = 1;
/// Minimum ticket count; every waiter holds at least one ticket.
pub const TICKETS_MIN: i64 = 1;
/// Maximum ticket count for a single thread. Queue totals are kept in 64
/// bits, so ticket sums near this bound need no per-ticket storage.
pub const TICKETS_MAX: i64 = i32::MAX as i64;

/// Pages of user stack placed above the loaded sections.
pub const STACK_PAGES: usize = 8;

/// Longest string argument a syscall will read, not counting the NUL.
pub const MAX_ARG_LEN: usize = 256;

/// The root process; the only one allowed to halt the machine.
pub const ROOT_PID: u32 = 0;
