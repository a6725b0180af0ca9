//! Synchronization primitives built on the scheduler's wait queues.

mod communicator;
mod condition;
mod lock;

pub use self::{communicator::Communicator, condition::Condition, lock::Lock};
