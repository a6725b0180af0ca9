//! Shared setup for kernel scenario tests.
#![allow(dead_code)] // not every test file uses every helper

use std::sync::Arc;

use queso_kernel::{Kernel, KernelConfig, SchedPolicy};
use queso_machine::MachineConfig;

pub fn boot(policy: SchedPolicy) -> Arc<Kernel> {
    boot_with(policy, MachineConfig::default())
}

pub fn boot_with(policy: SchedPolicy, machine: MachineConfig) -> Arc<Kernel> {
    Kernel::start(&KernelConfig { policy, machine })
}

/// Boots a kernel and runs `body` as its first thread. Assertions inside
/// `body` propagate to the test.
pub fn run(policy: SchedPolicy, body: impl FnOnce(&Arc<Kernel>) + Send + 'static) {
    let kernel = boot(policy);
    let inner = kernel.clone();
    kernel.run(move || body(&inner));
}
