use kvm_ioctls::{Kvm, VmFd};

use crate::error::Result;

/// Owns the open `/dev/kvm` handle and the single VM object created within
/// it. Dropping this drops `VmFd` then `Kvm`, which is meant to be the last
/// step of teardown — every other component should be dropped before this
/// one.
pub struct HypervisorHandle {
    // Field order is the drop order: the VM handle must close before the
    // device handle it was created from.
    vm: VmFd,
    kvm: Kvm,
    run_state_size: usize,
}

impl HypervisorHandle {
    /// Opens the kernel virtualization device and creates one VM.
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new()?;
        let run_state_size = kvm.get_vcpu_mmap_size()?;
        let vm = kvm.create_vm()?;
        tracing::info!(api_version = kvm.get_api_version(), "opened kvm device");
        Ok(Self {
            vm,
            kvm,
            run_state_size,
        })
    }

    pub fn vm(&self) -> &VmFd {
        &self.vm
    }

    /// Fixed size, in bytes, of the kernel-shared per-vCPU run-state.
    pub fn run_state_size(&self) -> usize {
        self.run_state_size
    }
}

#[cfg(test)]
impl HypervisorHandle {
    #[allow(dead_code)]
    fn kvm(&self) -> &Kvm {
        &self.kvm
    }
}
