use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};

use crate::error::Result;

/// Owns the single virtual CPU and its kernel-shared run-state mapping.
/// Dropping this closes the vCPU fd; it should be dropped before the VM
/// handle and after the run-state is last touched.
pub struct VCpu {
    fd: VcpuFd,
}

impl VCpu {
    pub fn new(vm: &VmFd, id: u64) -> Result<Self> {
        let fd = vm.create_vcpu(id)?;
        Ok(Self { fd })
    }

    pub fn load_registers(&self, regs: &kvm_regs, sregs: &kvm_sregs) -> Result<()> {
        self.fd.set_regs(regs)?;
        self.fd.set_sregs(sregs)?;
        Ok(())
    }

    pub fn regs(&self) -> Result<kvm_regs> {
        Ok(self.fd.get_regs()?)
    }

    pub fn sregs(&self) -> Result<kvm_sregs> {
        Ok(self.fd.get_sregs()?)
    }

    pub fn lapic(&self) -> Result<kvm_bindings::kvm_lapic_state> {
        Ok(self.fd.get_lapic()?)
    }

    /// Enters guest context until the next VM exit. Borrows `self` mutably
    /// because the returned `VcpuExit` points into the kernel-shared
    /// run-state mapping.
    pub fn run(&mut self) -> Result<VcpuExit<'_>> {
        Ok(self.fd.run()?)
    }
}
