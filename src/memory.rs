use std::fs;
use std::path::Path;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use vm_memory::{Bytes, GuestAddress, GuestMemoryBackend, GuestMemoryMmap};

use crate::error::{Error, Result};

pub const GUEST_BASE: GuestAddress = GuestAddress(0);

/// Host-anonymous-backed RAM registered with KVM as slot 0. Owns the host
/// mapping exclusively; dropping it unmaps the RAM, which should happen
/// only after the vCPU and VM handles are already gone.
pub struct GuestMemory {
    mem: GuestMemoryMmap<()>,
    size: usize,
}

impl GuestMemory {
    /// Allocates `size` bytes of anonymous guest RAM and registers it as
    /// slot 0 at guest-physical base 0. `size` must already be a positive
    /// multiple of 4096 (checked by `Options::parse`).
    pub fn new(vm: &VmFd, size: usize) -> Result<Self> {
        let mem: GuestMemoryMmap<()> = GuestMemoryMmap::from_ranges(&[(GUEST_BASE, size)])?;

        // SAFETY: `mem` is a fresh anonymous mapping that outlives `vm`
        // (both are owned by the same scope and torn down in reverse order).
        unsafe {
            vm.set_user_memory_region(kvm_userspace_memory_region {
                slot: 0,
                guest_phys_addr: GUEST_BASE.0,
                memory_size: size as u64,
                userspace_addr: mem.get_host_address(GUEST_BASE)? as u64,
                flags: 0,
            })?;
        }

        tracing::info!(size, "registered guest RAM (slot 0)");
        Ok(Self { mem, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Reads `path` into the mapping starting at guest-physical 0. Short
    /// reads are fine; the image may be smaller than guest memory. Returns
    /// the number of bytes written. Rejects images larger than guest memory
    /// before touching the kernel: unwritten bytes stay zero, the mapping
    /// is never resized.
    pub fn load_image(&self, path: &Path) -> Result<usize> {
        let data = fs::read(path)?;
        if data.len() > self.size {
            return Err(Error::Config(format!(
                "image {} ({} bytes) does not fit in {} bytes of guest memory",
                path.display(),
                data.len(),
                self.size
            )));
        }
        self.mem.write_slice(&data, GUEST_BASE)?;
        tracing::info!(bytes = data.len(), path = %path.display(), "loaded guest image");
        Ok(data.len())
    }

    /// Reads `buf.len()` bytes back out starting at `addr`. Test-only: used
    /// to check what `load_image` actually wrote.
    #[cfg(test)]
    pub fn read_slice(&self, buf: &mut [u8], addr: GuestAddress) -> Result<()> {
        self.mem.read_slice(buf, addr)?;
        Ok(())
    }
}
