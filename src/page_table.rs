use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use vm_memory::{Bytes, GuestAddress, GuestMemoryBackend, GuestMemoryMmap};

use crate::error::Result;

const PAGE_SIZE: u64 = 4096;
const PTE_PRESENT: u64 = 1 << 0;
const PTE_RW: u64 = 1 << 1;
const PHYS_MASK: u64 = !0xFFF;

/// Frame counts at each of the four table levels, derived from the
/// `Nk = ceil(Nk-1 * 8 / 4096)` recurrence applied uniformly starting from
/// the leaf entry count: the leaf table's entry count seeds the recurrence,
/// and each upper level's frame count is the entry count for the level
/// above it. See DESIGN.md for why the sizing is resolved this way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizing {
    pub leaf_entries: u64,
    pub pt_frames: u64,
    pub pd_frames: u64,
    pub pdpt_frames: u64,
    pub pml4_frames: u64,
}

impl Sizing {
    pub fn for_memory(mem_size: u64) -> Self {
        let leaf_entries = mem_size.div_ceil(PAGE_SIZE);
        let pt_frames = (leaf_entries * 8).div_ceil(PAGE_SIZE);
        let pd_frames = (pt_frames * 8).div_ceil(PAGE_SIZE);
        let pdpt_frames = (pd_frames * 8).div_ceil(PAGE_SIZE);
        let pml4_frames = (pdpt_frames * 8).div_ceil(PAGE_SIZE);
        Self {
            leaf_entries,
            pt_frames,
            pd_frames,
            pdpt_frames,
            pml4_frames,
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.pt_frames + self.pd_frames + self.pdpt_frames + self.pml4_frames
    }

    fn pt_offset(&self) -> u64 {
        0
    }

    fn pd_offset(&self) -> u64 {
        self.pt_offset() + self.pt_frames
    }

    fn pdpt_offset(&self) -> u64 {
        self.pd_offset() + self.pd_frames
    }

    fn pml4_offset(&self) -> u64 {
        self.pdpt_offset() + self.pdpt_frames
    }
}

/// A 4-level identity-mapped page table for long mode, registered with KVM
/// as slot 1 starting at `guest_pt_base = memory_size`.
pub struct PageTable {
    mem: GuestMemoryMmap<()>,
    base: u64,
    cr3: u64,
    sizing: Sizing,
}

impl PageTable {
    /// Builds and registers an identity map covering `[0, mem_size)`.
    /// Every non-empty entry has present+writable set and nothing else.
    pub fn build_identity(vm: &VmFd, guest_pt_base: u64, mem_size: u64) -> Result<Self> {
        let sizing = Sizing::for_memory(mem_size);
        let region_size = sizing.total_frames() * PAGE_SIZE;
        let base_addr = GuestAddress(guest_pt_base);
        let mem: GuestMemoryMmap<()> =
            GuestMemoryMmap::from_ranges(&[(base_addr, region_size as usize)])?;

        // Leaf level: one PTE per guest 4 KiB frame, identity-mapped.
        write_level(&mem, guest_pt_base, sizing.pt_offset(), sizing.leaf_entries, |i| {
            i * PAGE_SIZE
        })?;
        // Each upper level indexes the frames of the level below it.
        write_level(&mem, guest_pt_base, sizing.pd_offset(), sizing.pt_frames, |i| {
            guest_pt_base + (sizing.pt_offset() + i) * PAGE_SIZE
        })?;
        write_level(&mem, guest_pt_base, sizing.pdpt_offset(), sizing.pd_frames, |i| {
            guest_pt_base + (sizing.pd_offset() + i) * PAGE_SIZE
        })?;
        write_level(&mem, guest_pt_base, sizing.pml4_offset(), sizing.pdpt_frames, |i| {
            guest_pt_base + (sizing.pdpt_offset() + i) * PAGE_SIZE
        })?;

        // SAFETY: `mem` is a fresh anonymous mapping outliving `vm`.
        unsafe {
            vm.set_user_memory_region(kvm_userspace_memory_region {
                slot: 1,
                guest_phys_addr: guest_pt_base,
                memory_size: region_size,
                userspace_addr: mem.get_host_address(base_addr)? as u64,
                flags: 0,
            })?;
        }

        let cr3 = guest_pt_base + sizing.pml4_offset() * PAGE_SIZE;
        tracing::info!(
            base = guest_pt_base,
            frames = sizing.total_frames(),
            cr3,
            "built identity-mapped page tables (slot 1)"
        );

        Ok(Self {
            mem,
            base: guest_pt_base,
            cr3,
            sizing,
        })
    }

    pub fn cr3(&self) -> u64 {
        self.cr3
    }

    pub fn sizing(&self) -> Sizing {
        self.sizing
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Walks the tables from `cr3` for guest-physical address `addr`,
    /// returning the mapped frame base, or `None` if any level is absent.
    /// Used by tests to check full coverage of the identity map.
    #[cfg(test)]
    pub fn walk(&self, addr: u64) -> Option<u64> {
        let pml4_idx = (addr >> 39) & 0x1FF;
        let pdpt_idx = (addr >> 30) & 0x1FF;
        let pd_idx = (addr >> 21) & 0x1FF;
        let pt_idx = (addr >> 12) & 0x1FF;

        let pdpt_table = self.read_entry(self.cr3, pml4_idx)?;
        let pd_table = self.read_entry(pdpt_table, pdpt_idx)?;
        let pt_table = self.read_entry(pd_table, pd_idx)?;
        let leaf = self.read_entry(pt_table, pt_idx)?;
        Some(leaf)
    }

    #[cfg(test)]
    fn read_entry(&self, table_addr: u64, index: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.mem
            .read_slice(&mut buf, GuestAddress(table_addr + index * 8))
            .ok()?;
        let entry = u64::from_le_bytes(buf);
        if entry & PTE_PRESENT == 0 {
            None
        } else {
            Some(entry & PHYS_MASK)
        }
    }
}

/// Writes `count` consecutive table entries starting at frame offset
/// `level_offset_frames` within the page-table region. Entries are packed
/// 512-per-frame, so writing them as one contiguous array lands each batch
/// of 512 in its own frame automatically.
fn write_level(
    mem: &GuestMemoryMmap<()>,
    region_base: u64,
    level_offset_frames: u64,
    count: u64,
    value_for_index: impl Fn(u64) -> u64,
) -> Result<()> {
    let level_base = region_base + level_offset_frames * PAGE_SIZE;
    for i in 0..count {
        let entry = value_for_index(i) | PTE_PRESENT | PTE_RW;
        mem.write_slice(&entry.to_le_bytes(), GuestAddress(level_base + i * 8))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_matches_recurrence_for_one_mib() {
        let s = Sizing::for_memory(1024 * 1024);
        assert_eq!(s.leaf_entries, 256);
        assert_eq!(s.pt_frames, 1);
        assert_eq!(s.pd_frames, 1);
        assert_eq!(s.pdpt_frames, 1);
        assert_eq!(s.pml4_frames, 1);
        assert_eq!(s.total_frames(), 4);
    }

    #[test]
    fn sizing_matches_recurrence_for_one_gib() {
        let s = Sizing::for_memory(1024 * 1024 * 1024);
        assert_eq!(s.leaf_entries, 262_144);
        assert_eq!(s.pt_frames, 512);
        assert_eq!(s.pd_frames, 1);
        assert_eq!(s.pdpt_frames, 1);
        assert_eq!(s.pml4_frames, 1);
    }

    #[test]
    fn sizing_handles_non_frame_aligned_entry_counts() {
        // 513 leaf entries need 2 PT frames (512 + 1).
        let s = Sizing::for_memory(513 * PAGE_SIZE);
        assert_eq!(s.leaf_entries, 513);
        assert_eq!(s.pt_frames, 2);
        assert_eq!(s.pd_frames, 1);
    }

    fn build_region_only(mem_size: u64) -> (GuestMemoryMmap<()>, Sizing, u64) {
        let sizing = Sizing::for_memory(mem_size);
        let region_size = sizing.total_frames() * PAGE_SIZE;
        let base = mem_size;
        let base_addr = GuestAddress(base);
        let mem: GuestMemoryMmap<()> =
            GuestMemoryMmap::from_ranges(&[(base_addr, region_size as usize)]).unwrap();

        write_level(&mem, base, sizing.pt_offset(), sizing.leaf_entries, |i| {
            i * PAGE_SIZE
        })
        .unwrap();
        write_level(&mem, base, sizing.pd_offset(), sizing.pt_frames, |i| {
            base + (sizing.pt_offset() + i) * PAGE_SIZE
        })
        .unwrap();
        write_level(&mem, base, sizing.pdpt_offset(), sizing.pd_frames, |i| {
            base + (sizing.pd_offset() + i) * PAGE_SIZE
        })
        .unwrap();
        write_level(&mem, base, sizing.pml4_offset(), sizing.pdpt_frames, |i| {
            base + (sizing.pdpt_offset() + i) * PAGE_SIZE
        })
        .unwrap();

        (mem, sizing, base)
    }

    #[test]
    fn walk_covers_every_frame_in_small_memory() {
        let mem_size = 1024 * 1024;
        let (mem, sizing, base) = build_region_only(mem_size);
        let cr3 = base + sizing.pml4_offset() * PAGE_SIZE;
        let pt = PageTable {
            mem,
            base,
            cr3,
            sizing,
        };

        for frame in 0..sizing.leaf_entries {
            let addr = frame * PAGE_SIZE;
            assert_eq!(pt.walk(addr), Some(addr), "frame {frame} did not map to itself");
        }
    }

    #[test]
    fn walk_covers_every_frame_across_a_pt_boundary() {
        // force 2 PT frames so the walk exercises PD fan-out too.
        let mem_size = 513 * PAGE_SIZE;
        let (mem, sizing, base) = build_region_only(mem_size);
        let cr3 = base + sizing.pml4_offset() * PAGE_SIZE;
        let pt = PageTable {
            mem,
            base,
            cr3,
            sizing,
        };

        for frame in 0..sizing.leaf_entries {
            let addr = frame * PAGE_SIZE;
            assert_eq!(pt.walk(addr), Some(addr));
        }
    }

    #[test]
    fn cr3_points_at_last_frame_of_region() {
        let mem_size = 1024 * 1024;
        let sizing = Sizing::for_memory(mem_size);
        let base = mem_size;
        let region_size = sizing.total_frames() * PAGE_SIZE;
        let cr3 = base + sizing.pml4_offset() * PAGE_SIZE;
        assert_eq!(cr3, base + region_size - sizing.pml4_frames * PAGE_SIZE);
    }
}
