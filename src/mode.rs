use kvm_bindings::{kvm_regs, kvm_sregs};

use crate::cli::Mode;

const CR0_PE: u64 = 1 << 0;
const CR0_PG: u64 = 1 << 31;
const CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

const SEGMENT_TYPE_CODE: u8 = 0x0B;
const SEGMENT_TYPE_DATA: u8 = 0x03;
const CODE_SELECTOR: u16 = 8;
const DATA_SELECTOR: u16 = 16;

/// A pure data transformation that starts from the vCPU's own initial
/// register state (as returned by `get_regs`/`get_sregs` right after
/// creation) and sets only the bits the requested mode needs. Control
/// registers and EFER are additive — the kernel's initial bits are kept and
/// ORed with the mode's bits, never zeroed out — and TR/LDT/GDT/IDT are
/// left exactly as the kernel returned them. Never touches the kernel
/// itself; `VCpu` pushes the result in one step once this returns.
pub fn registers_for(
    mut regs: kvm_regs,
    mut sregs: kvm_sregs,
    mode: Mode,
    entry: u64,
    cr3: Option<u64>,
) -> (kvm_regs, kvm_sregs) {
    regs.rip = entry;

    program_segments(&mut sregs, mode);

    match mode {
        Mode::Real16 => {}
        Mode::Protected32 => {
            sregs.cr0 |= CR0_PE;
        }
        Mode::Long64 => {
            sregs.cr0 |= CR0_PE | CR0_PG;
            sregs.cr4 |= CR4_PAE;
            sregs.efer |= EFER_LME | EFER_LMA;
            if let Some(cr3) = cr3 {
                sregs.cr3 = cr3;
            }
        }
    }

    (regs, sregs)
}

fn program_segments(sregs: &mut kvm_sregs, mode: Mode) {
    let (selector_code, selector_data, limit, db, l, g) = match mode {
        Mode::Real16 => (0u16, 0u16, 0xFFFFu32, 0u8, 0u8, 0u8),
        Mode::Protected32 => (CODE_SELECTOR, DATA_SELECTOR, 0xFFFF_FFFFu32, 1u8, 0u8, 1u8),
        Mode::Long64 => (CODE_SELECTOR, DATA_SELECTOR, 0xFFFF_FFFFu32, 0u8, 1u8, 1u8),
    };

    let mut code = base_segment(selector_code, limit, SEGMENT_TYPE_CODE, db, g);
    code.l = l;
    sregs.cs = code;

    let data_template = base_segment(selector_data, limit, SEGMENT_TYPE_DATA, db, g);
    sregs.ds = data_template;
    sregs.es = data_template;
    sregs.fs = data_template;
    sregs.gs = data_template;
    sregs.ss = data_template;
}

fn base_segment(
    selector: u16,
    limit: u32,
    type_: u8,
    db: u8,
    g: u8,
) -> kvm_bindings::kvm_segment {
    kvm_bindings::kvm_segment {
        base: 0,
        limit,
        selector,
        type_,
        present: 1,
        dpl: 0,
        db,
        s: 1,
        l: 0,
        g,
        avl: 0,
        unusable: 0,
        padding: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_mode_segments_are_16bit_flat() {
        let (regs, sregs) = registers_for(
            kvm_regs::default(),
            kvm_sregs::default(),
            Mode::Real16,
            0x7c00,
            None,
        );
        assert_eq!(regs.rip, 0x7c00);
        assert_eq!(sregs.cs.selector, 0);
        assert_eq!(sregs.cs.limit, 0xFFFF);
        assert_eq!(sregs.cs.g, 0);
        assert_eq!(sregs.cs.type_, SEGMENT_TYPE_CODE);
        assert_eq!(sregs.ds.type_, SEGMENT_TYPE_DATA);
        assert_eq!(sregs.cr0 & CR0_PE, 0);
    }

    #[test]
    fn protected_mode_sets_pe_and_db() {
        let (_, sregs) = registers_for(
            kvm_regs::default(),
            kvm_sregs::default(),
            Mode::Protected32,
            0,
            None,
        );
        assert_ne!(sregs.cr0 & CR0_PE, 0);
        assert_eq!(sregs.cr0 & CR0_PG, 0);
        assert_eq!(sregs.cs.db, 1);
        assert_eq!(sregs.cs.limit, 0xFFFF_FFFF);
        assert_eq!(sregs.cs.g, 1);
    }

    #[test]
    fn long_mode_sets_paging_pae_and_lme_lma() {
        let (_, sregs) = registers_for(
            kvm_regs::default(),
            kvm_sregs::default(),
            Mode::Long64,
            0x1000,
            Some(0x9000),
        );
        assert_ne!(sregs.cr0 & CR0_PE, 0);
        assert_ne!(sregs.cr0 & CR0_PG, 0);
        assert_ne!(sregs.cr4 & CR4_PAE, 0);
        assert_ne!(sregs.efer & EFER_LME, 0);
        assert_ne!(sregs.efer & EFER_LMA, 0);
        assert_eq!(sregs.cr3, 0x9000);
        assert_eq!(sregs.cs.l, 1);
        assert_eq!(sregs.cs.db, 0);
    }

    #[test]
    fn segments_share_base_zero_across_all_six() {
        let (_, sregs) = registers_for(
            kvm_regs::default(),
            kvm_sregs::default(),
            Mode::Protected32,
            0,
            None,
        );
        for seg in [sregs.cs, sregs.ds, sregs.es, sregs.fs, sregs.gs, sregs.ss] {
            assert_eq!(seg.base, 0);
        }
    }

    #[test]
    fn kernel_initial_state_is_preserved_not_overwritten() {
        let mut base_regs = kvm_regs::default();
        base_regs.rsp = 0xdead_beef;

        let mut base_sregs = kvm_sregs::default();
        base_sregs.cr0 = 1 << 4; // some bit the kernel set that we don't touch
        base_sregs.tr.selector = 0x28;
        base_sregs.ldt.selector = 0x30;
        base_sregs.gdt.base = 0x1234;
        base_sregs.idt.limit = 0xffff;

        let (regs, sregs) = registers_for(base_regs, base_sregs, Mode::Long64, 0, Some(0x1000));

        assert_eq!(regs.rsp, 0xdead_beef);
        assert_ne!(sregs.cr0 & (1 << 4), 0, "pre-existing CR0 bits must survive");
        assert_ne!(sregs.cr0 & CR0_PE, 0, "mode bits are ORed on top");
        assert_eq!(sregs.tr.selector, 0x28);
        assert_eq!(sregs.ldt.selector, 0x30);
        assert_eq!(sregs.gdt.base, 0x1234);
        assert_eq!(sregs.idt.limit, 0xffff);
    }
}
