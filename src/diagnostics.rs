use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};

use crate::vcpu::VCpu;

// Numeric KVM_EXIT_* codes, as defined by the kernel's public
// `linux/kvm.h` header. Kept as a local fixed table rather than re-exported
// from kvm-bindings so the name shown to the operator is stable regardless
// of which exit path produced it.
const EXIT_NAMES: &[(u32, &str)] = &[
    (0, "unknown"),
    (1, "exception"),
    (2, "io"),
    (3, "hypercall"),
    (4, "debug"),
    (5, "hlt"),
    (6, "mmio"),
    (7, "irq_window_open"),
    (8, "shutdown"),
    (9, "fail_entry"),
    (10, "intr"),
    (11, "set_tpr"),
    (12, "tpr_access"),
    (16, "nmi"),
    (17, "internal_error"),
    (24, "system_event"),
    (26, "ioapic_eoi"),
    (27, "hyperv"),
    (33, "x86_bus_lock"),
    (37, "notify"),
];

pub fn exit_name(code: u32) -> &'static str {
    EXIT_NAMES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
        .unwrap_or("UNKNOWN")
}

pub enum Direction {
    In,
    Out,
}

/// Owned, decoded exit-specific payload, captured before the kernel-shared
/// run-state borrow from `VcpuFd::run` ends.
pub enum ExitDetails {
    PortIo {
        direction: Direction,
        port: u16,
        size: usize,
        count: usize,
        data: Vec<u8>,
    },
    Mmio {
        is_write: bool,
        addr: u64,
        len: usize,
        data: Vec<u8>,
    },
    Other(String),
}

/// Renders the full diagnostic dump for a fatal exit to stderr. Best-effort:
/// a failure to read one register bank is noted inline and does not abort
/// the rest of the dump.
pub fn report(code: u32, details: &ExitDetails, vcpu: &VCpu) {
    eprintln!("blankvm: fatal VM exit: {} ({code})", exit_name(code));

    match details {
        ExitDetails::PortIo {
            direction,
            port,
            size,
            count,
            data,
        } => {
            let dir = match direction {
                Direction::In => "IN",
                Direction::Out => "OUT",
            };
            eprintln!("  port i/o: {dir} port={port:#06x} size={size} count={count}");
            if matches!(direction, Direction::Out) {
                eprintln!("  payload: {}", hex_dump(data));
            }
        }
        ExitDetails::Mmio {
            is_write,
            addr,
            len,
            data,
        } => {
            let dir = if *is_write { "write" } else { "read" };
            eprintln!("  mmio {dir}: addr={addr:#x} len={len}");
            if *is_write {
                eprintln!("  payload: {}", hex_dump(data));
            }
        }
        ExitDetails::Other(msg) => {
            eprintln!("  detail: {msg}");
        }
    }

    match vcpu.regs() {
        Ok(regs) => dump_regs(&regs),
        Err(e) => eprintln!("  (failed to read general registers: {e})"),
    }

    match vcpu.sregs() {
        Ok(sregs) => dump_sregs(&sregs),
        Err(e) => eprintln!("  (failed to read special registers: {e})"),
    }

    match vcpu.lapic() {
        Ok(lapic) => {
            let tpr = lapic.regs[0x80] as u8;
            eprintln!("  tpr: {tpr:#04x}");
        }
        Err(e) => eprintln!("  (failed to read local APIC state: {e})"),
    }
}

fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn dump_regs(regs: &kvm_regs) {
    eprintln!(
        "  rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
        regs.rax, regs.rbx, regs.rcx, regs.rdx
    );
    eprintln!(
        "  rsi={:#018x} rdi={:#018x} rsp={:#018x} rbp={:#018x}",
        regs.rsi, regs.rdi, regs.rsp, regs.rbp
    );
    eprintln!(
        "  r8 ={:#018x} r9 ={:#018x} r10={:#018x} r11={:#018x}",
        regs.r8, regs.r9, regs.r10, regs.r11
    );
    eprintln!(
        "  r12={:#018x} r13={:#018x} r14={:#018x} r15={:#018x}",
        regs.r12, regs.r13, regs.r14, regs.r15
    );
    eprintln!("  rip={:#018x} rflags={:#018x}", regs.rip, regs.rflags);
}

fn dump_segment(name: &str, seg: &kvm_segment) {
    eprintln!(
        "  {name}: base={:#018x} limit={:#010x} selector={:#06x} type={:#04x} \
present={} dpl={} db={} s={} l={} g={} avl={} unusable={}",
        seg.base,
        seg.limit,
        seg.selector,
        seg.type_,
        seg.present,
        seg.dpl,
        seg.db,
        seg.s,
        seg.l,
        seg.g,
        seg.avl,
        seg.unusable
    );
}

fn dump_sregs(sregs: &kvm_sregs) {
    dump_segment("cs", &sregs.cs);
    dump_segment("ds", &sregs.ds);
    dump_segment("es", &sregs.es);
    dump_segment("fs", &sregs.fs);
    dump_segment("gs", &sregs.gs);
    dump_segment("ss", &sregs.ss);
    dump_segment("tr", &sregs.tr);
    dump_segment("ldt", &sregs.ldt);
    eprintln!(
        "  gdt: base={:#018x} limit={:#06x}   idt: base={:#018x} limit={:#06x}",
        sregs.gdt.base, sregs.gdt.limit, sregs.idt.base, sregs.idt.limit
    );
    eprintln!(
        "  cr0={:#018x} cr2={:#018x} cr3={:#018x} cr4={:#018x} cr8={:#018x}",
        sregs.cr0, sregs.cr2, sregs.cr3, sregs.cr4, sregs.cr8
    );
    eprintln!("  efer={:#018x} apic_base={:#018x}", sregs.efer, sregs.apic_base);
    eprintln!(
        "  interrupt_bitmap: [{:#018x}, {:#018x}, {:#018x}, {:#018x}]",
        sregs.interrupt_bitmap[0],
        sregs.interrupt_bitmap[1],
        sregs.interrupt_bitmap[2],
        sregs.interrupt_bitmap[3]
    );
}
