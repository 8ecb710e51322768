use kvm_ioctls::VcpuExit;

use crate::diagnostics::{self, Direction, ExitDetails};
use crate::error::Result;
use crate::serial::{SerialConsole, SERIAL_PORT};
use crate::vcpu::VCpu;

/// How the run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Guest-driven serial EOF: clean shutdown, process exits 0.
    Clean,
    /// An exit Diagnostics has already reported: process exits non-zero.
    Fatal,
}

/// Classifies each VM exit and drives the run loop: service port 0x3F8 I/O
/// via `SerialConsole`, report and stop on anything else.
pub struct ExitDispatcher;

impl ExitDispatcher {
    pub fn run(vcpu: &mut VCpu, serial: &mut SerialConsole) -> Result<RunOutcome> {
        loop {
            let exit = vcpu.run()?;

            match exit {
                VcpuExit::IoOut(port, data) if port == SERIAL_PORT && data.len() == 1 => {
                    serial.write_byte(data[0])?;
                }
                VcpuExit::IoIn(port, data) if port == SERIAL_PORT && data.len() == 1 => {
                    match serial.read_byte()? {
                        Some(byte) => data[0] = byte,
                        None => {
                            tracing::info!("stdin reached EOF, shutting down cleanly");
                            return Ok(RunOutcome::Clean);
                        }
                    }
                }
                other => {
                    let (code, details) = classify(&other);
                    diagnostics::report(code, &details, vcpu);
                    return Ok(RunOutcome::Fatal);
                }
            }
        }
    }
}

fn classify(exit: &VcpuExit<'_>) -> (u32, ExitDetails) {
    match exit {
        VcpuExit::IoIn(port, data) => (
            2,
            ExitDetails::PortIo {
                direction: Direction::In,
                port: *port,
                size: 1,
                count: data.len(),
                data: data.to_vec(),
            },
        ),
        VcpuExit::IoOut(port, data) => (
            2,
            ExitDetails::PortIo {
                direction: Direction::Out,
                port: *port,
                size: 1,
                count: data.len(),
                data: data.to_vec(),
            },
        ),
        VcpuExit::MmioRead(addr, data) => (
            6,
            ExitDetails::Mmio {
                is_write: false,
                addr: *addr,
                len: data.len(),
                data: Vec::new(),
            },
        ),
        VcpuExit::MmioWrite(addr, data) => (
            6,
            ExitDetails::Mmio {
                is_write: true,
                addr: *addr,
                len: data.len(),
                data: data.to_vec(),
            },
        ),
        VcpuExit::Hlt => (5, ExitDetails::Other("guest executed HLT".into())),
        VcpuExit::Shutdown => (8, ExitDetails::Other("triple fault / shutdown".into())),
        VcpuExit::FailEntry(reason, cpu) => (
            9,
            ExitDetails::Other(format!(
                "hardware entry failure: reason={reason:#x} cpu={cpu}"
            )),
        ),
        VcpuExit::InternalError => (17, ExitDetails::Other("internal KVM error".into())),
        VcpuExit::Debug(_) => (4, ExitDetails::Other("guest hit a debug/breakpoint exit".into())),
        VcpuExit::IrqWindowOpen => (7, ExitDetails::Other("interrupt window open".into())),
        VcpuExit::Intr => (10, ExitDetails::Other("interrupted before guest entry".into())),
        VcpuExit::SetTpr => (11, ExitDetails::Other("guest set TPR".into())),
        VcpuExit::TprAccess => (12, ExitDetails::Other("guest accessed TPR".into())),
        VcpuExit::Nmi => (16, ExitDetails::Other("non-maskable interrupt".into())),
        VcpuExit::SystemEvent { .. } => (
            24,
            ExitDetails::Other("guest system event (reset/shutdown/crash)".into()),
        ),
        VcpuExit::IoapicEoi { .. } => (26, ExitDetails::Other("IOAPIC end-of-interrupt".into())),
        VcpuExit::Hyperv => (27, ExitDetails::Other("Hyper-V exit".into())),
        VcpuExit::X86BusLock => (33, ExitDetails::Other("x86 bus lock detected".into())),
        VcpuExit::Notify { .. } => (37, ExitDetails::Other("guest notify exit".into())),
        other => (0, ExitDetails::Other(format!("{other:?}"))),
    }
}
