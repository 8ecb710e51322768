use std::process::ExitCode;

use blankvm::cli::{Mode, Options};
use blankvm::error::Result;
use blankvm::exit::{ExitDispatcher, RunOutcome};
use blankvm::hypervisor::HypervisorHandle;
use blankvm::memory::GuestMemory;
use blankvm::mode::registers_for;
use blankvm::page_table::PageTable;
use blankvm::serial::SerialConsole;
use blankvm::vcpu::VCpu;

/// Bundles every acquired resource so that dropping it tears everything
/// down in a fixed reverse order: run-state and vCPU handle first, then the
/// VM/hypervisor handle, then the RAM and page-table host mappings. Field
/// order *is* drop order for a struct.
struct Session {
    vcpu: VCpu,
    hypervisor: HypervisorHandle,
    page_table: Option<PageTable>,
    guest_mem: GuestMemory,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = match Options::parse() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("blankvm: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(options) {
        Ok(RunOutcome::Clean) => ExitCode::SUCCESS,
        Ok(RunOutcome::Fatal) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("blankvm: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: Options) -> Result<RunOutcome> {
    let hypervisor = HypervisorHandle::new()?;

    let guest_mem = GuestMemory::new(hypervisor.vm(), options.memory_size as usize)?;
    guest_mem.load_image(&options.image)?;

    let (page_table, cr3) = match options.mode {
        Mode::Long64 => match options.page_table {
            Some(preloaded) => {
                tracing::info!(cr3 = preloaded, "using preloaded page table");
                (None, Some(preloaded))
            }
            None => {
                let pt = PageTable::build_identity(
                    hypervisor.vm(),
                    options.memory_size,
                    options.memory_size,
                )?;
                let cr3 = pt.cr3();
                (Some(pt), Some(cr3))
            }
        },
        _ => (None, None),
    };

    let vcpu = VCpu::new(hypervisor.vm(), 0)?;
    let base_regs = vcpu.regs()?;
    let base_sregs = vcpu.sregs()?;
    let (regs, sregs) = registers_for(base_regs, base_sregs, options.mode, options.entry, cr3);
    vcpu.load_registers(&regs, &sregs)?;
    tracing::info!(mode = ?options.mode, entry = options.entry, "vCPU programmed, starting run loop");

    let mut session = Session {
        vcpu,
        hypervisor,
        page_table,
        guest_mem,
    };

    let mut serial = SerialConsole::new();
    let outcome = ExitDispatcher::run(&mut session.vcpu, &mut serial)?;
    Ok(outcome)
}
