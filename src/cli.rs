use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};

const DEFAULT_MEMORY_SIZE: u64 = 1024 * 1024;

/// The CPU mode the guest starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Real16,
    Protected32,
    Long64,
}

/// `blankvm [-R|-P|-L] [-m memsize] [-e entry] [-p pagetable] image`
#[derive(Parser, Debug)]
#[command(name = "blankvm", about = "a minimal KVM hypervisor")]
struct Args {
    /// Start the guest in 16-bit real mode (default).
    #[arg(short = 'R', long, conflicts_with_all = ["protected", "long"])]
    real: bool,

    /// Start the guest in 32-bit protected mode.
    #[arg(short = 'P', long, conflicts_with_all = ["real", "long"])]
    protected: bool,

    /// Start the guest in 64-bit long mode.
    #[arg(short = 'L', long, conflicts_with_all = ["real", "protected"])]
    long: bool,

    /// Guest memory size: decimal, 0x-prefixed hex, or 0-prefixed octal.
    #[arg(short = 'm', long = "mem", value_parser = parse_number)]
    memory_size: Option<u64>,

    /// Entry point guest-physical address, same numeric formats as -m.
    #[arg(short = 'e', long, value_parser = parse_number)]
    entry: Option<u64>,

    /// Preloaded page-table guest-physical base address (long mode only).
    #[arg(short = 'p', long = "pagetable", value_parser = parse_number)]
    page_table: Option<u64>,

    /// Path to the raw guest image.
    image: PathBuf,
}

/// Parses a decimal, `0x`-prefixed hex, or `0`-prefixed octal numeric string.
fn parse_number(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| format!("invalid hex number {s:?}: {e}"))
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).map_err(|e| format!("invalid octal number {s:?}: {e}"))
    } else {
        s.parse::<u64>()
            .map_err(|e| format!("invalid number {s:?}: {e}"))
    }
}

/// Fully validated command-line options.
#[derive(Debug, Clone)]
pub struct Options {
    pub mode: Mode,
    pub memory_size: u64,
    pub entry: u64,
    pub page_table: Option<u64>,
    pub image: PathBuf,
}

impl Options {
    /// Parses `argv` and validates the memory-size and mode/entry-range
    /// invariants. Nothing here touches the kernel.
    pub fn parse() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> Result<Self> {
        let mode = if args.protected {
            Mode::Protected32
        } else if args.long {
            Mode::Long64
        } else {
            Mode::Real16
        };

        let memory_size = args.memory_size.unwrap_or(DEFAULT_MEMORY_SIZE);
        if memory_size == 0 || memory_size % 4096 != 0 {
            return Err(Error::Config(format!(
                "memory size must be a positive multiple of 4096, got {memory_size}"
            )));
        }

        let entry = args.entry.unwrap_or(0);
        match mode {
            Mode::Real16 if entry >= 0x1_0000 => {
                return Err(Error::Config(format!(
                    "entry point {entry:#x} out of range for real mode (must be < 0x10000)"
                )));
            }
            Mode::Protected32 if entry > u32::MAX as u64 => {
                return Err(Error::Config(format!(
                    "entry point {entry:#x} out of range for protected mode (must be < 2^32)"
                )));
            }
            _ => {}
        }

        if args.page_table.is_some() && mode != Mode::Long64 {
            return Err(Error::Config(
                "-p (preloaded page table) is only valid in long mode".into(),
            ));
        }

        Ok(Options {
            mode,
            memory_size,
            entry,
            page_table: args.page_table,
            image: args.image,
        })
    }
}
