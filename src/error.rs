use thiserror::Error as ThisError;

/// Every fallible operation in the crate returns this. A fatal vCPU exit is
/// not represented here: `ExitDispatcher` reports it to stderr itself and
/// signals it through `RunOutcome::Fatal` rather than an `Err`, since by
/// that point the diagnostic dump has already been written.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("{0}")]
    Config(String),

    #[error("kvm error: {0}")]
    Kvm(#[from] kvm_ioctls::Error),

    #[error("guest memory error: {0}")]
    GuestMemory(#[from] vm_memory::GuestMemoryError),

    #[error("guest memory layout error: {0}")]
    FromRanges(#[from] vm_memory::mmap::FromRangesError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
