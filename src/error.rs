use memflow::prelude::v1::Address;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors produced while decoding kernel structures.
#[derive(Error, Debug)]
pub enum KernelError {
    /// Neither the VMCOREINFO table nor the symbol source exposes a required layout element.
    #[error("kernel data unavailable: {0}")]
    DataUnavailable(String),

    #[error("address {address:x} is outside of [{start:x}, {end:x}]")]
    OutOfDomain {
        address: Address,
        start: Address,
        end: Address,
    },

    /// The index is valid looking, but the slot it maps to is not populated.
    #[error("cpu {cpu} has no per-cpu area")]
    RangeInvalid { cpu: usize },

    #[error("corrupted kernel structure: {0}")]
    Corrupted(String),

    #[error("memory read failed: {0}")]
    Memory(#[from] memflow::error::Error),
}

impl KernelError {
    pub(crate) fn unavailable(what: impl Into<String>) -> Self {
        KernelError::DataUnavailable(what.into())
    }
}
