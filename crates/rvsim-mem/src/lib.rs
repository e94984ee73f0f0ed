//! Guest memory for the emulator: a paged, copy-on-write address space
//! plus a separate-address-space heap allocator.
//!
//! Pages are 4 KiB and reference-counted; a fork shares every page with
//! the source and the first writer on either side gets a private copy.
//! Reads of unmapped pages observe zeroes without allocating.

mod arena;
mod memory;
mod page;

pub use arena::*;
pub use memory::*;
pub use page::*;

use thiserror::Error;

/// Memory access errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("protection fault at 0x{0:x}")]
    ProtectionFault(u64),

    #[error("invalid alignment at 0x{0:x}")]
    InvalidAlignment(u64),

    #[error("access beyond memory limit at 0x{0:x}")]
    BeyondMemoryLimit(u64),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
