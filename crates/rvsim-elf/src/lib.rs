//! Minimal ELF parser for RISC-V guest programs.
//!
//! Parses just enough of ELF32/ELF64 to load a static executable:
//! the header, PT_LOAD program headers and the symbol table. Anything
//! dynamic is rejected by the loader above this crate.

mod constants;
mod file;
mod image;

pub use constants::*;
pub use file::*;
pub use image::*;

use thiserror::Error;

/// ELF parsing errors.
#[derive(Error, Debug)]
pub enum ElfError {
    #[error("ELF data too small")]
    TooSmall,
    #[error("Invalid ELF magic number")]
    InvalidMagic,
    #[error("Only little-endian ELF supported")]
    NotLittleEndian,
    #[error("Not a RISC-V ELF (machine {0})")]
    NotRiscV(u16),
    #[error("ELF XLEN mismatch: expected {expected}, got {actual}")]
    XlenMismatch { expected: u8, actual: u8 },
    #[error("Unsupported ELF class: {0}")]
    UnsupportedClass(u8),
    #[error("Program header out of bounds")]
    ProgramOutOfBounds,
    #[error("Section header out of bounds")]
    SectionOutOfBounds,
    #[error("Segment extends beyond file")]
    SegmentBeyondFile,
    #[error("No loadable segments found")]
    NoLoadableSegments,
}

pub type Result<T> = std::result::Result<T, ElfError>;
