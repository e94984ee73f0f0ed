//! Machine exceptions.
//!
//! Architectural faults unwind out of `simulate` to the host; reaching
//! the instruction limit is a normal return, not an error.

use rvsim_mem::MemoryError;
use thiserror::Error;

/// Why a `simulate` invocation returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A stop instruction ran or a syscall stopped the machine.
    Stopped,
    /// The instruction counter reached `max_instructions`.
    InstructionLimit,
}

/// Machine exceptions raised by handlers and the dispatcher.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MachineError {
    #[error("illegal opcode {instr:#010x} at 0x{pc:x}")]
    IllegalOpcode { pc: u64, instr: u32 },

    #[error("illegal operation: {0}")]
    IllegalOperation(&'static str),

    #[error("protection fault at 0x{0:x}")]
    ProtectionFault(u64),

    #[error("execution space protection fault at 0x{0:x}")]
    ExecutionSpaceProtectionFault(u64),

    #[error("misaligned instruction at 0x{0:x}")]
    MisalignedInstruction(u64),

    #[error("invalid data alignment at 0x{0:x}")]
    InvalidAlignment(u64),

    #[error("unimplemented instruction {instr:#010x} at 0x{pc:x}")]
    UnimplementedInstruction { pc: u64, instr: u32 },

    #[error("operational limit exceeded: {0}")]
    MaxInstructionsReached(&'static str),

    #[error("invalid program: {0}")]
    InvalidProgram(String),
}

impl MachineError {
    /// The faulting address or data word, when the exception carries one.
    #[must_use]
    pub fn data(&self) -> Option<u64> {
        match self {
            Self::IllegalOpcode { instr, .. } | Self::UnimplementedInstruction { instr, .. } => {
                Some(u64::from(*instr))
            }
            Self::ProtectionFault(addr)
            | Self::ExecutionSpaceProtectionFault(addr)
            | Self::MisalignedInstruction(addr)
            | Self::InvalidAlignment(addr) => Some(*addr),
            _ => None,
        }
    }
}

impl From<MemoryError> for MachineError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::ProtectionFault(addr) | MemoryError::BeyondMemoryLimit(addr) => {
                Self::ProtectionFault(addr)
            }
            MemoryError::InvalidAlignment(addr) => Self::InvalidAlignment(addr),
        }
    }
}

impl From<rvsim_elf::ElfError> for MachineError {
    fn from(err: rvsim_elf::ElfError) -> Self {
        Self::InvalidProgram(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MachineError>;
