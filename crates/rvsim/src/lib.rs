//! rvsim — user-mode RISC-V emulator.
//!
//! Emulates a single hart executing a loaded program image in a private
//! virtual address space. Instructions are pre-decoded into a compact
//! bytecode grouped into straight-line blocks, then executed by one of
//! three interchangeable dispatch loops. Guest memory is paged with
//! copy-on-write sharing for fork, and the Linux mmap family plus a
//! host-side heap arena are built in.
//!
//! # Example
//!
//! ```ignore
//! use rvsim::{Machine, MachineOptions, Rv64};
//!
//! let mut machine = Machine::<Rv64>::from_elf(&binary, MachineOptions::default())?;
//! rvsim::syscalls::setup_linux_syscalls(&mut machine)?;
//! machine.simulate(u64::MAX)?;
//! println!("exit: {}", machine.return_value());
//! ```

mod bytecode;
mod cpu;
mod decoder;
mod dispatch;
mod error;
mod handlers;
mod loader;
mod machine;
mod options;
mod segment;
mod snapshot;
pub mod syscalls;
mod translator;

pub use bytecode::{Bytecode, BYTECODES_MAX};
pub use cpu::{Cpu, FloatReg};
pub use error::{MachineError, Result, StopReason};
pub use machine::{Machine, SyscallFn};
pub use options::{
    DispatchMode, MachineOptions, ATOMICS_ENABLED, COMPRESSED_ENABLED, FLOAT_ENABLED,
    VECTOR_ENABLED,
};
pub use segment::{DecoderEntry, ExecuteSegment, InstrHandler, TranslatorFn};
pub use translator::TranslatorCallbacks;

// Re-export the building blocks for embedders
pub use rvsim_elf::{get_elf_xlen, ElfImage};
pub use rvsim_isa::{Rv32, Rv64, Xlen, NUM_FREGS, NUM_REGS};
pub use rvsim_mem::{Arena, Memory, Page, PageAttributes, PAGE_SIZE};
