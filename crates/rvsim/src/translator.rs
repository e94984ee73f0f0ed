//! Binary translator plug-in point.
//!
//! The core does not translate anything itself; it exposes the contract
//! external native code plugs into: a callback table over machine
//! primitives, access to the instruction counter and limit, and an
//! `address → handler` registration that flips decoder entries to the
//! `Translator` bytecode. The dispatcher invokes the handler, re-reads
//! PC and counter, and continues.

use rvsim_isa::Xlen;

use crate::error::{MachineError, Result};
use crate::handlers;
use crate::machine::Machine;
use crate::segment::TranslatorFn;

/// Machine primitives handed to translated code.
///
/// Plain function pointers so a registered translation can drive the
/// machine without linking against internals.
pub struct TranslatorCallbacks<X: Xlen> {
    pub load_u8: fn(&mut Machine<X>, u64) -> Result<u8>,
    pub load_u16: fn(&mut Machine<X>, u64) -> Result<u16>,
    pub load_u32: fn(&mut Machine<X>, u64) -> Result<u32>,
    pub load_u64: fn(&mut Machine<X>, u64) -> Result<u64>,
    pub store_u8: fn(&mut Machine<X>, u64, u8) -> Result<()>,
    pub store_u16: fn(&mut Machine<X>, u64, u16) -> Result<()>,
    pub store_u32: fn(&mut Machine<X>, u64, u32) -> Result<()>,
    pub store_u64: fn(&mut Machine<X>, u64, u64) -> Result<()>,
    pub jump: fn(&mut Machine<X>, u64) -> Result<()>,
    pub syscall: fn(&mut Machine<X>, u64) -> Result<()>,
    pub stop: fn(&mut Machine<X>),
    pub ebreak: fn(&mut Machine<X>) -> Result<()>,
    pub system: fn(&mut Machine<X>, u32) -> Result<()>,
    pub execute_one: fn(&mut Machine<X>) -> Result<()>,
    pub trigger_exception: fn(&mut Machine<X>, MachineError) -> Result<()>,
    pub sqrt_f32: fn(f32) -> f32,
    pub sqrt_f64: fn(f64) -> f64,
    pub counter: fn(&Machine<X>) -> u64,
    pub set_counter: fn(&mut Machine<X>, u64),
    pub max_counter: fn(&Machine<X>) -> u64,
}

impl<X: Xlen> TranslatorCallbacks<X> {
    /// The standard callback table over this machine implementation.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            load_u8: |m, addr| Ok(m.memory.read::<u8>(addr)?),
            load_u16: |m, addr| Ok(m.memory.read::<u16>(addr)?),
            load_u32: |m, addr| Ok(m.memory.read::<u32>(addr)?),
            load_u64: |m, addr| Ok(m.memory.read::<u64>(addr)?),
            store_u8: |m, addr, v| Ok(m.memory.write(addr, v)?),
            store_u16: |m, addr, v| Ok(m.memory.write(addr, v)?),
            store_u32: |m, addr, v| Ok(m.memory.write(addr, v)?),
            store_u64: |m, addr, v| Ok(m.memory.write(addr, v)?),
            jump: |m, target| m.cpu.jump(target),
            syscall: |m, nr| m.system_call(nr),
            stop: Machine::stop,
            ebreak: |m| m.system_call(crate::syscalls::SYSCALL_EBREAK as u64),
            system: |m, word| m.system(rvsim_isa::Instr(word)),
            execute_one: |m| {
                let pc = m.cpu.pc;
                let instr = m.cpu.fetch_slowpath(&m.memory, pc)?;
                let next = handlers::execute_instr(m, instr, pc)?;
                m.set_instruction_counter(m.instruction_counter() + 1);
                m.cpu.jump(next)
            },
            trigger_exception: |_m, err| Err(err),
            sqrt_f32: f32::sqrt,
            sqrt_f64: f64::sqrt,
            counter: Machine::instruction_counter,
            set_counter: Machine::set_instruction_counter,
            max_counter: Machine::max_instructions,
        }
    }
}

impl<X: Xlen> Machine<X> {
    /// Register translated handlers for a set of addresses.
    ///
    /// Decoder entries at those addresses get the `Translator` bytecode
    /// when their segment is (re)decoded; existing segments are dropped
    /// so the mapping takes effect. `NO_TRANSLATE` in the environment
    /// disables registration entirely; activating twice is an error.
    pub fn install_translation(
        &mut self,
        mapping: impl IntoIterator<Item = (u64, TranslatorFn<X>)>,
    ) -> Result<()> {
        if std::env::var_os("NO_TRANSLATE").is_some()
            || self.options.translate_blocks_max == 0
        {
            if std::env::var_os("VERBOSE").is_some() {
                tracing::info!("binary translation disabled");
            }
            return Ok(());
        }
        if self.translation_active {
            return Err(MachineError::IllegalOperation(
                "machine already reports binary translation",
            ));
        }

        let mut count = 0usize;
        for (addr, handler) in mapping {
            if count >= self.options.translate_blocks_max as usize {
                break;
            }
            self.translations.insert(addr, handler);
            count += 1;
        }
        if std::env::var_os("VERBOSE").is_some() {
            tracing::info!(blocks = count, "binary translation activated");
        }
        self.translation_active = count > 0;
        if self.translation_active {
            self.invalidate_segments();
        }
        Ok(())
    }

    /// Whether a translation mapping is active.
    #[must_use]
    pub fn is_binary_translated(&self) -> bool {
        self.translation_active
    }
}
