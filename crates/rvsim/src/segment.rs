//! Decoded execute segments.
//!
//! A segment is an immutable range of executable guest memory together
//! with its decoder cache: one entry per minimum-instruction-size slot,
//! each carrying the bytecode, the (possibly rewritten) operand word and
//! the straight-line block accounting the dispatcher uses to batch PC
//! and counter updates.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use rvsim_isa::{CInstr, Instr, Xlen};

use crate::bytecode::Bytecode;
use crate::decoder::{self, DIVISOR};
use crate::error::Result;
use crate::handlers;
use crate::machine::Machine;
use crate::options::COMPRESSED_ENABLED;

/// Handler for instructions without a dedicated bytecode.
pub type InstrHandler<X> = fn(&mut Machine<X>, Instr, u64) -> Result<()>;

/// Externally registered translation for one address.
pub type TranslatorFn<X> = Arc<dyn Fn(&mut Machine<X>) -> Result<()> + Send + Sync>;

/// Longest straight-line block, in instructions.
pub const BLOCK_MAX_INSTRUCTIONS: usize = 255;

/// One decoder cache slot.
///
/// `idxend` is the slot distance from here to the instruction that
/// terminates the block; `icount` the number of instructions from here
/// through that terminator. Entering a block adds `block_bytes` to the
/// PC and `icount` to the counter in one step.
#[derive(Clone, Copy, Debug)]
pub struct DecoderEntry {
    pub instr: u32,
    pub idxend: u16,
    pub handler: u16,
    pub bytecode: u8,
    pub icount: u8,
}

impl Default for DecoderEntry {
    fn default() -> Self {
        Self {
            instr: 0,
            idxend: 0,
            handler: 0,
            bytecode: Bytecode::Invalid as u8,
            icount: 0,
        }
    }
}

impl DecoderEntry {
    #[must_use]
    #[inline]
    pub fn bytecode(self) -> Bytecode {
        Bytecode::from_u8(self.bytecode)
    }

    /// Bytes from this instruction to its block's terminator.
    #[must_use]
    #[inline]
    pub fn block_bytes(self) -> u64 {
        u64::from(self.idxend) * DIVISOR
    }

    /// Instructions from this one through the block terminator.
    #[must_use]
    #[inline]
    pub fn instruction_count(self) -> u64 {
        u64::from(self.icount)
    }
}

/// An immutable, decoded range of executable memory.
pub struct ExecuteSegment<X: Xlen> {
    exec_begin: u64,
    exec_end: u64,
    code: Vec<u8>,
    entries: Vec<DecoderEntry>,
    handlers: Vec<InstrHandler<X>>,
    translators: Vec<TranslatorFn<X>>,
}

impl<X: Xlen> ExecuteSegment<X> {
    /// Decode `code` (covering `[exec_begin, exec_begin + len)`) into a
    /// segment. `translations` flips matching addresses to the
    /// `Translator` bytecode.
    #[must_use]
    pub fn decode(
        exec_begin: u64,
        code: Vec<u8>,
        translations: &FxHashMap<u64, TranslatorFn<X>>,
    ) -> Self {
        let exec_end = exec_begin + code.len() as u64;
        let slots = code.len() / DIVISOR as usize;
        let mut entries = vec![DecoderEntry::default(); slots];
        let mut handlers_tab: Vec<InstrHandler<X>> = Vec::new();
        let mut translators: Vec<TranslatorFn<X>> = Vec::new();

        // (slot, length, original word) per decoded instruction
        let mut decoded: Vec<(usize, u8, u32)> = Vec::with_capacity(slots);

        let mut pc = exec_begin;
        while pc < exec_end {
            let off = (pc - exec_begin) as usize;
            let slot = off / DIVISOR as usize;
            if slot >= entries.len() {
                break;
            }
            let raw = read_padded_u32(&code, off);
            let instr = Instr(raw);
            let len: u8 = if COMPRESSED_ENABLED {
                instr.length() as u8
            } else {
                4
            };

            if pc + u64::from(len) > exec_end {
                // Truncated tail; runtime fault if ever reached
                decoded.push((slot, len, raw));
                break;
            }

            let entry = &mut entries[slot];
            if let Some(translation) = translations.get(&pc) {
                entry.instr = raw;
                entry.bytecode = Bytecode::Translator as u8;
                entry.handler = intern_translator(&mut translators, translation);
            } else if len == 2 {
                let ci = CInstr(raw as u16);
                let bc = decoder::bytecode_for_compressed(ci, X::VALUE);
                let (bc, word) = decoder::rewrite_compressed(bc, pc, exec_begin, exec_end, ci);
                entry.instr = word;
                entry.bytecode = bc as u8;
                if matches!(bc, Bytecode::CFunction | Bytecode::CJumpFunction) {
                    entry.handler = intern(&mut handlers_tab, handlers::select_compressed::<X>(bc));
                }
            } else {
                let bc = decoder::bytecode_for(instr, X::VALUE);
                let (bc, word) = decoder::rewrite(bc, pc, exec_begin, exec_end, instr);
                entry.instr = word;
                entry.bytecode = bc as u8;
                if bc == Bytecode::Function {
                    entry.handler = intern(&mut handlers_tab, handlers::select_handler::<X>(instr));
                }
            }

            decoded.push((slot, len, raw));
            pc += u64::from(len);
        }

        Self::assign_blocks(&mut entries, &mut handlers_tab, &decoded);

        Self {
            exec_begin,
            exec_end,
            code,
            entries,
            handlers: handlers_tab,
            translators,
        }
    }

    /// Group instructions into straight-line blocks and fill in the
    /// per-entry accounting. Straight-line runs that hit the block size
    /// cap or the end of the segment are terminated through the generic
    /// handler so the dispatcher re-enters block accounting.
    fn assign_blocks(
        entries: &mut [DecoderEntry],
        handlers_tab: &mut Vec<InstrHandler<X>>,
        decoded: &[(usize, u8, u32)],
    ) {
        let mut i = 0;
        while i < decoded.len() {
            let mut j = i;
            loop {
                let (slot, _, original) = decoded[j];
                if entries[slot].bytecode().ends_block() {
                    break;
                }
                let is_last = j + 1 == decoded.len();
                if is_last || (j - i + 1) >= BLOCK_MAX_INSTRUCTIONS {
                    entries[slot].instr = original;
                    entries[slot].bytecode = Bytecode::FunctionBlockEnd as u8;
                    entries[slot].handler = intern(handlers_tab, handlers::handler_any::<X>);
                    break;
                }
                j += 1;
            }

            let ender_slot = decoded[j].0;
            for k in i..=j {
                let slot = decoded[k].0;
                entries[slot].idxend = (ender_slot - slot) as u16;
                entries[slot].icount = (j - k + 1) as u8;
            }
            i = j + 1;
        }
    }

    #[must_use]
    pub fn exec_begin(&self) -> u64 {
        self.exec_begin
    }

    #[must_use]
    pub fn exec_end(&self) -> u64 {
        self.exec_end
    }

    /// Whether `addr` lies inside this segment.
    #[must_use]
    #[inline]
    pub fn is_within(&self, addr: u64) -> bool {
        addr >= self.exec_begin && addr < self.exec_end
    }

    /// Decoder slot index for an address inside the segment.
    #[must_use]
    #[inline]
    pub fn slot_for(&self, addr: u64) -> usize {
        ((addr - self.exec_begin) / DIVISOR) as usize
    }

    #[must_use]
    #[inline]
    pub fn entry(&self, slot: usize) -> DecoderEntry {
        self.entries[slot]
    }

    #[must_use]
    pub fn entries(&self) -> &[DecoderEntry] {
        &self.entries
    }

    /// Raw instruction bytes at `addr`, zero-padded past the end.
    #[must_use]
    pub fn instr_at(&self, addr: u64) -> Instr {
        Instr(read_padded_u32(&self.code, (addr - self.exec_begin) as usize))
    }

    #[must_use]
    #[inline]
    pub fn handler(&self, idx: u16) -> InstrHandler<X> {
        self.handlers[idx as usize]
    }

    #[must_use]
    #[inline]
    pub fn translator(&self, idx: u16) -> TranslatorFn<X> {
        Arc::clone(&self.translators[idx as usize])
    }
}

fn read_padded_u32(code: &[u8], off: usize) -> u32 {
    let mut bytes = [0u8; 4];
    let avail = (code.len() - off).min(4);
    bytes[..avail].copy_from_slice(&code[off..off + avail]);
    u32::from_le_bytes(bytes)
}

fn intern<X: Xlen>(table: &mut Vec<InstrHandler<X>>, handler: InstrHandler<X>) -> u16 {
    if let Some(pos) = table.iter().position(|&h| h as usize == handler as usize) {
        return pos as u16;
    }
    table.push(handler);
    (table.len() - 1) as u16
}

fn intern_translator<X: Xlen>(table: &mut Vec<TranslatorFn<X>>, handler: &TranslatorFn<X>) -> u16 {
    table.push(Arc::clone(handler));
    (table.len() - 1) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvsim_isa::{asm, Rv64};

    fn decode_segment(begin: u64, instrs: &[u32]) -> ExecuteSegment<Rv64> {
        ExecuteSegment::decode(begin, asm::assemble(instrs), &FxHashMap::default())
    }

    #[test]
    fn test_block_accounting_partitions_segment() {
        // Two blocks: [addi, addi, beq] and [addi, jal]
        let seg = decode_segment(
            0x1000,
            &[
                asm::addi(1, 1, 1),
                asm::addi(2, 2, 2),
                asm::beq(1, 2, 8),
                asm::addi(3, 3, 3),
                asm::jal(0, -16),
            ],
        );

        if !COMPRESSED_ENABLED {
            let head = seg.entry(0);
            assert_eq!(head.instruction_count(), 3);
            assert_eq!(head.block_bytes(), 8); // distance to the beq
            let mid = seg.entry(1);
            assert_eq!(mid.instruction_count(), 2);
            assert_eq!(mid.block_bytes(), 4);
            let ender = seg.entry(2);
            assert_eq!(ender.instruction_count(), 1);
            assert_eq!(ender.block_bytes(), 0);

            let head2 = seg.entry(3);
            assert_eq!(head2.instruction_count(), 2);
            assert_eq!(head2.block_bytes(), 4);
        }

        // The per-entry counts partition the segment: summing icount at
        // block heads covers every instruction exactly once.
        let heads = if COMPRESSED_ENABLED { [0, 6] } else { [0, 3] };
        let total: u64 = heads.iter().map(|&s| seg.entry(s).instruction_count()).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_plain_tail_becomes_block_end() {
        // A segment ending in straight-line code gets a forced block
        // terminator that re-enters accounting at runtime.
        let seg = decode_segment(0x1000, &[asm::addi(1, 1, 1), asm::addi(2, 2, 2)]);
        let last_slot = if COMPRESSED_ENABLED { 2 } else { 1 };
        assert_eq!(seg.entry(last_slot).bytecode(), Bytecode::FunctionBlockEnd);
        assert_eq!(seg.entry(0).instruction_count(), 2);
    }

    #[test]
    fn test_handler_interning_deduplicates() {
        // Many cold instructions of the same group share one interned id
        let seg = decode_segment(
            0x1000,
            &[
                asm::rtype(0b011_0011, 1, 0b100, 2, 3, 0b010_0000), // xnor
                asm::rtype(0b011_0011, 4, 0b110, 5, 6, 0b010_0000), // orn
                asm::rtype(0b011_0011, 7, 0b111, 8, 9, 0b010_0000), // andn
                asm::jal(0, 0),
            ],
        );
        let h0 = seg.entry(0).handler;
        let mul = if COMPRESSED_ENABLED { 2 } else { 1 };
        assert_eq!(seg.entry(mul).handler, h0);
        assert_eq!(seg.entry(2 * mul).handler, h0);
    }

    #[test]
    fn test_is_within() {
        let seg = decode_segment(0x1000, &[asm::nop(), asm::jal(0, 0)]);
        assert!(seg.is_within(0x1000));
        assert!(seg.is_within(0x1004));
        assert!(!seg.is_within(0x0FFF));
        assert!(!seg.is_within(0x1008));
    }
}
