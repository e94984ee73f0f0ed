//! Raw encoding classification and operand rewriting.
//!
//! The decoder assigns each instruction a [`Bytecode`] and, for the hot
//! ids, repacks operands into the compact layouts from [`crate::bytecode`].
//! Instructions with no dedicated bytecode keep their original word and
//! run through an interned handler.

use rvsim_isa::{CInstr, Instr, REG_RA, REG_SP};

use crate::bytecode::{Bytecode, ImmPacked, ItypePacked, JtypePacked, MovePacked, OpTypePacked};
use crate::options::{ATOMICS_ENABLED, COMPRESSED_ENABLED, FLOAT_ENABLED, VECTOR_ENABLED};

use rvsim_isa::{
    OPCODE_ATOMIC, OPCODE_AUIPC, OPCODE_BRANCH, OPCODE_FMADD, OPCODE_FMSUB, OPCODE_FNMADD,
    OPCODE_FNMSUB, OPCODE_FP, OPCODE_JAL, OPCODE_JALR, OPCODE_LOAD, OPCODE_LOAD_FP,
    OPCODE_LUI, OPCODE_MISC_MEM, OPCODE_OP, OPCODE_OP32, OPCODE_OP_IMM, OPCODE_OP_IMM32,
    OPCODE_STORE, OPCODE_STORE_FP, OPCODE_SYSTEM,
};

/// PC alignment for jump targets.
pub const PC_ALIGN: u64 = if COMPRESSED_ENABLED { 2 } else { 4 };

/// Bytes covered by one decoder cache slot.
pub const DIVISOR: u64 = if COMPRESSED_ENABLED { 2 } else { 4 };

/// Classify a 32-bit instruction for the given register width.
#[allow(clippy::too_many_lines)]
pub fn bytecode_for(instr: Instr, xlen: u8) -> Bytecode {
    match instr.opcode() {
        OPCODE_LOAD => {
            // Loads into x0 are dummies
            if instr.rd() == 0 {
                return Bytecode::Nop;
            }
            match instr.funct3() {
                0x0 => Bytecode::Ldb,
                0x1 => Bytecode::Ldh,
                0x2 => Bytecode::Ldw,
                0x3 if xlen >= 64 => Bytecode::Ldd,
                0x4 => Bytecode::Ldbu,
                0x5 => Bytecode::Ldhu,
                0x6 if xlen >= 64 => Bytecode::Ldwu,
                _ => Bytecode::Invalid,
            }
        }
        OPCODE_STORE => match instr.funct3() {
            0x0 => Bytecode::Stb,
            0x1 => Bytecode::Sth,
            0x2 => Bytecode::Stw,
            0x3 if xlen >= 64 => Bytecode::Std,
            _ => Bytecode::Invalid,
        },
        OPCODE_BRANCH => match instr.funct3() {
            0x0 => Bytecode::Beq,
            0x1 => Bytecode::Bne,
            0x4 => Bytecode::Blt,
            0x5 => Bytecode::Bge,
            0x6 => Bytecode::Bltu,
            0x7 => Bytecode::Bgeu,
            _ => Bytecode::Invalid,
        },
        OPCODE_LUI => {
            if instr.rd() == 0 {
                Bytecode::Nop
            } else {
                Bytecode::Lui
            }
        }
        OPCODE_AUIPC => {
            if instr.rd() == 0 {
                Bytecode::Nop
            } else {
                Bytecode::Auipc
            }
        }
        OPCODE_JAL => Bytecode::Jal,
        OPCODE_JALR => Bytecode::Jalr,
        OPCODE_OP_IMM => {
            if instr.rd() == 0 {
                return Bytecode::Nop;
            }
            match instr.funct3() {
                0x0 => {
                    if instr.rs1() == 0 {
                        Bytecode::Li
                    } else if instr.i_imm() == 0 {
                        Bytecode::Mv
                    } else {
                        Bytecode::Addi
                    }
                }
                0x1 => {
                    if instr.i_imm_raw() & !0x3F == 0 {
                        Bytecode::Slli
                    } else {
                        Bytecode::Function
                    }
                }
                0x2 => Bytecode::Slti,
                0x3 => Bytecode::Sltiu,
                0x4 => Bytecode::Xori,
                0x5 => {
                    let high = instr.i_imm_raw() & !0x3F;
                    if high == 0 {
                        Bytecode::Srli
                    } else if high == 0x400 {
                        Bytecode::Srai
                    } else {
                        Bytecode::Function
                    }
                }
                0x6 => Bytecode::Ori,
                0x7 => Bytecode::Andi,
                _ => Bytecode::Function,
            }
        }
        OPCODE_OP => {
            if instr.rd() == 0 {
                return Bytecode::Nop;
            }
            match (instr.funct7() << 4) | instr.funct3() {
                0x0 => Bytecode::OpAdd,
                0x200 => Bytecode::OpSub,
                0x1 => Bytecode::OpSll,
                0x2 => Bytecode::OpSlt,
                0x3 => Bytecode::OpSltu,
                0x4 => Bytecode::OpXor,
                0x5 => Bytecode::OpSrl,
                0x6 => Bytecode::OpOr,
                0x7 => Bytecode::OpAnd,
                0x10 => Bytecode::OpMul,
                0x11 => Bytecode::OpMulh,
                0x12 => Bytecode::OpMulhsu,
                0x13 => Bytecode::OpMulhu,
                0x14 => Bytecode::OpDiv,
                0x15 => Bytecode::OpDivu,
                0x16 => Bytecode::OpRem,
                0x17 => Bytecode::OpRemu,
                0x205 => Bytecode::OpSra,
                0x102 => Bytecode::OpSh1add,
                0x104 => Bytecode::OpSh2add,
                0x106 => Bytecode::OpSh3add,
                // Zbb and friends run through handlers
                0x204 | 0x206 | 0x207 | 0x54 | 0x55 | 0x56 | 0x57 | 0x301 | 0x305 => {
                    Bytecode::Function
                }
                _ => Bytecode::Invalid,
            }
        }
        OPCODE_OP32 if xlen >= 64 => {
            if instr.rd() == 0 {
                Bytecode::Nop
            } else {
                Bytecode::Function
            }
        }
        OPCODE_OP_IMM32 if xlen >= 64 => {
            if instr.rd() == 0 {
                Bytecode::Nop
            } else if instr.funct3() == 0x0 {
                Bytecode::Addiw
            } else {
                Bytecode::Function
            }
        }
        OPCODE_SYSTEM => {
            if instr.funct3() == 0 {
                let imm = instr.i_imm_raw();
                if imm == 0 {
                    return Bytecode::Syscall;
                }
                // WFI and the custom stop encoding
                if imm == 0x105 || imm == 0x7FF {
                    return Bytecode::Stop;
                }
            }
            Bytecode::System
        }
        OPCODE_MISC_MEM => Bytecode::Function,
        OPCODE_LOAD_FP if FLOAT_ENABLED => match instr.funct3() {
            0x2 => Bytecode::Flw,
            0x3 => Bytecode::Fld,
            0x6 if VECTOR_ENABLED => Bytecode::Vle32,
            _ => Bytecode::Invalid,
        },
        OPCODE_STORE_FP if FLOAT_ENABLED => match instr.funct3() {
            0x2 => Bytecode::Fsw,
            0x3 => Bytecode::Fsd,
            0x6 if VECTOR_ENABLED => Bytecode::Vse32,
            _ => Bytecode::Invalid,
        },
        OPCODE_FMADD if FLOAT_ENABLED => Bytecode::Fmadd,
        OPCODE_FMSUB | OPCODE_FNMADD | OPCODE_FNMSUB if FLOAT_ENABLED => Bytecode::Function,
        OPCODE_FP if FLOAT_ENABLED => match instr.fpfunc() {
            0b00000 => Bytecode::Fadd,
            0b00001 => Bytecode::Fsub,
            0b00010 => Bytecode::Fmul,
            0b00011 => Bytecode::Fdiv,
            _ => Bytecode::Function,
        },
        0b101_0111 if VECTOR_ENABLED => vector_bytecode(instr),
        OPCODE_ATOMIC if ATOMICS_ENABLED => Bytecode::Function,
        // Unknown instructions can be custom-handled
        _ => Bytecode::Function,
    }
}

fn vector_bytecode(instr: Instr) -> Bytecode {
    // OPVV with funct6 == 0 and funct3 == 1 is VFADD.VV
    if instr.funct3() == 0x1 && (instr.funct7() >> 1) == 0 {
        Bytecode::VfaddVv
    } else {
        Bytecode::Function
    }
}

/// Rewrite a decoded instruction's operand word for the fast path.
///
/// Branch targets leaving the segment, or misaligned, rewrite to
/// `Invalid` so the fault is deferred to runtime. JAL to an in-segment,
/// aligned, below-4GiB target collapses to `FastJal`/`FastCall` with the
/// absolute destination as the operand word. Forward conditional
/// branches get the variants that skip the counter check.
pub fn rewrite(
    bytecode: Bytecode,
    pc: u64,
    exec_begin: u64,
    exec_end: u64,
    instr: Instr,
) -> (Bytecode, u32) {
    let original = instr;
    let in_segment = |addr: u64| addr >= exec_begin && addr + 4 <= exec_end;

    match bytecode {
        Bytecode::Mv => {
            let packed = MovePacked::pack(original.rd(), original.rs1());
            (bytecode, packed.0)
        }
        Bytecode::Li => (bytecode, ImmPacked::pack(original.rd(), original.i_imm()).0),
        Bytecode::Addi
        | Bytecode::Addiw
        | Bytecode::Slli
        | Bytecode::Slti
        | Bytecode::Sltiu
        | Bytecode::Xori
        | Bytecode::Srli
        | Bytecode::Srai
        | Bytecode::Ori
        | Bytecode::Andi => {
            let packed = ItypePacked::pack(original.rd(), original.rs1(), original.i_imm());
            (bytecode, packed.0)
        }
        Bytecode::Beq
        | Bytecode::Bne
        | Bytecode::Blt
        | Bytecode::Bge
        | Bytecode::Bltu
        | Bytecode::Bgeu => {
            let imm = original.b_imm();
            let target = pc.wrapping_add_signed(imm as i64);

            if !in_segment(target) || target % PC_ALIGN != 0 {
                // Out-of-bounds or misaligned branch targets fault at
                // runtime through the Invalid bytecode
                return (Bytecode::Invalid, original.0);
            }

            let packed = ItypePacked::pack(original.rs1(), original.rs2(), imm);

            // Forward branches can skip the counter check
            if imm > 0 && bytecode == Bytecode::Beq {
                return (Bytecode::BeqFw, packed.0);
            }
            if imm > 0 && bytecode == Bytecode::Bne {
                return (Bytecode::BneFw, packed.0);
            }
            (bytecode, packed.0)
        }
        Bytecode::OpAdd
        | Bytecode::OpSub
        | Bytecode::OpSll
        | Bytecode::OpSlt
        | Bytecode::OpSltu
        | Bytecode::OpXor
        | Bytecode::OpSrl
        | Bytecode::OpSra
        | Bytecode::OpOr
        | Bytecode::OpAnd
        | Bytecode::OpMul
        | Bytecode::OpMulh
        | Bytecode::OpMulhsu
        | Bytecode::OpMulhu
        | Bytecode::OpDiv
        | Bytecode::OpDivu
        | Bytecode::OpRem
        | Bytecode::OpRemu
        | Bytecode::OpSh1add
        | Bytecode::OpSh2add
        | Bytecode::OpSh3add => {
            let packed = OpTypePacked::pack(original.rd(), original.rs1(), original.rs2());
            (bytecode, packed.0)
        }
        Bytecode::Ldb
        | Bytecode::Ldbu
        | Bytecode::Ldh
        | Bytecode::Ldhu
        | Bytecode::Ldw
        | Bytecode::Ldwu
        | Bytecode::Ldd => {
            let packed = ItypePacked::pack(original.rd(), original.rs1(), original.i_imm());
            (bytecode, packed.0)
        }
        Bytecode::Stb | Bytecode::Sth | Bytecode::Stw | Bytecode::Std => {
            let packed = ItypePacked::pack(original.rs1(), original.rs2(), original.s_imm());
            (bytecode, packed.0)
        }
        Bytecode::Jal => {
            // The whole jump may be expressible as just the target word
            let offset = original.j_imm();
            let target = pc.wrapping_add_signed(offset as i64);
            let is_aligned = target % PC_ALIGN == 0;
            let below32 = target < u64::from(u32::MAX);
            let rd = original.rd();

            if in_segment(target) && is_aligned && below32 {
                if rd == 0 {
                    return (Bytecode::FastJal, target as u32);
                }
                if rd == REG_RA {
                    return (Bytecode::FastCall, target as u32);
                }
            }
            (bytecode, JtypePacked::pack(offset, rd).0)
        }
        _ => (bytecode, original.0),
    }
}

/// Classify a 16-bit compressed instruction.
///
/// The hot quadrant-1 arithmetic forms get dedicated bytecodes with
/// rewritten operands; jumps go through the generic jump handler and the
/// rest through plain handlers.
#[allow(clippy::too_many_lines)]
pub fn bytecode_for_compressed(ci: CInstr, xlen: u8) -> Bytecode {
    if !COMPRESSED_ENABLED {
        return Bytecode::Invalid;
    }
    match (ci.funct3(), ci.quadrant()) {
        (0b000, 0b00) => {
            // All-zero is the canonical illegal instruction
            if ci.0 == 0 {
                Bytecode::Invalid
            } else {
                Bytecode::CAddi // C.ADDI4SPN
            }
        }
        (0b001, 0b00) | (0b010, 0b00) => Bytecode::CFunction, // C.FLD / C.LW
        (0b011, 0b00) => {
            if xlen >= 64 {
                Bytecode::CLdd // C.LD
            } else {
                Bytecode::CFunction // C.FLW
            }
        }
        (0b101, 0b00) | (0b110, 0b00) => Bytecode::CFunction, // C.FSD / C.SW
        (0b111, 0b00) => {
            if xlen >= 64 {
                Bytecode::CStd // C.SD
            } else {
                Bytecode::CFunction // C.FSW
            }
        }
        (0b000, 0b01) => {
            if ci.rd() != 0 {
                Bytecode::CAddi // C.ADDI
            } else {
                Bytecode::CFunction // C.NOP
            }
        }
        (0b001, 0b01) => {
            if xlen >= 64 {
                Bytecode::CFunction // C.ADDIW
            } else {
                Bytecode::CJumpFunction // C.JAL
            }
        }
        (0b010, 0b01) => {
            if ci.rd() != 0 {
                Bytecode::CAddi // C.LI
            } else {
                Bytecode::CFunction
            }
        }
        (0b011, 0b01) => {
            if ci.rd() == REG_SP {
                Bytecode::CAddi // C.ADDI16SP
            } else {
                Bytecode::CFunction // C.LUI
            }
        }
        (0b100, 0b01) => Bytecode::CFunction, // shifts, ANDI, register ops
        (0b101, 0b01) => Bytecode::CJumpFunction, // C.J
        (0b110, 0b01) => Bytecode::CJumpFunction, // C.BEQZ
        (0b111, 0b01) => Bytecode::CBnez,     // C.BNEZ
        (0b000, 0b10) | (0b001, 0b10) | (0b010, 0b10) => Bytecode::CFunction,
        (0b011, 0b10) => {
            if xlen >= 64 {
                Bytecode::CLdd // C.LDSP
            } else {
                Bytecode::CFunction // C.FLWSP
            }
        }
        (0b100, 0b10) => {
            let topbit = ci.0 & (1 << 12) != 0;
            if !topbit && ci.rd() != 0 && ci.rs2() == 0 {
                Bytecode::CJumpFunction // C.JR
            } else if topbit && ci.rd() != 0 && ci.rs2() == 0 {
                Bytecode::CJumpFunction // C.JALR
            } else if !topbit && ci.rd() != 0 && ci.rs2() != 0 {
                Bytecode::CMv
            } else {
                Bytecode::CFunction // C.ADD / C.EBREAK
            }
        }
        (0b101, 0b10) | (0b110, 0b10) => Bytecode::CFunction, // C.FSDSP / C.SWSP
        (0b111, 0b10) => {
            if xlen >= 64 {
                Bytecode::CStd // C.SDSP
            } else {
                Bytecode::CFunction // C.FSWSP
            }
        }
        _ => Bytecode::CFunction,
    }
}

/// Rewrite operands for the compressed fast-path bytecodes.
pub fn rewrite_compressed(
    bytecode: Bytecode,
    pc: u64,
    exec_begin: u64,
    exec_end: u64,
    ci: CInstr,
) -> (Bytecode, u32) {
    match bytecode {
        Bytecode::CAddi => {
            let packed = if (ci.funct3(), ci.quadrant()) == (0b000, 0b00) {
                // C.ADDI4SPN: rd' = sp + nzuimm
                ItypePacked::pack(ci.rd_short(), REG_SP, ci.ciw_imm() as i32)
            } else if (ci.funct3(), ci.quadrant()) == (0b011, 0b01) {
                // C.ADDI16SP
                ItypePacked::pack(REG_SP, REG_SP, ci.ci16_imm())
            } else if (ci.funct3(), ci.quadrant()) == (0b010, 0b01) {
                // C.LI: rd = x0 + imm
                ItypePacked::pack(ci.rd(), 0, ci.ci_imm())
            } else {
                // C.ADDI
                ItypePacked::pack(ci.rd(), ci.rd(), ci.ci_imm())
            };
            (bytecode, packed.0)
        }
        Bytecode::CMv => (bytecode, MovePacked::pack(ci.rd(), ci.rs2()).0),
        Bytecode::CBnez => {
            let imm = ci.cb_imm();
            let target = pc.wrapping_add_signed(imm as i64);
            if target < exec_begin || target + 4 > exec_end || target % PC_ALIGN != 0 {
                return (Bytecode::Invalid, u32::from(ci.0));
            }
            (bytecode, ItypePacked::pack(ci.rs1_short(), 0, imm).0)
        }
        Bytecode::CLdd => {
            let packed = if ci.quadrant() == 0b00 {
                // C.LD
                ItypePacked::pack(ci.rd_short(), ci.rs1_short(), ci.cl_imm_d() as i32)
            } else {
                // C.LDSP
                ItypePacked::pack(ci.rd(), REG_SP, ci.ci_ldsp_imm() as i32)
            };
            (bytecode, packed.0)
        }
        Bytecode::CStd => {
            let packed = if ci.quadrant() == 0b00 {
                // C.SD: base rs1', source rs2'
                ItypePacked::pack(ci.rs1_short(), ci.rd_short(), ci.cl_imm_d() as i32)
            } else {
                // C.SDSP: base sp, source rs2
                ItypePacked::pack(REG_SP, ci.rs2(), ci.css_sdsp_imm() as i32)
            };
            (bytecode, packed.0)
        }
        _ => (bytecode, u32::from(ci.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvsim_isa::asm;

    #[test]
    fn test_classify_op_imm() {
        assert_eq!(bytecode_for(Instr(asm::addi(1, 2, 5)), 64), Bytecode::Addi);
        // rs1 == x0 makes it a load-immediate
        assert_eq!(bytecode_for(Instr(asm::addi(1, 0, 5)), 64), Bytecode::Li);
        // zero immediate makes it a move
        assert_eq!(bytecode_for(Instr(asm::addi(1, 2, 0)), 64), Bytecode::Mv);
        // rd == x0 folds to NOP
        assert_eq!(bytecode_for(Instr(asm::addi(0, 2, 5)), 64), Bytecode::Nop);
    }

    #[test]
    fn test_classify_shifts() {
        assert_eq!(bytecode_for(Instr(asm::slli(1, 2, 13)), 64), Bytecode::Slli);
        assert_eq!(bytecode_for(Instr(asm::srli(1, 2, 13)), 64), Bytecode::Srli);
        assert_eq!(bytecode_for(Instr(asm::srai(1, 2, 13)), 64), Bytecode::Srai);
    }

    #[test]
    fn test_classify_loads_by_width() {
        assert_eq!(bytecode_for(Instr(asm::ld(1, 2, 0)), 64), Bytecode::Ldd);
        // LD is not a valid RV32 encoding
        assert_eq!(bytecode_for(Instr(asm::ld(1, 2, 0)), 32), Bytecode::Invalid);
        assert_eq!(bytecode_for(Instr(asm::lw(0, 2, 0)), 64), Bytecode::Nop);
    }

    #[test]
    fn test_classify_system() {
        assert_eq!(bytecode_for(Instr(asm::ecall()), 64), Bytecode::Syscall);
        assert_eq!(bytecode_for(Instr(asm::wfi()), 64), Bytecode::Stop);
        assert_eq!(bytecode_for(Instr(asm::ebreak()), 64), Bytecode::System);
    }

    #[test]
    fn test_rewrite_branch_out_of_segment() {
        let pc = 0x1000;
        let raw = Instr(asm::beq(1, 2, 0x800));
        let bc = bytecode_for(raw, 64);
        // Target 0x1800 is outside [0x1000, 0x1100): rewritten to Invalid
        let (bc, _) = rewrite(bc, pc, 0x1000, 0x1100, raw);
        assert_eq!(bc, Bytecode::Invalid);
    }

    #[test]
    fn test_rewrite_forward_branch() {
        let raw = Instr(asm::beq(1, 2, 8));
        let (bc, word) = rewrite(Bytecode::Beq, 0x1000, 0x1000, 0x2000, raw);
        assert_eq!(bc, Bytecode::BeqFw);
        let packed = ItypePacked(word);
        assert_eq!(packed.rs1(), 1);
        assert_eq!(packed.rs2(), 2);
        assert_eq!(packed.signed_imm(), 8);

        // Backward branches keep the checked variant
        let raw = Instr(asm::bne(1, 2, -8));
        let (bc, _) = rewrite(Bytecode::Bne, 0x1010, 0x1000, 0x2000, raw);
        assert_eq!(bc, Bytecode::Bne);
    }

    #[test]
    fn test_rewrite_fast_jal() {
        // jal x0, +16 inside the segment becomes FastJal with an
        // absolute target word
        let raw = Instr(asm::jal(0, 16));
        let (bc, word) = rewrite(Bytecode::Jal, 0x1000, 0x1000, 0x2000, raw);
        assert_eq!(bc, Bytecode::FastJal);
        assert_eq!(word, 0x1010);

        // Linking through ra becomes FastCall
        let raw = Instr(asm::jal(REG_RA, 16));
        let (bc, word) = rewrite(Bytecode::Jal, 0x1000, 0x1000, 0x2000, raw);
        assert_eq!(bc, Bytecode::FastCall);
        assert_eq!(word, 0x1010);

        // Other link registers degrade to the generic JAL
        let raw = Instr(asm::jal(5, 16));
        let (bc, word) = rewrite(Bytecode::Jal, 0x1000, 0x1000, 0x2000, raw);
        assert_eq!(bc, Bytecode::Jal);
        let packed = JtypePacked(word);
        assert_eq!(packed.rd(), 5);
        assert_eq!(packed.offset(), 16);

        // Out-of-segment targets also stay generic
        let raw = Instr(asm::jal(0, 0x4000));
        let (bc, _) = rewrite(Bytecode::Jal, 0x1000, 0x1000, 0x2000, raw);
        assert_eq!(bc, Bytecode::Jal);
    }

    #[test]
    fn test_rewrite_store_operands() {
        let raw = Instr(asm::sw(2, 3, -4));
        let (_, word) = rewrite(Bytecode::Stw, 0, 0, 0x1000, raw);
        let packed = ItypePacked(word);
        assert_eq!(packed.rs1(), 2);
        assert_eq!(packed.rs2(), 3);
        assert_eq!(packed.signed_imm(), -4);
    }
}
