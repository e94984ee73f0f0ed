//! Instruction semantics.
//!
//! `execute_instr`/`execute_compressed` form a complete one-instruction
//! interpreter used by `step_one`, by forced block terminators and as
//! the golden reference the dispatch modes are tested against. The
//! `handler_*` functions are the interned entry points the decoder
//! assigns to instructions without a dedicated bytecode.

use rvsim_isa::{
    CInstr, Instr, Rv32, Xlen, OPCODE_ATOMIC, OPCODE_AUIPC, OPCODE_BRANCH, OPCODE_FMADD,
    OPCODE_FMSUB, OPCODE_FNMADD, OPCODE_FNMSUB, OPCODE_FP, OPCODE_JAL, OPCODE_JALR, OPCODE_LOAD,
    OPCODE_LOAD_FP, OPCODE_LUI, OPCODE_MISC_MEM, OPCODE_OP, OPCODE_OP32, OPCODE_OP_IMM,
    OPCODE_OP_IMM32, OPCODE_STORE, OPCODE_STORE_FP, OPCODE_SYSTEM, REG_RA, REG_SP,
};

use crate::bytecode::Bytecode;
use crate::error::{MachineError, Result};
use crate::machine::Machine;
use crate::options::{ATOMICS_ENABLED, COMPRESSED_ENABLED, FLOAT_ENABLED, VECTOR_ENABLED};
use crate::segment::InstrHandler;
use crate::syscalls::SYSCALL_EBREAK;

/// NaN-box a raw f32 bit pattern.
const NAN_BOX: u64 = 0xFFFF_FFFF_0000_0000;

/// Pick the interned handler for a cold 32-bit instruction.
pub(crate) fn select_handler<X: Xlen>(instr: Instr) -> InstrHandler<X> {
    match instr.opcode() {
        OPCODE_OP => handler_op::<X>,
        OPCODE_OP_IMM => handler_op_imm::<X>,
        OPCODE_OP32 if X::VALUE >= 64 => handler_op32::<X>,
        OPCODE_OP_IMM32 if X::VALUE >= 64 => handler_op_imm32::<X>,
        OPCODE_ATOMIC if ATOMICS_ENABLED => handler_atomic::<X>,
        OPCODE_FP if FLOAT_ENABLED => handler_fp::<X>,
        OPCODE_FMSUB | OPCODE_FNMADD | OPCODE_FNMSUB if FLOAT_ENABLED => handler_fp_fused::<X>,
        OPCODE_MISC_MEM => handler_fence::<X>,
        _ => handler_unimplemented::<X>,
    }
}

/// Pick the interned handler for a compressed fallback bytecode.
pub(crate) fn select_compressed<X: Xlen>(bytecode: Bytecode) -> InstrHandler<X> {
    match bytecode {
        Bytecode::CJumpFunction => handler_compressed_jump::<X>,
        _ => handler_compressed::<X>,
    }
}

/// Generic executor for forced block terminators: runs any straight-line
/// instruction; the dispatcher advances the PC afterwards.
pub(crate) fn handler_any<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    if COMPRESSED_ENABLED && instr.length() == 2 {
        execute_compressed(m, CInstr(instr.0 as u16), pc)?;
    } else {
        execute_instr(m, instr, pc)?;
    }
    Ok(())
}

fn handler_op<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    exec_op(m, instr, pc)
}

fn handler_op_imm<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    exec_op_imm(m, instr, pc)
}

fn handler_op32<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    exec_op32(m, instr, pc)
}

fn handler_op_imm32<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    exec_op_imm32(m, instr, pc)
}

fn handler_atomic<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    exec_atomic(m, instr, pc)
}

fn handler_fp<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    exec_fp(m, instr, pc)
}

fn handler_fp_fused<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    exec_fp_fused(m, instr, pc)
}

fn handler_fence<X: Xlen>(_m: &mut Machine<X>, instr: Instr, _pc: u64) -> Result<()> {
    // FENCE is a full host-level barrier; FENCE.I has nothing to flush
    if instr.funct3() == 0 {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
    Ok(())
}

fn handler_unimplemented<X: Xlen>(_m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 })
}

fn handler_compressed<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    execute_compressed(m, CInstr(instr.0 as u16), pc)?;
    Ok(())
}

/// Compressed jumps: execute and publish the target through the PC so
/// the dispatcher can re-enter block accounting.
fn handler_compressed_jump<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let next = execute_compressed(m, CInstr(instr.0 as u16), pc)?;
    m.cpu.pc = next;
    Ok(())
}

/// Execute one 32-bit instruction at `pc`, returning the next PC.
///
/// This is the complete slow-path interpreter: every implemented
/// instruction has semantics here, independent of the bytecode layer.
pub(crate) fn execute_instr<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<u64> {
    let next = pc + 4;
    match instr.opcode() {
        OPCODE_LUI => {
            m.cpu
                .set_reg(instr.rd(), X::sign_extend_32(instr.u_imm() as u32));
            Ok(next)
        }
        OPCODE_AUIPC => {
            let value = X::add_imm(X::from_u64(pc), instr.u_imm());
            m.cpu.set_reg(instr.rd(), value);
            Ok(next)
        }
        OPCODE_JAL => {
            m.cpu.set_reg(instr.rd(), X::from_u64(next));
            Ok(pc.wrapping_add_signed(instr.j_imm() as i64))
        }
        OPCODE_JALR => {
            let target = X::to_u64(X::add_imm(m.cpu.reg(instr.rs1()), instr.i_imm()));
            m.cpu.set_reg(instr.rd(), X::from_u64(next));
            Ok(target)
        }
        OPCODE_BRANCH => {
            let a = m.cpu.reg(instr.rs1());
            let b = m.cpu.reg(instr.rs2());
            let taken = match instr.funct3() {
                0x0 => a == b,
                0x1 => a != b,
                0x4 => X::lt_signed(a, b),
                0x5 => !X::lt_signed(a, b),
                0x6 => X::to_u64(a) < X::to_u64(b),
                0x7 => X::to_u64(a) >= X::to_u64(b),
                _ => return Err(MachineError::IllegalOpcode { pc, instr: instr.0 }),
            };
            if taken {
                Ok(pc.wrapping_add_signed(instr.b_imm() as i64))
            } else {
                Ok(next)
            }
        }
        OPCODE_LOAD => {
            exec_load(m, instr, pc)?;
            Ok(next)
        }
        OPCODE_STORE => {
            exec_store(m, instr, pc)?;
            Ok(next)
        }
        OPCODE_OP_IMM => {
            exec_op_imm(m, instr, pc)?;
            Ok(next)
        }
        OPCODE_OP => {
            exec_op(m, instr, pc)?;
            Ok(next)
        }
        OPCODE_OP_IMM32 if X::VALUE >= 64 => {
            exec_op_imm32(m, instr, pc)?;
            Ok(next)
        }
        OPCODE_OP32 if X::VALUE >= 64 => {
            exec_op32(m, instr, pc)?;
            Ok(next)
        }
        OPCODE_MISC_MEM => {
            handler_fence(m, instr, pc)?;
            Ok(next)
        }
        OPCODE_SYSTEM => exec_system(m, instr, pc),
        OPCODE_ATOMIC if ATOMICS_ENABLED => {
            exec_atomic(m, instr, pc)?;
            Ok(next)
        }
        OPCODE_LOAD_FP if FLOAT_ENABLED || VECTOR_ENABLED => {
            exec_fp_load(m, instr, pc)?;
            Ok(next)
        }
        OPCODE_STORE_FP if FLOAT_ENABLED || VECTOR_ENABLED => {
            exec_fp_store(m, instr, pc)?;
            Ok(next)
        }
        OPCODE_FP if FLOAT_ENABLED => {
            exec_fp(m, instr, pc)?;
            Ok(next)
        }
        OPCODE_FMADD | OPCODE_FMSUB | OPCODE_FNMADD | OPCODE_FNMSUB if FLOAT_ENABLED => {
            exec_fp_fused(m, instr, pc)?;
            Ok(next)
        }
        0b101_0111 if VECTOR_ENABLED => {
            exec_vector_op(m, instr, pc)?;
            Ok(next)
        }
        _ => Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    }
}

fn exec_load<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let addr = X::to_u64(X::add_imm(m.cpu.reg(instr.rs1()), instr.i_imm()));
    let value = match instr.funct3() {
        0x0 => X::from_i64(i64::from(m.memory.read::<u8>(addr)?.cast_signed())),
        0x1 => X::from_i64(i64::from(m.memory.read::<u16>(addr)?.cast_signed())),
        0x2 => X::sign_extend_32(m.memory.read::<u32>(addr)?),
        0x3 if X::VALUE >= 64 => X::from_u64(m.memory.read::<u64>(addr)?),
        0x4 => X::from_u64(u64::from(m.memory.read::<u8>(addr)?)),
        0x5 => X::from_u64(u64::from(m.memory.read::<u16>(addr)?)),
        0x6 if X::VALUE >= 64 => X::from_u64(u64::from(m.memory.read::<u32>(addr)?)),
        _ => return Err(MachineError::IllegalOpcode { pc, instr: instr.0 }),
    };
    m.cpu.set_reg(instr.rd(), value);
    Ok(())
}

fn exec_store<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let addr = X::to_u64(X::add_imm(m.cpu.reg(instr.rs1()), instr.s_imm()));
    let value = m.cpu.reg(instr.rs2());
    match instr.funct3() {
        0x0 => m.memory.write::<u8>(addr, X::to_u64(value) as u8)?,
        0x1 => m.memory.write::<u16>(addr, X::to_u64(value) as u16)?,
        0x2 => m.memory.write::<u32>(addr, X::truncate_to_32(value))?,
        0x3 if X::VALUE >= 64 => m.memory.write::<u64>(addr, X::to_u64(value))?,
        _ => return Err(MachineError::IllegalOpcode { pc, instr: instr.0 }),
    }
    Ok(())
}

fn exec_op_imm<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let a = m.cpu.reg(instr.rs1());
    let imm = instr.i_imm();
    let value = match instr.funct3() {
        0x0 => X::add_imm(a, imm),
        0x1 => {
            if instr.i_imm_raw() & !0x3F != 0 {
                return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 });
            }
            X::shl(a, instr.i_imm_raw() & X::SHIFT_MASK)
        }
        0x2 => X::from_u64(u64::from(X::lt_signed(a, X::from_i64(i64::from(imm))))),
        0x3 => X::from_u64(u64::from(X::to_u64(a) < X::to_u64(X::from_i64(i64::from(imm))))),
        0x4 => a ^ X::from_i64(i64::from(imm)),
        0x5 => {
            let shamt = instr.i_imm_raw() & X::SHIFT_MASK;
            match instr.i_imm_raw() & !0x3F {
                0x000 => X::shr(a, shamt),
                0x400 => X::sra(a, shamt),
                _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
            }
        }
        0x6 => a | X::from_i64(i64::from(imm)),
        0x7 => a & X::from_i64(i64::from(imm)),
        _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    };
    m.cpu.set_reg(instr.rd(), value);
    Ok(())
}

fn exec_op<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let a = m.cpu.reg(instr.rs1());
    let b = m.cpu.reg(instr.rs2());
    let sh = (X::to_u64(b) as u32) & X::SHIFT_MASK;
    let value = match (instr.funct7() << 4) | instr.funct3() {
        0x0 => X::wrapping_add(a, b),
        0x200 => X::wrapping_sub(a, b),
        0x1 => X::shl(a, sh),
        0x2 => X::from_u64(u64::from(X::lt_signed(a, b))),
        0x3 => X::from_u64(u64::from(X::to_u64(a) < X::to_u64(b))),
        0x4 => a ^ b,
        0x5 => X::shr(a, sh),
        0x205 => X::sra(a, sh),
        0x6 => a | b,
        0x7 => a & b,
        0x10 => X::mul(a, b),
        0x11 => X::mulh(a, b),
        0x12 => X::mulhsu(a, b),
        0x13 => X::mulhu(a, b),
        0x14 => X::div(a, b),
        0x15 => X::divu(a, b),
        0x16 => X::rem(a, b),
        0x17 => X::remu(a, b),
        0x102 => X::wrapping_add(X::shl(a, 1), b),
        0x104 => X::wrapping_add(X::shl(a, 2), b),
        0x106 => X::wrapping_add(X::shl(a, 3), b),
        0x204 => !(a ^ b),
        0x206 => a | !b,
        0x207 => a & !b,
        0x54 => {
            if X::lt_signed(a, b) {
                a
            } else {
                b
            }
        }
        0x55 => {
            if X::to_u64(a) < X::to_u64(b) {
                a
            } else {
                b
            }
        }
        0x56 => {
            if X::lt_signed(a, b) {
                b
            } else {
                a
            }
        }
        0x57 => {
            if X::to_u64(a) < X::to_u64(b) {
                b
            } else {
                a
            }
        }
        0x301 => rotate_left::<X>(a, sh),
        0x305 => rotate_right::<X>(a, sh),
        _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    };
    m.cpu.set_reg(instr.rd(), value);
    Ok(())
}

fn exec_op_imm32<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let a = X::truncate_to_32(m.cpu.reg(instr.rs1()));
    let value = match instr.funct3() {
        0x0 => a.wrapping_add_signed(instr.i_imm()),
        0x1 => {
            if instr.i_imm_raw() & !0x1F != 0 {
                return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 });
            }
            a.wrapping_shl(instr.i_imm_raw() & 0x1F)
        }
        0x5 => {
            let shamt = instr.i_imm_raw() & 0x1F;
            match instr.i_imm_raw() & !0x1F {
                0x000 => a.wrapping_shr(shamt),
                0x400 => Rv32::sra(a, shamt),
                _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
            }
        }
        _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    };
    m.cpu.set_reg(instr.rd(), X::sign_extend_32(value));
    Ok(())
}

fn exec_op32<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let a = X::truncate_to_32(m.cpu.reg(instr.rs1()));
    let b = X::truncate_to_32(m.cpu.reg(instr.rs2()));
    let value = match (instr.funct7() << 4) | instr.funct3() {
        0x0 => a.wrapping_add(b),
        0x200 => a.wrapping_sub(b),
        0x1 => a.wrapping_shl(b & 0x1F),
        0x5 => a.wrapping_shr(b & 0x1F),
        0x205 => Rv32::sra(a, b & 0x1F),
        0x10 => a.wrapping_mul(b),
        0x14 => Rv32::div(a, b),
        0x15 => Rv32::divu(a, b),
        0x16 => Rv32::rem(a, b),
        0x17 => Rv32::remu(a, b),
        _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    };
    m.cpu.set_reg(instr.rd(), X::sign_extend_32(value));
    Ok(())
}

fn exec_atomic<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let funct5 = instr.funct7() >> 2;
    let addr = X::to_u64(m.cpu.reg(instr.rs1()));
    let wide = match instr.funct3() {
        0x2 => false,
        0x3 if X::VALUE >= 64 => true,
        _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    };
    let size = if wide { 8 } else { 4 };
    if addr % size != 0 {
        return Err(MachineError::InvalidAlignment(addr));
    }

    // LR establishes the reservation, SC consumes it
    if funct5 == 0x02 {
        let value = if wide {
            X::from_u64(m.memory.read::<u64>(addr)?)
        } else {
            X::sign_extend_32(m.memory.read::<u32>(addr)?)
        };
        m.cpu.reservation = Some(addr);
        m.cpu.set_reg(instr.rd(), value);
        return Ok(());
    }
    if funct5 == 0x03 {
        let success = m.cpu.reservation == Some(addr);
        m.cpu.reservation = None;
        if success {
            let src = m.cpu.reg(instr.rs2());
            if wide {
                m.memory.write::<u64>(addr, X::to_u64(src))?;
            } else {
                m.memory.write::<u32>(addr, X::truncate_to_32(src))?;
            }
        }
        m.cpu.set_reg(instr.rd(), X::from_u64(u64::from(!success)));
        return Ok(());
    }

    let old = if wide {
        X::from_u64(m.memory.read::<u64>(addr)?)
    } else {
        X::sign_extend_32(m.memory.read::<u32>(addr)?)
    };
    let src = m.cpu.reg(instr.rs2());
    let new = match funct5 {
        0x01 => src,                          // amoswap
        0x00 => X::wrapping_add(old, src),    // amoadd
        0x04 => old ^ src,                    // amoxor
        0x0C => old & src,                    // amoand
        0x08 => old | src,                    // amoor
        0x10 => {
            if X::lt_signed(old, src) {
                old
            } else {
                src
            }
        }
        0x14 => {
            if X::lt_signed(old, src) {
                src
            } else {
                old
            }
        }
        0x18 => {
            if X::to_u64(old) < X::to_u64(src) {
                old
            } else {
                src
            }
        }
        0x1C => {
            if X::to_u64(old) < X::to_u64(src) {
                src
            } else {
                old
            }
        }
        _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    };
    if wide {
        m.memory.write::<u64>(addr, X::to_u64(new))?;
    } else {
        m.memory.write::<u32>(addr, X::truncate_to_32(new))?;
    }
    m.cpu.set_reg(instr.rd(), old);
    Ok(())
}

pub(crate) fn exec_fp_load<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let addr = X::to_u64(X::add_imm(m.cpu.reg(instr.rs1()), instr.i_imm()));
    match instr.funct3() {
        0x2 if FLOAT_ENABLED => {
            let bits = m.memory.read::<u32>(addr)?;
            m.cpu.fregs[instr.rd()].0 = u64::from(bits) | NAN_BOX;
        }
        0x3 if FLOAT_ENABLED => {
            m.cpu.fregs[instr.rd()].0 = m.memory.read::<u64>(addr)?;
        }
        0x6 if VECTOR_ENABLED => {
            let base = X::to_u64(m.cpu.reg(instr.rs1()));
            let mut lane = [0u8; 16];
            m.memory.read_into(base, &mut lane)?;
            m.cpu.vregs[instr.rd()] = lane;
        }
        _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    }
    Ok(())
}

pub(crate) fn exec_fp_store<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let addr = X::to_u64(X::add_imm(m.cpu.reg(instr.rs1()), instr.s_imm()));
    match instr.funct3() {
        0x2 if FLOAT_ENABLED => {
            m.memory
                .write::<u32>(addr, m.cpu.fregs[instr.rs2()].0 as u32)?;
        }
        0x3 if FLOAT_ENABLED => {
            m.memory.write::<u64>(addr, m.cpu.fregs[instr.rs2()].0)?;
        }
        0x6 if VECTOR_ENABLED => {
            let base = X::to_u64(m.cpu.reg(instr.rs1()));
            let lane = m.cpu.vregs[instr.rs2()];
            m.memory.write_from(base, &lane)?;
        }
        _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    }
    Ok(())
}

pub(crate) fn exec_vector_op<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    // VFADD.VV over four f32 lanes; everything else is unimplemented
    if instr.funct3() == 0x1 && (instr.funct7() >> 1) == 0 {
        let vs1 = m.cpu.vregs[instr.rs1()];
        let vs2 = m.cpu.vregs[instr.rs2()];
        let mut out = [0u8; 16];
        for lane in 0..4 {
            let a = f32::from_le_bytes(vs2[lane * 4..lane * 4 + 4].try_into().unwrap());
            let b = f32::from_le_bytes(vs1[lane * 4..lane * 4 + 4].try_into().unwrap());
            out[lane * 4..lane * 4 + 4].copy_from_slice(&(a + b).to_le_bytes());
        }
        m.cpu.vregs[instr.rd()] = out;
        return Ok(());
    }
    Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 })
}

pub(crate) fn exec_fp<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let double = instr.fpfmt() == 1;
    let (fd, f1, f2) = (instr.rd(), instr.rs1(), instr.rs2());

    macro_rules! binop {
        ($op:tt) => {
            if double {
                let v = m.cpu.fregs[f1].get_f64() $op m.cpu.fregs[f2].get_f64();
                m.cpu.fregs[fd].set_f64(v);
            } else {
                let v = m.cpu.fregs[f1].get_f32() $op m.cpu.fregs[f2].get_f32();
                m.cpu.fregs[fd].set_f32(v);
            }
        };
    }

    match instr.fpfunc() {
        0b00000 => binop!(+),
        0b00001 => binop!(-),
        0b00010 => binop!(*),
        0b00011 => binop!(/),
        0b01011 => {
            // fsqrt
            if double {
                let v = m.cpu.fregs[f1].get_f64().sqrt();
                m.cpu.fregs[fd].set_f64(v);
            } else {
                let v = m.cpu.fregs[f1].get_f32().sqrt();
                m.cpu.fregs[fd].set_f32(v);
            }
        }
        0b00100 => {
            // sign injection on the raw bit patterns
            let (sign_mask, rest_mask) = if double {
                (1u64 << 63, !(1u64 << 63))
            } else {
                (1u64 << 31, (1u64 << 31) - 1)
            };
            let a = m.cpu.fregs[f1].0;
            let b = m.cpu.fregs[f2].0;
            let sign = match instr.funct3() {
                0x0 => b & sign_mask,
                0x1 => !b & sign_mask,
                0x2 => (a ^ b) & sign_mask,
                _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
            };
            let bits = (a & rest_mask) | sign;
            m.cpu.fregs[fd].0 = if double { bits } else { bits | NAN_BOX };
        }
        0b00101 => {
            // fmin / fmax
            if double {
                let (a, b) = (m.cpu.fregs[f1].get_f64(), m.cpu.fregs[f2].get_f64());
                let v = if instr.funct3() == 0 { a.min(b) } else { a.max(b) };
                m.cpu.fregs[fd].set_f64(v);
            } else {
                let (a, b) = (m.cpu.fregs[f1].get_f32(), m.cpu.fregs[f2].get_f32());
                let v = if instr.funct3() == 0 { a.min(b) } else { a.max(b) };
                m.cpu.fregs[fd].set_f32(v);
            }
        }
        0b01000 => {
            // fcvt.s.d / fcvt.d.s
            if double {
                let v = f64::from(m.cpu.fregs[f1].get_f32());
                m.cpu.fregs[fd].set_f64(v);
            } else {
                let v = m.cpu.fregs[f1].get_f64() as f32;
                m.cpu.fregs[fd].set_f32(v);
            }
        }
        0b10100 => {
            // comparisons write an integer register
            let result = if double {
                let (a, b) = (m.cpu.fregs[f1].get_f64(), m.cpu.fregs[f2].get_f64());
                match instr.funct3() {
                    0x2 => a == b,
                    0x1 => a < b,
                    0x0 => a <= b,
                    _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
                }
            } else {
                let (a, b) = (m.cpu.fregs[f1].get_f32(), m.cpu.fregs[f2].get_f32());
                match instr.funct3() {
                    0x2 => a == b,
                    0x1 => a < b,
                    0x0 => a <= b,
                    _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
                }
            };
            m.cpu.set_reg(fd, X::from_u64(u64::from(result)));
        }
        0b11000 => {
            // fcvt to integer, saturating with NaN going to the maximum
            let value = if double {
                fcvt_from_f64::<X>(m.cpu.fregs[f1].get_f64(), f2, pc, instr)?
            } else {
                fcvt_from_f64::<X>(f64::from(m.cpu.fregs[f1].get_f32()), f2, pc, instr)?
            };
            m.cpu.set_reg(fd, value);
        }
        0b11010 => {
            // fcvt from integer
            let a = m.cpu.reg(f1);
            let v = match f2 {
                0 => f64::from(X::truncate_to_32(a).cast_signed()),
                1 => f64::from(X::truncate_to_32(a)),
                2 if X::VALUE >= 64 => X::to_i64(a) as f64,
                3 if X::VALUE >= 64 => X::to_u64(a) as f64,
                _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
            };
            if double {
                m.cpu.fregs[fd].set_f64(v);
            } else {
                m.cpu.fregs[fd].set_f32(v as f32);
            }
        }
        0b11100 => match instr.funct3() {
            0x0 => {
                // fmv.x.w / fmv.x.d
                let value = if double {
                    if X::VALUE < 64 {
                        return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 });
                    }
                    X::from_u64(m.cpu.fregs[f1].0)
                } else {
                    X::sign_extend_32(m.cpu.fregs[f1].0 as u32)
                };
                m.cpu.set_reg(fd, value);
            }
            0x1 => {
                let class = if double {
                    fclass_f64(m.cpu.fregs[f1].get_f64())
                } else {
                    fclass_f32(m.cpu.fregs[f1].get_f32())
                };
                m.cpu.set_reg(fd, X::from_u64(class));
            }
            _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
        },
        0b11110 => {
            // fmv.w.x / fmv.d.x
            let a = m.cpu.reg(f1);
            if double {
                if X::VALUE < 64 {
                    return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 });
                }
                m.cpu.fregs[fd].0 = X::to_u64(a);
            } else {
                m.cpu.fregs[fd].0 = u64::from(X::truncate_to_32(a)) | NAN_BOX;
            }
        }
        _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    }
    Ok(())
}

fn fcvt_from_f64<X: Xlen>(v: f64, variant: usize, pc: u64, instr: Instr) -> Result<X::Reg> {
    let value = match variant {
        0 => {
            let i = if v.is_nan() { i32::MAX } else { v as i32 };
            X::from_i64(i64::from(i))
        }
        1 => {
            let u = if v.is_nan() { u32::MAX } else { v as u32 };
            X::sign_extend_32(u)
        }
        2 if X::VALUE >= 64 => {
            let i = if v.is_nan() { i64::MAX } else { v as i64 };
            X::from_i64(i)
        }
        3 if X::VALUE >= 64 => {
            let u = if v.is_nan() { u64::MAX } else { v as u64 };
            X::from_u64(u)
        }
        _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    };
    Ok(value)
}

pub(crate) fn exec_fp_fused<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let double = instr.fpfmt() == 1;
    let (fd, f1, f2, f3) = (instr.rd(), instr.rs1(), instr.rs2(), instr.rs3());
    let negate_product = matches!(instr.opcode(), OPCODE_FNMADD | OPCODE_FNMSUB);
    let negate_addend = matches!(instr.opcode(), OPCODE_FMSUB | OPCODE_FNMADD);
    if !matches!(
        instr.opcode(),
        OPCODE_FMADD | OPCODE_FMSUB | OPCODE_FNMADD | OPCODE_FNMSUB
    ) {
        return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 });
    }

    if double {
        let mut a = m.cpu.fregs[f1].get_f64();
        let c = m.cpu.fregs[f3].get_f64();
        if negate_product {
            a = -a;
        }
        let addend = if negate_addend { -c } else { c };
        let v = a.mul_add(m.cpu.fregs[f2].get_f64(), addend);
        m.cpu.fregs[fd].set_f64(v);
    } else {
        let mut a = m.cpu.fregs[f1].get_f32();
        let c = m.cpu.fregs[f3].get_f32();
        if negate_product {
            a = -a;
        }
        let addend = if negate_addend { -c } else { c };
        let v = a.mul_add(m.cpu.fregs[f2].get_f32(), addend);
        m.cpu.fregs[fd].set_f32(v);
    }
    Ok(())
}

/// SYSTEM opcode: ECALL, EBREAK, stop encodings and the CSR subset.
fn exec_system<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<u64> {
    if instr.funct3() == 0 {
        match instr.i_imm_raw() {
            0x000 => {
                // ECALL: make pc visible, dispatch and follow redirects
                m.cpu.pc = pc;
                let nr = X::to_u64(m.cpu.reg(rvsim_isa::REG_ECALL));
                m.system_call(nr)?;
                return Ok(m.cpu.pc + 4);
            }
            0x001 => {
                m.cpu.pc = pc;
                m.system_call(SYSCALL_EBREAK as u64)?;
                return Ok(m.cpu.pc + 4);
            }
            0x105 | 0x7FF => {
                // WFI and the custom stop encoding
                m.stop();
                return Ok(pc + 4);
            }
            _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
        }
    }
    exec_csr(m, instr, pc)?;
    Ok(pc + 4)
}

/// Machine-level SYSTEM entry used by the dispatcher's System bytecode.
pub(crate) fn system_insn<X: Xlen>(m: &mut Machine<X>, instr: Instr) -> Result<()> {
    let pc = m.cpu.pc;
    if instr.funct3() == 0 {
        match instr.i_imm_raw() {
            0x001 => {
                m.system_call(SYSCALL_EBREAK as u64)?;
                return Ok(());
            }
            _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
        }
    }
    exec_csr(m, instr, pc)
}

fn exec_csr<X: Xlen>(m: &mut Machine<X>, instr: Instr, pc: u64) -> Result<()> {
    let csr = instr.i_imm_raw();
    let funct3 = instr.funct3();
    let is_imm = funct3 >= 0x5;
    let src = if is_imm {
        instr.rs1() as u64
    } else {
        X::to_u64(m.cpu.reg(instr.rs1()))
    };
    // CSRRW always writes; set/clear only write with a non-zero source
    let writes = matches!(funct3 & 0x3, 0x1) || (instr.rs1() != 0);

    let old = match csr {
        0x001 => u64::from(m.cpu.fcsr & 0x1F),
        0x002 => u64::from((m.cpu.fcsr >> 5) & 0x7),
        0x003 => u64::from(m.cpu.fcsr),
        0xC00 | 0xC01 | 0xC02 => m.instruction_counter(),
        0xC80 | 0xC81 | 0xC82 if X::VALUE == 32 => m.instruction_counter() >> 32,
        0xF14 => u64::from(m.cpu.cpu_id),
        _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
    };

    if writes {
        let new = match funct3 & 0x3 {
            0x1 => src,
            0x2 => old | src,
            0x3 => old & !src,
            _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
        };
        match csr {
            0x001 => m.cpu.fcsr = (m.cpu.fcsr & !0x1F) | (new as u32 & 0x1F),
            0x002 => m.cpu.fcsr = (m.cpu.fcsr & !0xE0) | ((new as u32 & 0x7) << 5),
            0x003 => m.cpu.fcsr = new as u32 & 0xFF,
            // Counters are read-only
            _ => return Err(MachineError::UnimplementedInstruction { pc, instr: instr.0 }),
        }
    }

    m.cpu.set_reg(instr.rd(), X::from_u64(old));
    Ok(())
}

/// Execute one compressed instruction at `pc`, returning the next PC.
#[allow(clippy::too_many_lines)]
pub(crate) fn execute_compressed<X: Xlen>(m: &mut Machine<X>, ci: CInstr, pc: u64) -> Result<u64> {
    let next = pc + 2;
    let illegal = || MachineError::IllegalOpcode {
        pc,
        instr: u32::from(ci.0),
    };

    match (ci.funct3(), ci.quadrant()) {
        (0b000, 0b00) => {
            if ci.0 == 0 {
                return Err(illegal());
            }
            // C.ADDI4SPN
            let value = X::add_imm(m.cpu.reg(REG_SP), ci.ciw_imm() as i32);
            m.cpu.set_reg(ci.rd_short(), value);
        }
        (0b001, 0b00) if FLOAT_ENABLED => {
            // C.FLD
            let addr = X::to_u64(m.cpu.reg(ci.rs1_short())) + u64::from(ci.cl_imm_d());
            m.cpu.fregs[ci.rd_short()].0 = m.memory.read::<u64>(addr)?;
        }
        (0b010, 0b00) => {
            // C.LW
            let addr = X::to_u64(m.cpu.reg(ci.rs1_short())) + u64::from(ci.cl_imm_w());
            let value = X::sign_extend_32(m.memory.read::<u32>(addr)?);
            m.cpu.set_reg(ci.rd_short(), value);
        }
        (0b011, 0b00) => {
            let addr = X::to_u64(m.cpu.reg(ci.rs1_short()));
            if X::VALUE >= 64 {
                // C.LD
                let value = X::from_u64(m.memory.read::<u64>(addr + u64::from(ci.cl_imm_d()))?);
                m.cpu.set_reg(ci.rd_short(), value);
            } else if FLOAT_ENABLED {
                // C.FLW
                let bits = m.memory.read::<u32>(addr + u64::from(ci.cl_imm_w()))?;
                m.cpu.fregs[ci.rd_short()].0 = u64::from(bits) | NAN_BOX;
            } else {
                return Err(illegal());
            }
        }
        (0b101, 0b00) if FLOAT_ENABLED => {
            // C.FSD
            let addr = X::to_u64(m.cpu.reg(ci.rs1_short())) + u64::from(ci.cl_imm_d());
            m.memory.write::<u64>(addr, m.cpu.fregs[ci.rd_short()].0)?;
        }
        (0b110, 0b00) => {
            // C.SW
            let addr = X::to_u64(m.cpu.reg(ci.rs1_short())) + u64::from(ci.cl_imm_w());
            m.memory
                .write::<u32>(addr, X::truncate_to_32(m.cpu.reg(ci.rd_short())))?;
        }
        (0b111, 0b00) => {
            let addr = X::to_u64(m.cpu.reg(ci.rs1_short()));
            if X::VALUE >= 64 {
                // C.SD
                m.memory.write::<u64>(
                    addr + u64::from(ci.cl_imm_d()),
                    X::to_u64(m.cpu.reg(ci.rd_short())),
                )?;
            } else if FLOAT_ENABLED {
                // C.FSW
                m.memory.write::<u32>(
                    addr + u64::from(ci.cl_imm_w()),
                    m.cpu.fregs[ci.rd_short()].0 as u32,
                )?;
            } else {
                return Err(illegal());
            }
        }
        (0b000, 0b01) => {
            // C.ADDI (rd == 0 is a NOP/hint)
            let rd = ci.rd();
            let value = X::add_imm(m.cpu.reg(rd), ci.ci_imm());
            m.cpu.set_reg(rd, value);
        }
        (0b001, 0b01) => {
            if X::VALUE >= 64 {
                // C.ADDIW
                let rd = ci.rd();
                let value = X::truncate_to_32(m.cpu.reg(rd)).wrapping_add_signed(ci.ci_imm());
                m.cpu.set_reg(rd, X::sign_extend_32(value));
            } else {
                // C.JAL
                m.cpu.set_reg(REG_RA, X::from_u64(next));
                return Ok(pc.wrapping_add_signed(i64::from(ci.cj_imm())));
            }
        }
        (0b010, 0b01) => {
            // C.LI
            m.cpu.set_reg(ci.rd(), X::from_i64(i64::from(ci.ci_imm())));
        }
        (0b011, 0b01) => {
            let rd = ci.rd();
            if rd == REG_SP {
                // C.ADDI16SP
                let value = X::add_imm(m.cpu.reg(REG_SP), ci.ci16_imm());
                m.cpu.set_reg(REG_SP, value);
            } else {
                // C.LUI
                if ci.ci_lui_imm() == 0 {
                    return Err(illegal());
                }
                m.cpu.set_reg(rd, X::from_i64(i64::from(ci.ci_lui_imm())));
            }
        }
        (0b100, 0b01) => {
            let rd = ci.rs1_short();
            match (ci.0 >> 10) & 0x3 {
                0b00 => {
                    // C.SRLI
                    let value = X::shr(m.cpu.reg(rd), ci.ci_shamt() & X::SHIFT_MASK);
                    m.cpu.set_reg(rd, value);
                }
                0b01 => {
                    // C.SRAI
                    let value = X::sra(m.cpu.reg(rd), ci.ci_shamt() & X::SHIFT_MASK);
                    m.cpu.set_reg(rd, value);
                }
                0b10 => {
                    // C.ANDI
                    let value = m.cpu.reg(rd) & X::from_i64(i64::from(ci.ci_imm()));
                    m.cpu.set_reg(rd, value);
                }
                _ => {
                    let rs2 = ci.rd_short();
                    let (a, b) = (m.cpu.reg(rd), m.cpu.reg(rs2));
                    let topbit = ci.0 & (1 << 12) != 0;
                    let value = match ((ci.0 >> 5) & 0x3, topbit) {
                        (0b00, false) => X::wrapping_sub(a, b),
                        (0b01, false) => a ^ b,
                        (0b10, false) => a | b,
                        (0b11, false) => a & b,
                        (0b00, true) if X::VALUE >= 64 => {
                            // C.SUBW
                            X::sign_extend_32(X::truncate_to_32(a).wrapping_sub(X::truncate_to_32(b)))
                        }
                        (0b01, true) if X::VALUE >= 64 => {
                            // C.ADDW
                            X::sign_extend_32(X::truncate_to_32(a).wrapping_add(X::truncate_to_32(b)))
                        }
                        _ => return Err(illegal()),
                    };
                    m.cpu.set_reg(rd, value);
                }
            }
        }
        (0b101, 0b01) => {
            // C.J
            return Ok(pc.wrapping_add_signed(i64::from(ci.cj_imm())));
        }
        (0b110, 0b01) => {
            // C.BEQZ
            if m.cpu.reg(ci.rs1_short()) == X::Reg::default() {
                return Ok(pc.wrapping_add_signed(i64::from(ci.cb_imm())));
            }
        }
        (0b111, 0b01) => {
            // C.BNEZ
            if m.cpu.reg(ci.rs1_short()) != X::Reg::default() {
                return Ok(pc.wrapping_add_signed(i64::from(ci.cb_imm())));
            }
        }
        (0b000, 0b10) => {
            // C.SLLI
            let rd = ci.rd();
            let value = X::shl(m.cpu.reg(rd), ci.ci_shamt() & X::SHIFT_MASK);
            m.cpu.set_reg(rd, value);
        }
        (0b001, 0b10) if FLOAT_ENABLED => {
            // C.FLDSP
            let addr = X::to_u64(m.cpu.reg(REG_SP)) + u64::from(ci.ci_ldsp_imm());
            m.cpu.fregs[ci.rd()].0 = m.memory.read::<u64>(addr)?;
        }
        (0b010, 0b10) => {
            // C.LWSP
            if ci.rd() == 0 {
                return Err(illegal());
            }
            let addr = X::to_u64(m.cpu.reg(REG_SP)) + u64::from(ci.ci_lwsp_imm());
            let value = X::sign_extend_32(m.memory.read::<u32>(addr)?);
            m.cpu.set_reg(ci.rd(), value);
        }
        (0b011, 0b10) => {
            let sp = X::to_u64(m.cpu.reg(REG_SP));
            if X::VALUE >= 64 {
                // C.LDSP
                let value = X::from_u64(m.memory.read::<u64>(sp + u64::from(ci.ci_ldsp_imm()))?);
                m.cpu.set_reg(ci.rd(), value);
            } else if FLOAT_ENABLED {
                // C.FLWSP
                let bits = m.memory.read::<u32>(sp + u64::from(ci.ci_lwsp_imm()))?;
                m.cpu.fregs[ci.rd()].0 = u64::from(bits) | NAN_BOX;
            } else {
                return Err(illegal());
            }
        }
        (0b100, 0b10) => {
            let topbit = ci.0 & (1 << 12) != 0;
            let (rd, rs2) = (ci.rd(), ci.rs2());
            if !topbit && rd != 0 && rs2 == 0 {
                // C.JR
                return Ok(X::to_u64(m.cpu.reg(rd)));
            }
            if topbit && rd != 0 && rs2 == 0 {
                // C.JALR
                let target = X::to_u64(m.cpu.reg(rd));
                m.cpu.set_reg(REG_RA, X::from_u64(next));
                return Ok(target);
            }
            if !topbit && rd != 0 {
                // C.MV
                m.cpu.set_reg(rd, m.cpu.reg(rs2));
            } else if topbit && rd == 0 && rs2 == 0 {
                // C.EBREAK
                m.cpu.pc = pc;
                m.system_call(SYSCALL_EBREAK as u64)?;
                return Ok(m.cpu.pc + 2);
            } else if topbit && rd != 0 {
                // C.ADD
                let value = X::wrapping_add(m.cpu.reg(rd), m.cpu.reg(rs2));
                m.cpu.set_reg(rd, value);
            } else {
                return Err(illegal());
            }
        }
        (0b101, 0b10) if FLOAT_ENABLED => {
            // C.FSDSP
            let addr = X::to_u64(m.cpu.reg(REG_SP)) + u64::from(ci.css_sdsp_imm());
            m.memory.write::<u64>(addr, m.cpu.fregs[ci.rs2()].0)?;
        }
        (0b110, 0b10) => {
            // C.SWSP
            let addr = X::to_u64(m.cpu.reg(REG_SP)) + u64::from(ci.css_swsp_imm());
            m.memory
                .write::<u32>(addr, X::truncate_to_32(m.cpu.reg(ci.rs2())))?;
        }
        (0b111, 0b10) => {
            let sp = X::to_u64(m.cpu.reg(REG_SP));
            if X::VALUE >= 64 {
                // C.SDSP
                m.memory.write::<u64>(
                    sp + u64::from(ci.css_sdsp_imm()),
                    X::to_u64(m.cpu.reg(ci.rs2())),
                )?;
            } else if FLOAT_ENABLED {
                // C.FSWSP
                m.memory.write::<u32>(
                    sp + u64::from(ci.css_swsp_imm()),
                    m.cpu.fregs[ci.rs2()].0 as u32,
                )?;
            } else {
                return Err(illegal());
            }
        }
        _ => return Err(illegal()),
    }
    Ok(next)
}

fn rotate_left<X: Xlen>(a: X::Reg, sh: u32) -> X::Reg {
    let sh = sh & X::SHIFT_MASK;
    if sh == 0 {
        a
    } else {
        X::shl(a, sh) | X::shr(a, u32::from(X::VALUE) - sh)
    }
}

fn rotate_right<X: Xlen>(a: X::Reg, sh: u32) -> X::Reg {
    let sh = sh & X::SHIFT_MASK;
    if sh == 0 {
        a
    } else {
        X::shr(a, sh) | X::shl(a, u32::from(X::VALUE) - sh)
    }
}

fn fclass_f32(v: f32) -> u64 {
    let bits = v.to_bits();
    let sign = bits >> 31 != 0;
    fclass_parts(sign, v.is_infinite(), v.is_nan(), bits & 0x7FFF_FFFF == 0,
        v.is_subnormal(), bits & 0x0040_0000 != 0)
}

fn fclass_f64(v: f64) -> u64 {
    let bits = v.to_bits();
    let sign = bits >> 63 != 0;
    fclass_parts(sign, v.is_infinite(), v.is_nan(), bits & !(1 << 63) == 0,
        v.is_subnormal(), bits & 0x0008_0000_0000_0000 != 0)
}

fn fclass_parts(sign: bool, inf: bool, nan: bool, zero: bool, subnormal: bool, quiet: bool) -> u64 {
    if nan {
        return if quiet { 1 << 9 } else { 1 << 8 };
    }
    if inf {
        return if sign { 1 << 0 } else { 1 << 7 };
    }
    if zero {
        return if sign { 1 << 3 } else { 1 << 4 };
    }
    if subnormal {
        return if sign { 1 << 2 } else { 1 << 5 };
    }
    if sign {
        1 << 1
    } else {
        1 << 6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fclass() {
        assert_eq!(fclass_f32(f32::NEG_INFINITY), 1 << 0);
        assert_eq!(fclass_f32(-1.5), 1 << 1);
        assert_eq!(fclass_f32(-0.0), 1 << 3);
        assert_eq!(fclass_f32(0.0), 1 << 4);
        assert_eq!(fclass_f32(2.5), 1 << 6);
        assert_eq!(fclass_f32(f32::INFINITY), 1 << 7);
        assert_eq!(fclass_f32(f32::NAN), 1 << 9);
        assert_eq!(fclass_f64(f64::NAN), 1 << 9);
        assert_eq!(fclass_f64(-0.0), 1 << 3);
    }

    #[test]
    fn test_rotates() {
        use rvsim_isa::{Rv32, Rv64};
        assert_eq!(rotate_left::<Rv32>(0x8000_0001, 1), 0x0000_0003);
        assert_eq!(rotate_right::<Rv32>(0x0000_0003, 1), 0x8000_0001);
        assert_eq!(rotate_left::<Rv64>(1u64 << 63, 1), 1);
        assert_eq!(rotate_left::<Rv64>(0xABCD, 0), 0xABCD);
    }
}
