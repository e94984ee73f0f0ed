//! The fetch-execute loop.
//!
//! Three interchangeable dispatch modes share the bytecode table, the
//! step methods on [`Dispatch`] and the control-flow primitives below:
//! `next_instr` advances one decoder slot, `next_block` enters the next
//! straight-line block (adding its byte length and instruction count in
//! one step), and `checked_jump` re-validates the counter and the
//! current execute segment after the PC changed.
//!
//! On block entry the PC is advanced to the block's terminating
//! instruction and the counter by the whole block, so branch targets and
//! link registers are computed from the terminator's own address without
//! per-instruction bookkeeping. Mid-block instructions recover their own
//! address from the per-entry distance to the terminator.

pub(crate) mod switch;
pub(crate) mod tailcall;
pub(crate) mod threaded;

use std::sync::Arc;

use rvsim_isa::{Instr, Xlen, REG_ECALL, REG_RA};

use crate::bytecode::{ImmPacked, ItypePacked, JtypePacked, MovePacked, OpTypePacked};
use crate::error::{MachineError, Result, StopReason};
use crate::machine::Machine;
use crate::options::COMPRESSED_ENABLED;
use crate::segment::{DecoderEntry, ExecuteSegment};

/// What a step decided about the loop.
pub(crate) enum Flow {
    Continue,
    Halt(StopReason),
}

/// Per-invocation dispatch state: the current segment, the decoder slot
/// index, and local copies of PC and the instruction counters.
pub(crate) struct Dispatch<'m, X: Xlen> {
    pub m: &'m mut Machine<X>,
    seg: Arc<ExecuteSegment<X>>,
    idx: usize,
    pc: u64,
    counter: u64,
    max: u64,
}

impl<'m, X: Xlen> Dispatch<'m, X> {
    pub(crate) fn new(m: &'m mut Machine<X>) -> Result<Self> {
        // We need an execute segment matching the current PC
        let seg = match m.cpu.current_segment() {
            Some(seg) if seg.is_within(m.cpu.pc) => Arc::clone(seg),
            _ => m.next_execute_segment()?,
        };
        let pc = m.cpu.pc;
        let idx = seg.slot_for(pc);
        let counter = m.instruction_counter();
        let max = m.max_instructions();
        Ok(Self {
            m,
            seg,
            idx,
            pc,
            counter,
            max,
        })
    }

    /// Entry check: an already-spent budget returns immediately,
    /// otherwise the first block is entered.
    pub(crate) fn prologue(&mut self) -> Option<StopReason> {
        if self.counter >= self.max {
            return Some(self.halt_reason());
        }
        self.begin_block();
        None
    }

    /// Write local counters back to the machine; on an exception,
    /// publish a best-effort PC for the faulting instruction.
    pub(crate) fn finish(&mut self, result: &Result<StopReason>) {
        self.m.set_instruction_counter(self.counter);
        if let Err(err) = result {
            match err {
                // These already stored the precise address
                MachineError::MisalignedInstruction(_)
                | MachineError::ExecutionSpaceProtectionFault(_) => {}
                _ => self.m.cpu.pc = self.pc.wrapping_sub(self.entry().block_bytes()),
            }
        }
    }

    #[inline(always)]
    pub(crate) fn entry(&self) -> DecoderEntry {
        self.seg.entry(self.idx)
    }

    #[inline(always)]
    pub(crate) fn bytecode_index(&self) -> usize {
        self.entry().bytecode as usize
    }

    #[inline(always)]
    fn reg(&self, idx: usize) -> X::Reg {
        self.m.cpu.reg(idx)
    }

    #[inline(always)]
    fn set_reg(&mut self, idx: usize, value: X::Reg) {
        self.m.cpu.set_reg(idx, value);
    }

    /// Address of the instruction currently being executed.
    #[inline(always)]
    fn own_pc(&self) -> u64 {
        self.pc - self.entry().block_bytes()
    }

    fn halt_reason(&self) -> StopReason {
        if self.m.stopped() {
            StopReason::Stopped
        } else {
            StopReason::InstructionLimit
        }
    }

    #[inline(always)]
    fn begin_block(&mut self) {
        let entry = self.entry();
        self.pc += entry.block_bytes();
        self.counter += entry.instruction_count();
    }

    #[inline(always)]
    fn next_instr(&mut self) {
        self.idx += if COMPRESSED_ENABLED { 2 } else { 1 };
    }

    #[inline(always)]
    fn next_c_instr(&mut self) {
        self.idx += 1;
    }

    #[inline(always)]
    fn next_block(&mut self, len: u64) {
        self.pc += len;
        self.idx += if COMPRESSED_ENABLED {
            (len / 2) as usize
        } else {
            1
        };
        self.begin_block();
    }

    /// Land on an in-segment block head without bounds rechecks.
    #[inline(always)]
    fn enter_block_at_pc(&mut self) {
        self.idx = self.seg.slot_for(self.pc);
        self.begin_block();
    }

    /// Jump for targets the decoder proved in-segment: only the counter
    /// needs checking.
    #[inline(always)]
    fn overflow_checked_jump(&mut self) -> Result<Flow> {
        if self.counter >= self.max {
            self.m.cpu.pc = self.pc;
            return Ok(Flow::Halt(self.halt_reason()));
        }
        self.enter_block_at_pc();
        Ok(Flow::Continue)
    }

    /// Full jump: counter check, then segment re-resolution when the PC
    /// left the current one. The PC is stored around the resolution so
    /// segment-change callbacks observe (and may redirect) it.
    fn checked_jump(&mut self) -> Result<Flow> {
        if self.counter >= self.max {
            self.m.cpu.pc = self.pc;
            return Ok(Flow::Halt(self.halt_reason()));
        }
        if !self.seg.is_within(self.pc) {
            self.m.cpu.pc = self.pc;
            self.m.set_instruction_counter(self.counter);
            self.seg = self.m.next_execute_segment()?;
            self.pc = self.m.cpu.pc;
            self.max = self.m.max_instructions();
        }
        self.enter_block_at_pc();
        Ok(Flow::Continue)
    }

    /// Indirect jumps must land on an instruction boundary.
    fn check_aligned(&mut self) -> Result<()> {
        let mask = if COMPRESSED_ENABLED { 0x1 } else { 0x3 };
        if self.pc & mask != 0 {
            self.m.cpu.pc = self.pc;
            return Err(MachineError::MisalignedInstruction(self.pc));
        }
        Ok(())
    }

    // ===== Steps: immediate arithmetic =====

    pub(crate) fn step_invalid(&mut self) -> Result<Flow> {
        let entry = self.entry();
        Err(MachineError::IllegalOpcode {
            pc: self.own_pc(),
            instr: entry.instr,
        })
    }

    pub(crate) fn step_nop(&mut self) -> Result<Flow> {
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_addi(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = X::add_imm(self.reg(p.rs2()), p.signed_imm());
        self.set_reg(p.rs1(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_li(&mut self) -> Result<Flow> {
        let p = ImmPacked(self.entry().instr);
        self.set_reg(p.rd(), X::from_i64(i64::from(p.signed_imm())));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_mv(&mut self) -> Result<Flow> {
        let p = MovePacked(self.entry().instr);
        let value = self.reg(p.rs1());
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_slli(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = X::shl(self.reg(p.rs2()), p.unsigned_imm() & X::SHIFT_MASK);
        self.set_reg(p.rs1(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_slti(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let lt = X::lt_signed(self.reg(p.rs2()), X::from_i64(i64::from(p.signed_imm())));
        self.set_reg(p.rs1(), X::from_u64(u64::from(lt)));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_sltiu(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let rhs = X::to_u64(X::from_i64(i64::from(p.signed_imm())));
        let lt = X::to_u64(self.reg(p.rs2())) < rhs;
        self.set_reg(p.rs1(), X::from_u64(u64::from(lt)));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_xori(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = self.reg(p.rs2()) ^ X::from_i64(i64::from(p.signed_imm()));
        self.set_reg(p.rs1(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_srli(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = X::shr(self.reg(p.rs2()), p.unsigned_imm() & X::SHIFT_MASK);
        self.set_reg(p.rs1(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_srai(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = X::sra(self.reg(p.rs2()), p.unsigned_imm() & X::SHIFT_MASK);
        self.set_reg(p.rs1(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_ori(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = self.reg(p.rs2()) | X::from_i64(i64::from(p.signed_imm()));
        self.set_reg(p.rs1(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_andi(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = self.reg(p.rs2()) & X::from_i64(i64::from(p.signed_imm()));
        self.set_reg(p.rs1(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_addiw(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = X::truncate_to_32(self.reg(p.rs2())).wrapping_add_signed(p.signed_imm());
        self.set_reg(p.rs1(), X::sign_extend_32(value));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_lui(&mut self) -> Result<Flow> {
        let instr = Instr(self.entry().instr);
        self.set_reg(instr.rd(), X::sign_extend_32(instr.u_imm() as u32));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_auipc(&mut self) -> Result<Flow> {
        let instr = Instr(self.entry().instr);
        let value = X::add_imm(X::from_u64(self.own_pc()), instr.u_imm());
        self.set_reg(instr.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    // ===== Steps: loads and stores =====

    #[inline(always)]
    fn load_address(&self, p: ItypePacked) -> u64 {
        X::to_u64(X::add_imm(self.reg(p.rs2()), p.signed_imm()))
    }

    pub(crate) fn step_ldb(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = self.m.memory.read::<u8>(self.load_address(p))?;
        self.set_reg(p.rs1(), X::from_i64(i64::from(value.cast_signed())));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_ldbu(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = self.m.memory.read::<u8>(self.load_address(p))?;
        self.set_reg(p.rs1(), X::from_u64(u64::from(value)));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_ldh(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = self.m.memory.read::<u16>(self.load_address(p))?;
        self.set_reg(p.rs1(), X::from_i64(i64::from(value.cast_signed())));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_ldhu(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = self.m.memory.read::<u16>(self.load_address(p))?;
        self.set_reg(p.rs1(), X::from_u64(u64::from(value)));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_ldw(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = self.m.memory.read::<u32>(self.load_address(p))?;
        self.set_reg(p.rs1(), X::sign_extend_32(value));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_ldwu(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = self.m.memory.read::<u32>(self.load_address(p))?;
        self.set_reg(p.rs1(), X::from_u64(u64::from(value)));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_ldd(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = self.m.memory.read::<u64>(self.load_address(p))?;
        self.set_reg(p.rs1(), X::from_u64(value));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_stb(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let addr = X::to_u64(X::add_imm(self.reg(p.rs1()), p.signed_imm()));
        let value = X::to_u64(self.reg(p.rs2())) as u8;
        self.m.memory.write::<u8>(addr, value)?;
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_sth(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let addr = X::to_u64(X::add_imm(self.reg(p.rs1()), p.signed_imm()));
        let value = X::to_u64(self.reg(p.rs2())) as u16;
        self.m.memory.write::<u16>(addr, value)?;
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_stw(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let addr = X::to_u64(X::add_imm(self.reg(p.rs1()), p.signed_imm()));
        let value = X::truncate_to_32(self.reg(p.rs2()));
        self.m.memory.write::<u32>(addr, value)?;
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_std(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let addr = X::to_u64(X::add_imm(self.reg(p.rs1()), p.signed_imm()));
        let value = X::to_u64(self.reg(p.rs2()));
        self.m.memory.write::<u64>(addr, value)?;
        self.next_instr();
        Ok(Flow::Continue)
    }

    // ===== Steps: branches =====

    /// Taken branch to a decode-time-verified in-segment target.
    #[inline(always)]
    fn perform_branch(&mut self, imm: i32) -> Result<Flow> {
        self.pc = self.pc.wrapping_add_signed(i64::from(imm));
        self.overflow_checked_jump()
    }

    /// Forward branches cannot form loops, so even the counter check is
    /// skipped.
    #[inline(always)]
    fn perform_forward_branch(&mut self, imm: i32) -> Result<Flow> {
        self.pc = self.pc.wrapping_add_signed(i64::from(imm));
        self.enter_block_at_pc();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_beq(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        if self.reg(p.rs1()) == self.reg(p.rs2()) {
            self.perform_branch(p.signed_imm())
        } else {
            self.next_block(4);
            Ok(Flow::Continue)
        }
    }

    pub(crate) fn step_bne(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        if self.reg(p.rs1()) != self.reg(p.rs2()) {
            self.perform_branch(p.signed_imm())
        } else {
            self.next_block(4);
            Ok(Flow::Continue)
        }
    }

    pub(crate) fn step_blt(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        if X::lt_signed(self.reg(p.rs1()), self.reg(p.rs2())) {
            self.perform_branch(p.signed_imm())
        } else {
            self.next_block(4);
            Ok(Flow::Continue)
        }
    }

    pub(crate) fn step_bge(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        if !X::lt_signed(self.reg(p.rs1()), self.reg(p.rs2())) {
            self.perform_branch(p.signed_imm())
        } else {
            self.next_block(4);
            Ok(Flow::Continue)
        }
    }

    pub(crate) fn step_bltu(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        if X::to_u64(self.reg(p.rs1())) < X::to_u64(self.reg(p.rs2())) {
            self.perform_branch(p.signed_imm())
        } else {
            self.next_block(4);
            Ok(Flow::Continue)
        }
    }

    pub(crate) fn step_bgeu(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        if X::to_u64(self.reg(p.rs1())) >= X::to_u64(self.reg(p.rs2())) {
            self.perform_branch(p.signed_imm())
        } else {
            self.next_block(4);
            Ok(Flow::Continue)
        }
    }

    pub(crate) fn step_beq_fw(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        if self.reg(p.rs1()) == self.reg(p.rs2()) {
            self.perform_forward_branch(p.signed_imm())
        } else {
            self.next_block(4);
            Ok(Flow::Continue)
        }
    }

    pub(crate) fn step_bne_fw(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        if self.reg(p.rs1()) != self.reg(p.rs2()) {
            self.perform_forward_branch(p.signed_imm())
        } else {
            self.next_block(4);
            Ok(Flow::Continue)
        }
    }

    // ===== Steps: jumps =====

    pub(crate) fn step_jal(&mut self) -> Result<Flow> {
        let p = JtypePacked(self.entry().instr);
        if p.rd() != 0 {
            let link = self.pc + 4;
            self.set_reg(p.rd(), X::from_u64(link));
        }
        self.pc = self.pc.wrapping_add_signed(i64::from(p.offset()));
        self.check_aligned()?;
        self.checked_jump()
    }

    pub(crate) fn step_jalr(&mut self) -> Result<Flow> {
        let instr = Instr(self.entry().instr);
        // If rs1 == rd, read the base before writing the link register
        let target = X::to_u64(X::add_imm(self.reg(instr.rs1()), instr.i_imm()));
        if instr.rd() != 0 {
            let link = self.pc + 4;
            self.set_reg(instr.rd(), X::from_u64(link));
        }
        self.pc = target;
        self.check_aligned()?;
        self.checked_jump()
    }

    pub(crate) fn step_fast_jal(&mut self) -> Result<Flow> {
        self.pc = u64::from(self.entry().instr);
        self.overflow_checked_jump()
    }

    pub(crate) fn step_fast_call(&mut self) -> Result<Flow> {
        let link = self.pc + 4;
        self.set_reg(REG_RA, X::from_u64(link));
        self.pc = u64::from(self.entry().instr);
        self.overflow_checked_jump()
    }

    // ===== Steps: register-register ops =====

    pub(crate) fn step_op_add(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::wrapping_add(self.reg(p.rs1()), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_sub(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::wrapping_sub(self.reg(p.rs1()), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_sll(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let sh = (X::to_u64(self.reg(p.rs2())) as u32) & X::SHIFT_MASK;
        let value = X::shl(self.reg(p.rs1()), sh);
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_slt(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let lt = X::lt_signed(self.reg(p.rs1()), self.reg(p.rs2()));
        self.set_reg(p.rd(), X::from_u64(u64::from(lt)));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_sltu(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let lt = X::to_u64(self.reg(p.rs1())) < X::to_u64(self.reg(p.rs2()));
        self.set_reg(p.rd(), X::from_u64(u64::from(lt)));
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_xor(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = self.reg(p.rs1()) ^ self.reg(p.rs2());
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_srl(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let sh = (X::to_u64(self.reg(p.rs2())) as u32) & X::SHIFT_MASK;
        let value = X::shr(self.reg(p.rs1()), sh);
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_sra(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let sh = (X::to_u64(self.reg(p.rs2())) as u32) & X::SHIFT_MASK;
        let value = X::sra(self.reg(p.rs1()), sh);
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_or(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = self.reg(p.rs1()) | self.reg(p.rs2());
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_and(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = self.reg(p.rs1()) & self.reg(p.rs2());
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_mul(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::mul(self.reg(p.rs1()), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_mulh(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::mulh(self.reg(p.rs1()), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_mulhsu(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::mulhsu(self.reg(p.rs1()), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_mulhu(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::mulhu(self.reg(p.rs1()), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_div(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::div(self.reg(p.rs1()), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_divu(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::divu(self.reg(p.rs1()), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_rem(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::rem(self.reg(p.rs1()), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_remu(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::remu(self.reg(p.rs1()), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_sh1add(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::wrapping_add(X::shl(self.reg(p.rs1()), 1), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_sh2add(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::wrapping_add(X::shl(self.reg(p.rs1()), 2), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_op_sh3add(&mut self) -> Result<Flow> {
        let p = OpTypePacked(self.entry().instr);
        let value = X::wrapping_add(X::shl(self.reg(p.rs1()), 3), self.reg(p.rs2()));
        self.set_reg(p.rd(), value);
        self.next_instr();
        Ok(Flow::Continue)
    }

    // ===== Steps: compressed fast paths =====

    pub(crate) fn step_c_addi(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let value = X::add_imm(self.reg(p.rs2()), p.signed_imm());
        self.set_reg(p.rs1(), value);
        self.next_c_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_c_mv(&mut self) -> Result<Flow> {
        let p = MovePacked(self.entry().instr);
        let value = self.reg(p.rs1());
        self.set_reg(p.rd(), value);
        self.next_c_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_c_bnez(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        if self.reg(p.rs1()) != X::Reg::default() {
            self.perform_branch(p.signed_imm())
        } else {
            self.next_block(2);
            Ok(Flow::Continue)
        }
    }

    pub(crate) fn step_c_ldd(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let addr = X::to_u64(X::add_imm(self.reg(p.rs2()), p.signed_imm()));
        let value = self.m.memory.read::<u64>(addr)?;
        self.set_reg(p.rs1(), X::from_u64(value));
        self.next_c_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_c_std(&mut self) -> Result<Flow> {
        let p = ItypePacked(self.entry().instr);
        let addr = X::to_u64(X::add_imm(self.reg(p.rs1()), p.signed_imm()));
        let value = X::to_u64(self.reg(p.rs2()));
        self.m.memory.write::<u64>(addr, value)?;
        self.next_c_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_c_function(&mut self) -> Result<Flow> {
        let entry = self.entry();
        let own = self.pc - entry.block_bytes();
        let handler = self.seg.handler(entry.handler);
        handler(self.m, Instr(entry.instr), own)?;
        self.next_c_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_c_jump_function(&mut self) -> Result<Flow> {
        let entry = self.entry();
        self.m.cpu.pc = self.pc;
        let handler = self.seg.handler(entry.handler);
        handler(self.m, Instr(entry.instr), self.pc)?;
        self.pc = self.m.cpu.pc;
        self.check_aligned()?;
        self.checked_jump()
    }

    // ===== Steps: system =====

    pub(crate) fn step_syscall(&mut self) -> Result<Flow> {
        // Make the current PC and counters visible to the handler
        self.m.cpu.pc = self.pc;
        self.m.set_instruction_counter(self.counter);
        let nr = X::to_u64(self.reg(REG_ECALL));
        self.m.system_call(nr)?;
        self.max = self.m.max_instructions();
        if self.counter >= self.max || self.m.cpu.pc != self.pc {
            // System calls are always full-length instructions
            self.pc = self.m.cpu.pc + 4;
            return self.checked_jump();
        }
        self.next_block(4);
        Ok(Flow::Continue)
    }

    pub(crate) fn step_stop(&mut self) -> Result<Flow> {
        self.m.cpu.pc = self.pc + 4;
        self.m.stop();
        Ok(Flow::Halt(StopReason::Stopped))
    }

    pub(crate) fn step_system(&mut self) -> Result<Flow> {
        let entry = self.entry();
        self.m.cpu.pc = self.pc;
        self.m.set_instruction_counter(self.counter);
        self.m.system(Instr(entry.instr))?;
        self.max = self.m.max_instructions();
        // The PC may have been redirected (supervisor-style handlers)
        self.pc = self.m.cpu.pc + 4;
        self.checked_jump()
    }

    pub(crate) fn step_translator(&mut self) -> Result<Flow> {
        let entry = self.entry();
        self.m.cpu.pc = self.pc;
        self.m.set_instruction_counter(self.counter);
        let handler = self.seg.translator(entry.handler);
        handler.as_ref()(self.m)?;
        self.counter = self.m.instruction_counter();
        self.max = self.m.max_instructions();
        self.pc = self.m.cpu.pc + 4;
        self.checked_jump()
    }

    // ===== Steps: floating point and vector =====

    pub(crate) fn step_flw(&mut self) -> Result<Flow> {
        let entry = self.entry();
        crate::handlers::exec_fp_load(self.m, Instr(entry.instr), self.pc - entry.block_bytes())?;
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_fld(&mut self) -> Result<Flow> {
        self.step_flw()
    }

    pub(crate) fn step_fsw(&mut self) -> Result<Flow> {
        let entry = self.entry();
        crate::handlers::exec_fp_store(self.m, Instr(entry.instr), self.pc - entry.block_bytes())?;
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_fsd(&mut self) -> Result<Flow> {
        self.step_fsw()
    }

    pub(crate) fn step_fp_op(&mut self) -> Result<Flow> {
        let entry = self.entry();
        crate::handlers::exec_fp(self.m, Instr(entry.instr), self.pc - entry.block_bytes())?;
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_fmadd(&mut self) -> Result<Flow> {
        let entry = self.entry();
        crate::handlers::exec_fp_fused(self.m, Instr(entry.instr), self.pc - entry.block_bytes())?;
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_vle32(&mut self) -> Result<Flow> {
        self.step_flw()
    }

    pub(crate) fn step_vse32(&mut self) -> Result<Flow> {
        self.step_fsw()
    }

    pub(crate) fn step_vfadd_vv(&mut self) -> Result<Flow> {
        let entry = self.entry();
        crate::handlers::exec_vector_op(self.m, Instr(entry.instr), self.pc - entry.block_bytes())?;
        self.next_instr();
        Ok(Flow::Continue)
    }

    // ===== Steps: handler fallbacks =====

    pub(crate) fn step_function(&mut self) -> Result<Flow> {
        let entry = self.entry();
        let own = self.pc - entry.block_bytes();
        let handler = self.seg.handler(entry.handler);
        handler(self.m, Instr(entry.instr), own)?;
        self.next_instr();
        Ok(Flow::Continue)
    }

    pub(crate) fn step_function_block_end(&mut self) -> Result<Flow> {
        let entry = self.entry();
        let handler = self.seg.handler(entry.handler);
        handler(self.m, Instr(entry.instr), self.pc)?;
        let len = if COMPRESSED_ENABLED {
            Instr(entry.instr).length() as u64
        } else {
            4
        };
        self.pc += len;
        self.checked_jump()
    }
}

/// The bytecode → step pairing shared by every dispatch mode. Each mode
/// instantiates this list into its own control structure: a match, a
/// function-pointer table, or a continuation table.
macro_rules! for_each_bytecode {
    ($mac:ident) => {
        $mac! {
            (Invalid, step_invalid),
            (Addi, step_addi),
            (Li, step_li),
            (Mv, step_mv),
            (Slli, step_slli),
            (Slti, step_slti),
            (Sltiu, step_sltiu),
            (Xori, step_xori),
            (Srli, step_srli),
            (Srai, step_srai),
            (Ori, step_ori),
            (Andi, step_andi),
            (Lui, step_lui),
            (Auipc, step_auipc),
            (Ldb, step_ldb),
            (Ldbu, step_ldbu),
            (Ldh, step_ldh),
            (Ldhu, step_ldhu),
            (Ldw, step_ldw),
            (Ldwu, step_ldwu),
            (Ldd, step_ldd),
            (Stb, step_stb),
            (Sth, step_sth),
            (Stw, step_stw),
            (Std, step_std),
            (Beq, step_beq),
            (Bne, step_bne),
            (Blt, step_blt),
            (Bge, step_bge),
            (Bltu, step_bltu),
            (Bgeu, step_bgeu),
            (BeqFw, step_beq_fw),
            (BneFw, step_bne_fw),
            (Jal, step_jal),
            (Jalr, step_jalr),
            (FastJal, step_fast_jal),
            (FastCall, step_fast_call),
            (OpAdd, step_op_add),
            (OpSub, step_op_sub),
            (OpSll, step_op_sll),
            (OpSlt, step_op_slt),
            (OpSltu, step_op_sltu),
            (OpXor, step_op_xor),
            (OpSrl, step_op_srl),
            (OpOr, step_op_or),
            (OpAnd, step_op_and),
            (OpMul, step_op_mul),
            (OpMulh, step_op_mulh),
            (OpMulhsu, step_op_mulhsu),
            (OpMulhu, step_op_mulhu),
            (OpDiv, step_op_div),
            (OpDivu, step_op_divu),
            (OpRem, step_op_rem),
            (OpRemu, step_op_remu),
            (OpSra, step_op_sra),
            (OpSh1add, step_op_sh1add),
            (OpSh2add, step_op_sh2add),
            (OpSh3add, step_op_sh3add),
            (Addiw, step_addiw),
            (CAddi, step_c_addi),
            (CMv, step_c_mv),
            (CBnez, step_c_bnez),
            (CLdd, step_c_ldd),
            (CStd, step_c_std),
            (CFunction, step_c_function),
            (CJumpFunction, step_c_jump_function),
            (Syscall, step_syscall),
            (Stop, step_stop),
            (Nop, step_nop),
            (Flw, step_flw),
            (Fld, step_fld),
            (Fsw, step_fsw),
            (Fsd, step_fsd),
            (Fadd, step_fp_op),
            (Fsub, step_fp_op),
            (Fmul, step_fp_op),
            (Fdiv, step_fp_op),
            (Fmadd, step_fmadd),
            (Vle32, step_vle32),
            (Vse32, step_vse32),
            (VfaddVv, step_vfadd_vv),
            (Function, step_function),
            (FunctionBlockEnd, step_function_block_end),
            (Translator, step_translator),
            (System, step_system),
        }
    };
}

pub(crate) use for_each_bytecode;
