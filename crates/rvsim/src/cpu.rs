//! CPU state: integer/float register banks, PC, LR/SC reservation and
//! the execute-segment reference used during dispatch.

use std::sync::Arc;

use rvsim_isa::{reg_name, Instr, Xlen, NUM_FREGS, NUM_REGS};
use rvsim_mem::{Memory, PageData, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

use crate::error::{MachineError, Result};
use crate::options::COMPRESSED_ENABLED;
use crate::segment::ExecuteSegment;

/// NaN-boxing pattern for single-precision values in 64-bit registers.
const NAN_BOX: u64 = 0xFFFF_FFFF_0000_0000;

/// Canonical quiet NaN returned when reading a non-boxed f32.
const F32_QNAN: u32 = 0x7FC0_0000;

/// One floating-point register, 64 bits wide with NaN-boxed singles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct FloatReg(pub u64);

impl FloatReg {
    #[inline]
    pub fn set_f32(&mut self, value: f32) {
        self.0 = u64::from(value.to_bits()) | NAN_BOX;
    }

    #[must_use]
    #[inline]
    pub fn get_f32(self) -> f32 {
        if self.0 & NAN_BOX == NAN_BOX {
            f32::from_bits(self.0 as u32)
        } else {
            f32::from_bits(F32_QNAN)
        }
    }

    #[inline]
    pub fn set_f64(&mut self, value: f64) {
        self.0 = value.to_bits();
    }

    #[must_use]
    #[inline]
    pub fn get_f64(self) -> f64 {
        f64::from_bits(self.0)
    }
}

/// One-entry cache for the page backing out-of-segment instruction
/// fetches. Must be revalidated against the memory epoch: attribute
/// changes, frees and forks all invalidate it.
#[derive(Clone, Default)]
struct ExecPageCache {
    pageno: u64,
    epoch: u64,
    data: Option<Arc<PageData>>,
}

/// CPU state for one hart.
///
/// The register bank leads the struct so the hottest accesses sit at
/// offset zero.
#[repr(C)]
pub struct Cpu<X: Xlen> {
    regs: [X::Reg; NUM_REGS],
    /// Program counter.
    pub pc: u64,
    /// Floating-point registers.
    pub fregs: [FloatReg; NUM_FREGS],
    /// Floating-point control and status register.
    pub fcsr: u32,
    /// LR/SC reservation address, if one is active.
    pub reservation: Option<u64>,
    /// Vector register bank (128-bit registers).
    pub vregs: [[u8; 16]; 32],
    /// Hart id reported through mhartid-style queries.
    pub cpu_id: u32,
    cache: ExecPageCache,
    current_exec: Option<Arc<ExecuteSegment<X>>>,
}

impl<X: Xlen> Cpu<X> {
    #[must_use]
    pub fn new(cpu_id: u32) -> Self {
        Self {
            regs: [X::Reg::default(); NUM_REGS],
            pc: 0,
            fregs: [FloatReg::default(); NUM_FREGS],
            fcsr: 0,
            reservation: None,
            vregs: [[0; 16]; 32],
            cpu_id,
            cache: ExecPageCache::default(),
            current_exec: None,
        }
    }

    /// Read a register; x0 always reads zero.
    #[must_use]
    #[inline]
    pub fn reg(&self, idx: usize) -> X::Reg {
        self.regs[idx]
    }

    /// Write a register; writes to x0 are ignored.
    #[inline]
    pub fn set_reg(&mut self, idx: usize, value: X::Reg) {
        if idx != 0 {
            self.regs[idx] = value;
        }
    }

    /// The full integer register bank.
    #[must_use]
    pub fn registers(&self) -> &[X::Reg; NUM_REGS] {
        &self.regs
    }

    /// Overwrite the register bank, keeping x0 zero.
    pub fn set_registers(&mut self, regs: [X::Reg; NUM_REGS]) {
        self.regs = regs;
        self.regs[0] = X::Reg::default();
    }

    /// Reset registers, PC and the reservation.
    pub fn reset(&mut self) {
        self.regs = [X::Reg::default(); NUM_REGS];
        self.fregs = [FloatReg::default(); NUM_FREGS];
        self.fcsr = 0;
        self.pc = 0;
        self.reservation = None;
        self.cache = ExecPageCache::default();
        self.current_exec = None;
    }

    /// Copy CPU state for a fork. The register file, PC and reservation
    /// carry over; the fetch cache starts cold since the child's pages
    /// are freshly shared.
    #[must_use]
    pub fn fork_from(&self) -> Self {
        Self {
            regs: self.regs,
            pc: self.pc,
            fregs: self.fregs,
            fcsr: self.fcsr,
            reservation: self.reservation,
            vregs: self.vregs,
            cpu_id: self.cpu_id,
            cache: ExecPageCache::default(),
            current_exec: self.current_exec.clone(),
        }
    }

    /// Jump to an address, enforcing the ISA alignment rule.
    pub fn jump(&mut self, target: u64) -> Result<()> {
        let mask = if COMPRESSED_ENABLED { 0x1 } else { 0x3 };
        if target & mask != 0 {
            self.pc = target;
            return Err(MachineError::MisalignedInstruction(target));
        }
        self.pc = target;
        Ok(())
    }

    /// Currently resolved execute segment, if any.
    #[must_use]
    pub fn current_segment(&self) -> Option<&Arc<ExecuteSegment<X>>> {
        self.current_exec.as_ref()
    }

    pub fn set_current_segment(&mut self, seg: Arc<ExecuteSegment<X>>) {
        self.current_exec = Some(seg);
    }

    pub fn clear_current_segment(&mut self) {
        self.current_exec = None;
    }

    /// Fetch an instruction word directly from page memory.
    ///
    /// Fallback for PCs outside any decoded segment. Goes through a
    /// one-entry page cache and faults when the page is missing or not
    /// executable, including the 32-bit fetch straddling a page border.
    pub fn fetch_slowpath(&mut self, memory: &Memory, pc: u64) -> Result<Instr> {
        let data = self.exec_page(memory, pc >> PAGE_SHIFT, pc)?;
        let offset = (pc & PAGE_MASK) as usize;

        if offset <= PAGE_SIZE - 4 {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data.0[offset..offset + 4]);
            return Ok(Instr(u32::from_le_bytes(bytes)));
        }

        // A jump can't land misaligned, so 16 bits remain on this page.
        let low = u16::from_le_bytes([data.0[offset], data.0[offset + 1]]);
        let mut instr = Instr(u32::from(low));
        if instr.length() == 4 {
            let next = self.exec_page(memory, (pc >> PAGE_SHIFT) + 1, pc)?;
            let high = u16::from_le_bytes([next.0[0], next.0[1]]);
            instr = Instr(u32::from(low) | (u32::from(high) << 16));
        }
        Ok(instr)
    }

    fn exec_page(&mut self, memory: &Memory, pageno: u64, pc: u64) -> Result<Arc<PageData>> {
        let entry = &mut self.cache;
        if entry.pageno != pageno || entry.epoch != memory.epoch() || entry.data.is_none() {
            let page = memory
                .get_page(pageno)
                .ok_or(MachineError::ExecutionSpaceProtectionFault(pc))?;
            if !page.attr.exec {
                return Err(MachineError::ExecutionSpaceProtectionFault(pc));
            }
            // Only cache once the page is known good
            *entry = ExecPageCache {
                pageno,
                epoch: memory.epoch(),
                data: Some(page.share()),
            };
        }
        Ok(entry.data.clone().unwrap())
    }

    /// Render the register bank for diagnostics.
    #[must_use]
    pub fn to_string_dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "pc = 0x{:x}", self.pc);
        for (i, value) in self.regs.iter().enumerate() {
            let _ = write!(out, "[{}\t0x{:x}] ", reg_name(i), X::to_u64(*value));
            if i % 5 == 4 {
                out.push('\n');
            }
        }
        out
    }
}
