//! Machine snapshots.
//!
//! Hand-serialized little-endian format: header, register banks, then
//! every mapped page with its attribute bits. `restore(snapshot(m))`
//! reproduces the machine state; decoded segments are rebuilt on the
//! next fetch instead of being persisted.

use rvsim_isa::{Xlen, NUM_FREGS, NUM_REGS};
use rvsim_mem::{Page, PageAttributes, PAGE_SIZE};

use crate::error::{MachineError, Result};
use crate::machine::Machine;

const SNAPSHOT_MAGIC: u32 = 0x4D53_5652; // "RVSM"
const SNAPSHOT_VERSION: u32 = 2;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(MachineError::InvalidProgram("truncated snapshot".into()));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

impl<X: Xlen> Machine<X> {
    /// Serialize the machine: version tag, memory limits and layout,
    /// register banks, PC, instruction counter and every mapped page.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4096 + self.memory.pages_active() * (PAGE_SIZE + 9));
        out.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.push(X::VALUE);
        out.extend_from_slice(&self.memory.memory_max().to_le_bytes());
        out.extend_from_slice(&self.memory.start_address().to_le_bytes());
        out.extend_from_slice(&self.memory.stack_initial().to_le_bytes());
        out.extend_from_slice(&self.memory.heap_address().to_le_bytes());
        out.extend_from_slice(&self.memory.brk().to_le_bytes());
        out.extend_from_slice(&self.memory.mmap_start().to_le_bytes());
        out.extend_from_slice(&self.memory.mmap_address().to_le_bytes());
        out.extend_from_slice(&self.instruction_counter().to_le_bytes());
        out.extend_from_slice(&self.cpu.pc.to_le_bytes());
        out.extend_from_slice(&self.cpu.fcsr.to_le_bytes());
        for i in 0..NUM_REGS {
            out.extend_from_slice(&X::to_u64(self.cpu.reg(i)).to_le_bytes());
        }
        for i in 0..NUM_FREGS {
            out.extend_from_slice(&self.cpu.fregs[i].0.to_le_bytes());
        }

        let mut pages: Vec<_> = self.memory.pages().collect();
        pages.sort_by_key(|(pageno, _)| *pageno);
        out.extend_from_slice(&(pages.len() as u32).to_le_bytes());
        for (pageno, page) in pages {
            out.extend_from_slice(&pageno.to_le_bytes());
            out.push(page.attr.to_prot() as u8);
            out.extend_from_slice(page.data());
        }
        out
    }

    /// Restore a machine from `snapshot` output.
    ///
    /// # Errors
    ///
    /// Fails on a bad magic/version, a register-width mismatch, or
    /// truncated data.
    pub fn restore(&mut self, data: &[u8]) -> Result<()> {
        let mut r = Reader::new(data);
        if r.u32()? != SNAPSHOT_MAGIC {
            return Err(MachineError::InvalidProgram("bad snapshot magic".into()));
        }
        if r.u32()? != SNAPSHOT_VERSION {
            return Err(MachineError::InvalidProgram("bad snapshot version".into()));
        }
        if r.u8()? != X::VALUE {
            return Err(MachineError::InvalidProgram(
                "snapshot register width mismatch".into(),
            ));
        }

        let memory_max = r.u64()?;
        let mut memory = rvsim_mem::Memory::new(memory_max);
        memory.set_force_align(self.options.force_align_memory);
        let start_address = r.u64()?;
        let stack_initial = r.u64()?;
        let heap = r.u64()?;
        let brk = r.u64()?;
        let mmap_start = r.u64()?;
        let mmap_address = r.u64()?;
        memory.set_start_address(start_address);
        memory.set_stack_initial(stack_initial);
        memory.set_heap_address(heap);
        memory.set_brk(brk);
        memory.set_mmap_start(mmap_start);
        memory.set_mmap_address(mmap_address);

        let counter = r.u64()?;
        let pc = r.u64()?;
        let fcsr = r.u32()?;
        let mut regs = [X::Reg::default(); NUM_REGS];
        for reg in &mut regs {
            *reg = X::from_u64(r.u64()?);
        }
        let mut fregs = [crate::cpu::FloatReg::default(); NUM_FREGS];
        for freg in &mut fregs {
            freg.0 = r.u64()?;
        }

        let page_count = r.u32()?;
        for _ in 0..page_count {
            let pageno = r.u64()?;
            let attr = PageAttributes::from_prot(u32::from(r.u8()?));
            let bytes = r.take(PAGE_SIZE)?;
            let mut page = Page::new(attr);
            page.data_mut().copy_from_slice(bytes);
            memory.insert_page(pageno, page);
        }

        self.memory = memory;
        self.cpu.reset();
        self.cpu.set_registers(regs);
        self.cpu.fregs = fregs;
        self.cpu.fcsr = fcsr;
        self.cpu.pc = pc;
        self.set_instruction_counter(counter);
        self.invalidate_segments();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::MachineOptions;
    use rvsim_isa::{asm, Rv64};

    #[test]
    fn test_snapshot_roundtrip() {
        let mut m = Machine::<Rv64>::new(MachineOptions::default());
        m.init_execute_area(0x1_0000, &asm::assemble(&[asm::addi(10, 0, 1), asm::wfi()]))
            .unwrap();
        m.cpu.pc = 0x1_0000;
        m.memory.write::<u64>(0x8000, 0xDEAD_BEEF_CAFE_F00D).unwrap();
        m.cpu.set_reg(5, 777);
        m.set_instruction_counter(42);

        let snap = m.snapshot();

        let mut restored = Machine::<Rv64>::new(MachineOptions::default());
        restored.restore(&snap).unwrap();

        assert_eq!(restored.cpu.pc, 0x1_0000);
        assert_eq!(restored.cpu.reg(5), 777);
        assert_eq!(restored.instruction_counter(), 42);
        assert_eq!(
            restored.memory.read::<u64>(0x8000).unwrap(),
            0xDEAD_BEEF_CAFE_F00D
        );
        // The restored machine still runs
        restored.simulate(u64::MAX).unwrap();
        assert_eq!(restored.return_value(), 1);
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let mut m = Machine::<Rv64>::new(MachineOptions::default());
        assert!(m.restore(&[1, 2, 3]).is_err());
        let mut snap = m.snapshot();
        snap[0] ^= 0xFF;
        assert!(m.restore(&snap).is_err());
    }
}
