//! The machine: one hart, its memory, syscall table and execute
//! segments.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use rvsim_isa::{CInstr, Instr, Xlen, REG_A0};
use rvsim_mem::{Arena, Memory, PAGE_SHIFT, PAGE_SIZE};
use tracing::{debug, trace};

use crate::cpu::Cpu;
use crate::error::{MachineError, Result, StopReason};
use crate::handlers;
use crate::options::{DispatchMode, MachineOptions, COMPRESSED_ENABLED};
use crate::segment::{ExecuteSegment, TranslatorFn};
use crate::syscalls::{ENOSYS, SYSCALLS_MAX};
use crate::{dispatch, loader};

/// A system call handler. Handlers receive the whole machine; the
/// caller's PC and instruction counter are committed before the call.
pub type SyscallFn<X> = Arc<dyn Fn(&mut Machine<X>) -> Result<()> + Send + Sync>;

/// A single-hart RISC-V machine.
pub struct Machine<X: Xlen> {
    pub cpu: Cpu<X>,
    pub memory: Memory,
    pub(crate) options: MachineOptions,
    segments: Vec<Arc<ExecuteSegment<X>>>,
    syscall_handlers: Vec<Option<SyscallFn<X>>>,
    pub(crate) translations: FxHashMap<u64, TranslatorFn<X>>,
    pub(crate) translation_active: bool,
    arena: Option<Arena>,
    instruction_counter: u64,
    max_instructions: u64,
    stopped: bool,
}

impl<X: Xlen> Machine<X> {
    /// Create an empty machine; load a program separately.
    #[must_use]
    pub fn new(mut options: MachineOptions) -> Self {
        let mut memory = Memory::new(options.memory_max);
        memory.set_force_align(options.force_align_memory);
        if let Some(handler) = options.page_fault_handler.take() {
            memory.set_page_fault_handler(handler);
        }
        Self {
            cpu: Cpu::new(options.cpu_id),
            memory,
            options,
            segments: Vec::new(),
            syscall_handlers: vec![None; SYSCALLS_MAX],
            translations: FxHashMap::default(),
            translation_active: false,
            arena: None,
            instruction_counter: 0,
            max_instructions: 0,
            stopped: false,
        }
    }

    /// Create a machine from an ELF program image.
    pub fn from_elf(binary: &[u8], options: MachineOptions) -> Result<Self> {
        let mut machine = Self::new(options);
        if machine.options.load_program {
            machine.load_program(binary)?;
        }
        Ok(machine)
    }

    /// Parse and map an ELF image, set up the stack and jump to the
    /// entry point.
    pub fn load_program(&mut self, binary: &[u8]) -> Result<()> {
        let image = rvsim_elf::ElfImage::<X>::parse(binary)?;
        loader::load_image(self, &image)
    }

    /// Run until a stop, an exception, or `imax` executed instructions.
    ///
    /// Reaching the limit is a normal return; the PC then points at the
    /// next instruction to execute.
    pub fn simulate(&mut self, imax: u64) -> Result<StopReason> {
        self.stopped = false;
        self.max_instructions = if imax == u64::MAX {
            u64::MAX
        } else {
            self.instruction_counter.saturating_add(imax)
        };
        match self.options.dispatch {
            DispatchMode::Switch => dispatch::switch::run(self),
            DispatchMode::Threaded => dispatch::threaded::run(self),
            DispatchMode::TailCall => dispatch::tailcall::run(self),
        }
    }

    /// Execute exactly one instruction through the slow-path
    /// interpreter.
    pub fn step_one(&mut self) -> Result<()> {
        let pc = self.cpu.pc;
        let instr = self.fetch_instr(pc)?;
        let next = if COMPRESSED_ENABLED && instr.length() == 2 {
            handlers::execute_compressed(self, CInstr(instr.0 as u16), pc)?
        } else {
            handlers::execute_instr(self, instr, pc)?
        };
        self.instruction_counter += 1;
        self.cpu.jump(next)
    }

    fn fetch_instr(&mut self, pc: u64) -> Result<Instr> {
        if let Some(seg) = self.cpu.current_segment() {
            if seg.is_within(pc) {
                return Ok(seg.instr_at(pc));
            }
        }
        self.cpu.fetch_slowpath(&self.memory, pc)
    }

    /// Whether a previous run stopped the machine (exit or STOP).
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Stop the machine: the running dispatch loop returns at the next
    /// block transition.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.max_instructions = 0;
    }

    #[must_use]
    pub fn instruction_counter(&self) -> u64 {
        self.instruction_counter
    }

    pub fn set_instruction_counter(&mut self, counter: u64) {
        self.instruction_counter = counter;
    }

    #[must_use]
    pub fn max_instructions(&self) -> u64 {
        self.max_instructions
    }

    pub fn set_max_instructions(&mut self, max: u64) {
        self.max_instructions = max;
    }

    /// Get/set CPU registers.
    pub fn cpu_registers(&mut self) -> &mut Cpu<X> {
        &mut self.cpu
    }

    /// The guest's return value (a0).
    #[must_use]
    pub fn return_value(&self) -> u64 {
        X::to_u64(self.cpu.reg(REG_A0))
    }

    /// System call argument `n` (a0..a6).
    #[must_use]
    pub fn sysarg(&self, n: usize) -> u64 {
        X::to_u64(self.cpu.reg(REG_A0 + n))
    }

    /// Set the system call result (a0).
    pub fn set_result(&mut self, value: i64) {
        self.cpu.set_reg(REG_A0, X::from_i64(value));
    }

    /// Register a syscall by number. The last id is reserved for EBREAK.
    pub fn install_syscall_handler(&mut self, nr: usize, handler: SyscallFn<X>) -> Result<()> {
        if nr >= SYSCALLS_MAX {
            return Err(MachineError::IllegalOperation(
                "system call number out of range",
            ));
        }
        self.syscall_handlers[nr] = Some(handler);
        Ok(())
    }

    /// Invoke a system call handler; missing handlers yield -ENOSYS.
    pub fn system_call(&mut self, nr: u64) -> Result<()> {
        let handler = self
            .syscall_handlers
            .get(nr as usize)
            .and_then(Option::clone);
        match handler {
            Some(handler) => handler.as_ref()(self),
            None => {
                trace!(nr, "unhandled system call");
                self.set_result(-i64::from(ENOSYS));
                Ok(())
            }
        }
    }

    /// SYSTEM-group instruction (EBREAK, CSR accesses).
    pub fn system(&mut self, instr: Instr) -> Result<()> {
        handlers::system_insn(self, instr)
    }

    /// Find or decode the execute segment containing the current PC.
    ///
    /// The PC is read from (and left in) the register file so callbacks
    /// that run during resolution observe the correct address.
    pub fn next_execute_segment(&mut self) -> Result<Arc<ExecuteSegment<X>>> {
        let pc = self.cpu.pc;
        if let Some(seg) = self.segments.iter().find(|s| s.is_within(pc)) {
            let seg = Arc::clone(seg);
            self.cpu.set_current_segment(Arc::clone(&seg));
            return Ok(seg);
        }

        let pageno = pc >> PAGE_SHIFT;
        if !self.page_is_executable(pageno) {
            return Err(MachineError::ExecutionSpaceProtectionFault(pc));
        }
        // Extend over the whole contiguous run of executable pages
        let mut first = pageno;
        while first > 0 && self.page_is_executable(first - 1) {
            first -= 1;
        }
        let mut last = pageno;
        while self.page_is_executable(last + 1) {
            last += 1;
        }

        let begin = first << PAGE_SHIFT;
        let end = (last + 1) << PAGE_SHIFT;
        let mut code = vec![0u8; (end - begin) as usize];
        for p in first..=last {
            let off = ((p - first) << PAGE_SHIFT) as usize;
            if let Some(page) = self.memory.get_page(p) {
                code[off..off + PAGE_SIZE].copy_from_slice(page.data());
            }
        }

        debug!(begin, end, "decoding new execute segment");
        let seg = Arc::new(ExecuteSegment::decode(begin, code, &self.translations));
        self.segments.push(Arc::clone(&seg));
        self.cpu.set_current_segment(Arc::clone(&seg));
        Ok(seg)
    }

    fn page_is_executable(&self, pageno: u64) -> bool {
        self.memory.get_page(pageno).is_some_and(|p| p.attr.exec)
    }

    /// Map raw code at `addr` as an executable area; used by embedders
    /// and tests that don't go through the ELF loader.
    pub fn init_execute_area(&mut self, addr: u64, code: &[u8]) -> Result<()> {
        self.memory.write_from(addr, code)?;
        let attr = if self.options.allow_write_exec_segment {
            rvsim_mem::PageAttributes {
                read: true,
                write: true,
                exec: true,
            }
        } else {
            rvsim_mem::PageAttributes::rx()
        };
        self.memory.set_page_attr(addr, code.len() as u64, attr);
        self.invalidate_segments();
        Ok(())
    }

    /// Drop decoded segments; they are rebuilt on the next fetch.
    pub(crate) fn invalidate_segments(&mut self) {
        self.segments.clear();
        self.cpu.clear_current_segment();
    }

    /// The guest heap arena, when one is installed.
    #[must_use]
    pub fn arena(&self) -> Option<&Arena> {
        self.arena.as_ref()
    }

    pub fn arena_mut(&mut self) -> Option<&mut Arena> {
        self.arena.as_mut()
    }

    pub fn set_arena(&mut self, arena: Arena) {
        self.arena = Some(arena);
    }

    /// Create a copy-on-write child sharing this machine's pages.
    ///
    /// With `minimal_fork` the child starts with an empty page table
    /// instead of loaning pages. Decoded segments, the syscall table and
    /// the arena layout are carried over.
    pub fn fork(&mut self) -> Self {
        let memory = if self.options.minimal_fork {
            self.memory.minimal_fork()
        } else {
            self.memory.fork()
        };
        Self {
            cpu: self.cpu.fork_from(),
            memory,
            options: self.options.clone(),
            segments: self.segments.clone(),
            syscall_handlers: self.syscall_handlers.clone(),
            translations: self.translations.clone(),
            translation_active: self.translation_active,
            arena: self.arena.as_ref().map(Arena::transfer),
            instruction_counter: self.instruction_counter,
            max_instructions: self.max_instructions,
            stopped: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvsim_isa::{asm, Rv64};

    fn simple_machine(code: &[u32]) -> Machine<Rv64> {
        let mut m = Machine::<Rv64>::new(MachineOptions::default());
        m.init_execute_area(0x1_0000, &asm::assemble(code)).unwrap();
        m.cpu.pc = 0x1_0000;
        m
    }

    #[test]
    fn test_simulate_until_stop() {
        let mut m = simple_machine(&[
            asm::addi(10, 0, 42), // a0 = 42
            asm::wfi(),
        ]);
        let reason = m.simulate(u64::MAX).unwrap();
        assert_eq!(reason, StopReason::Stopped);
        assert_eq!(m.return_value(), 42);
        assert_eq!(m.instruction_counter(), 2);
    }

    #[test]
    fn test_step_one_executes_single_instruction() {
        let mut m = simple_machine(&[
            asm::addi(5, 0, 7),
            asm::addi(6, 0, 9),
            asm::wfi(),
        ]);
        m.step_one().unwrap();
        assert_eq!(m.instruction_counter(), 1);
        assert_eq!(Rv64::to_u64(m.cpu.reg(5)), 7);
        assert_eq!(Rv64::to_u64(m.cpu.reg(6)), 0);
        assert_eq!(m.cpu.pc, 0x1_0004);
    }

    #[test]
    fn test_missing_syscall_returns_enosys() {
        let mut m = simple_machine(&[
            asm::addi(17, 0, 123), // a7 = some unhandled syscall
            asm::ecall(),
            asm::wfi(),
        ]);
        m.simulate(u64::MAX).unwrap();
        assert_eq!(m.return_value() as i64, -i64::from(ENOSYS));
    }

    #[test]
    fn test_install_syscall_handler_bounds() {
        let mut m = Machine::<Rv64>::new(MachineOptions::default());
        let handler: SyscallFn<Rv64> = Arc::new(|m| {
            m.set_result(0);
            Ok(())
        });
        assert!(m.install_syscall_handler(SYSCALLS_MAX, handler).is_err());
    }

    #[test]
    fn test_fetch_outside_exec_faults() {
        let mut m = Machine::<Rv64>::new(MachineOptions::default());
        m.cpu.pc = 0x5000;
        assert!(matches!(
            m.simulate(10),
            Err(MachineError::ExecutionSpaceProtectionFault(0x5000))
        ));
    }
}
