//! Maps an ELF image into guest memory.
//!
//! Lays the address space out as `[image][brk reserve][native heap]
//! [mmap region ... stack]`, applies segment protections, builds the
//! initial stack and installs the exit trampoline the guest returns to
//! when `main` falls off the end.

use rvsim_elf::ElfImage;
use rvsim_isa::{Xlen, REG_RA, REG_SP};
use rvsim_mem::{page_round_up, PageAttributes, PAGE_SIZE};
use tracing::{debug, info};

use crate::error::{MachineError, Result};
use crate::machine::Machine;
use crate::syscalls::{BRK_MAX, NATIVE_HEAP_SIZE};

/// The custom stop encoding placed in the exit trampoline.
const STOP_INSTRUCTION: u32 = 0x7FF0_0073;

/// Map `image` into the machine and prepare it for execution.
pub fn load_image<X: Xlen>(machine: &mut Machine<X>, image: &ElfImage<X>) -> Result<()> {
    if image.is_dynamic && !machine.options.dynamic_linking {
        return Err(MachineError::InvalidProgram(
            "dynamically linked binary (enable dynamic_linking)".into(),
        ));
    }

    let memory_max = machine.memory.memory_max();
    let stack_size = machine.options.stack_size;
    if image.highest_address() + stack_size >= memory_max {
        return Err(MachineError::InvalidProgram(format!(
            "image end 0x{:x} does not fit below the stack",
            image.highest_address()
        )));
    }

    for segment in &image.segments {
        if machine.options.verbose_loader {
            info!(
                start = format_args!("0x{:x}", segment.virtual_start),
                end = format_args!("0x{:x}", segment.virtual_end),
                filesz = segment.filesz(),
                flags = segment.flags,
                "loading segment"
            );
        }
        machine
            .memory
            .write_from(segment.virtual_start, &segment.data)?;
        // The filesz..memsz span is BSS; pages default to zero

        if machine.options.protect_segments {
            let mut attr = PageAttributes {
                read: true,
                write: segment.is_writable(),
                exec: segment.is_executable(),
            };
            if attr.exec {
                if !machine.options.allow_write_exec_segment {
                    attr.write = false;
                }
                if machine.options.enforce_exec_only {
                    attr.read = false;
                }
            }
            machine
                .memory
                .set_page_attr(segment.virtual_start, segment.memsz(), attr);
        } else if segment.is_executable() {
            // Execution still requires the exec attribute
            machine.memory.set_page_attr(
                segment.virtual_start,
                segment.memsz(),
                PageAttributes {
                    read: true,
                    write: true,
                    exec: true,
                },
            );
        }
    }

    // Address space layout after the image
    let heap = page_round_up(image.highest_address());
    machine.memory.set_heap_address(heap);
    machine.memory.set_brk(heap);
    machine
        .memory
        .set_mmap_start(page_round_up(heap + BRK_MAX + NATIVE_HEAP_SIZE));

    // Stack at the top of memory
    let stack_top = memory_max;
    let stack_bottom = stack_top - stack_size;
    machine.memory.set_page_attr(stack_bottom, stack_size, PageAttributes::rw());

    // Exit trampoline one page below the stack: returning from the
    // start function lands on a stop instruction
    let exit_addr = match &machine.options.default_exit_function {
        Some(symbol) => image.lookup_function(symbol).ok_or_else(|| {
            MachineError::InvalidProgram(format!("exit function '{symbol}' not found"))
        })?,
        None => {
            let trampoline = stack_bottom - PAGE_SIZE as u64;
            machine
                .memory
                .write::<u32>(trampoline, STOP_INSTRUCTION)?;
            machine
                .memory
                .set_page_attr(trampoline, 4, PageAttributes::rx());
            trampoline
        }
    };

    // Initial stack: argc = 0, argv and envp empty
    let mut sp = stack_top - 32;
    sp &= !0xF;
    machine.memory.write::<u64>(sp, 0)?; // argc
    machine.memory.write::<u64>(sp + 8, 0)?; // argv terminator
    machine.memory.write::<u64>(sp + 16, 0)?; // envp terminator

    if machine.options.use_memory_arena {
        // Pre-allocate the brk reserve contiguously for locality
        machine.memory.memset(heap, 0, BRK_MAX)?;
    }

    let entry = X::to_u64(image.entry_point);
    machine.memory.set_start_address(entry);
    machine.memory.set_stack_initial(sp);
    machine.cpu.set_reg(REG_SP, X::from_u64(sp));
    machine.cpu.set_reg(REG_RA, X::from_u64(exit_addr));
    machine.cpu.jump(entry)?;
    machine.invalidate_segments();

    debug!(
        entry = format_args!("0x{entry:x}"),
        heap = format_args!("0x{heap:x}"),
        mmap = format_args!("0x{:x}", machine.memory.mmap_start()),
        stack = format_args!("0x{sp:x}"),
        "program loaded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::MachineOptions;
    use rvsim_elf::PF_R;
    use rvsim_elf::PF_X;
    use rvsim_isa::{asm, Rv64};

    fn minimal_elf64(entry: u64, vaddr: u64, code: &[u8], flags: u32) -> Vec<u8> {
        let mut out = vec![0u8; 64 + 56];
        out[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        out[16..18].copy_from_slice(&2u16.to_le_bytes());
        out[18..20].copy_from_slice(&243u16.to_le_bytes());
        out[24..32].copy_from_slice(&entry.to_le_bytes());
        out[32..40].copy_from_slice(&64u64.to_le_bytes());
        out[54..56].copy_from_slice(&56u16.to_le_bytes());
        out[56..58].copy_from_slice(&1u16.to_le_bytes());
        let file_offset = out.len() as u64;
        let mut ph = vec![0u8; 56];
        ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        ph[4..8].copy_from_slice(&flags.to_le_bytes());
        ph[8..16].copy_from_slice(&file_offset.to_le_bytes());
        ph[16..24].copy_from_slice(&vaddr.to_le_bytes());
        ph[32..40].copy_from_slice(&(code.len() as u64).to_le_bytes());
        ph[40..48].copy_from_slice(&(code.len() as u64).to_le_bytes());
        out[64..120].copy_from_slice(&ph);
        out.extend_from_slice(code);
        out
    }

    #[test]
    fn test_load_and_run_elf() {
        let code = asm::assemble(&[asm::addi(10, 0, 9), asm::wfi()]);
        let elf = minimal_elf64(0x1_0000, 0x1_0000, &code, PF_R | PF_X);
        let mut m = Machine::<Rv64>::from_elf(&elf, MachineOptions::default()).unwrap();

        assert_eq!(m.cpu.pc, 0x1_0000);
        assert_ne!(Rv64::to_u64(m.cpu.reg(rvsim_isa::REG_SP)), 0);

        m.simulate(u64::MAX).unwrap();
        assert_eq!(m.return_value(), 9);
    }

    #[test]
    fn test_exec_segment_not_writable() {
        let code = asm::assemble(&[asm::wfi()]);
        let elf = minimal_elf64(0x1_0000, 0x1_0000, &code, PF_R | PF_X);
        let mut m = Machine::<Rv64>::from_elf(&elf, MachineOptions::default()).unwrap();
        assert!(m.memory.write::<u32>(0x1_0000, 0).is_err());
    }

    #[test]
    fn test_return_to_exit_trampoline_stops() {
        // A program that just returns: ra points at the exit trampoline
        let code = asm::assemble(&[asm::addi(10, 0, 3), asm::jalr(0, rvsim_isa::REG_RA, 0)]);
        let elf = minimal_elf64(0x1_0000, 0x1_0000, &code, PF_R | PF_X);
        let mut m = Machine::<Rv64>::from_elf(&elf, MachineOptions::default()).unwrap();
        let reason = m.simulate(u64::MAX).unwrap();
        assert_eq!(reason, crate::error::StopReason::Stopped);
        assert_eq!(m.return_value(), 3);
    }
}
