//! End-to-end machine scenarios with hand-assembled guest programs.

use rvsim::syscalls::{self, SYS_EXIT};
use rvsim::{Machine, MachineError, MachineOptions, Rv64, StopReason, Xlen};
use rvsim_isa::asm;

const CODE_BASE: u64 = 0x1_0000;

fn machine_with(code: &[u32]) -> Machine<Rv64> {
    let mut m = Machine::<Rv64>::new(MachineOptions::default());
    m.init_execute_area(CODE_BASE, &asm::assemble(code)).unwrap();
    m.cpu.pc = CODE_BASE;
    m
}

/// Iterated Fibonacci: 20 rounds of fib(30), exit through ECALL.
fn fibonacci_program() -> Vec<u32> {
    vec![
        asm::addi(28, 0, 20), // rounds
        // outer:
        asm::addi(10, 0, 0),  // a = fib(0)
        asm::addi(11, 0, 1),  // b = fib(1)
        asm::addi(12, 0, 30), // n
        // loop:
        asm::add(13, 10, 11), // t = a + b
        asm::addi(10, 11, 0), // a = b
        asm::addi(11, 13, 0), // b = t
        asm::addi(12, 12, -1),
        asm::bne(12, 0, -16),
        asm::addi(28, 28, -1),
        asm::bne(28, 0, -36),
        asm::addi(17, 0, SYS_EXIT as i32),
        asm::ecall(),
    ]
}

#[test]
fn test_fibonacci_rv64() {
    let mut m = machine_with(&fibonacci_program());
    syscalls::setup_linux_syscalls(&mut m).unwrap();

    let reason = m.simulate(u64::MAX).unwrap();

    assert_eq!(reason, StopReason::Stopped);
    assert_eq!(m.return_value(), 832_040);
    let count = m.instruction_counter();
    assert!((2_000..20_000).contains(&count), "count = {count}");
}

#[test]
fn test_counter_overflow_resumes_precisely() {
    // Each loop iteration is one two-instruction block
    let mut m = machine_with(&[
        asm::addi(6, 6, 1),
        asm::jal(0, -4),
    ]);

    let reason = m.simulate(100).unwrap();
    assert_eq!(reason, StopReason::InstructionLimit);
    assert_eq!(m.instruction_counter(), 100);
    // The PC points at the next instruction to execute
    assert_eq!(m.cpu.pc, CODE_BASE);
    assert_eq!(Rv64::to_u64(m.cpu.reg(6)), 50);

    // Resuming continues exactly where we left off
    let reason = m.simulate(100).unwrap();
    assert_eq!(reason, StopReason::InstructionLimit);
    assert_eq!(m.instruction_counter(), 200);
    assert_eq!(Rv64::to_u64(m.cpu.reg(6)), 100);
}

// With the C extension the alignment rule relaxes to 2 bytes and this
// target stops being misaligned.
#[test]
#[cfg(not(feature = "compressed"))]
fn test_jalr_alignment_fault() {
    let mut m = machine_with(&[
        asm::lui(6, 0x1_0000),
        asm::addi(6, 6, 2), // 0x10002: not 4-byte aligned
        asm::jalr(1, 6, 0),
    ]);

    let err = m.simulate(u64::MAX).unwrap_err();
    assert_eq!(err, MachineError::MisalignedInstruction(0x1_0002));
    assert_eq!(err.data(), Some(0x1_0002));
    assert_eq!(m.cpu.pc, 0x1_0002);
}

#[test]
fn test_cow_fork_isolation() {
    let mut parent = machine_with(&[asm::wfi()]);
    parent.memory.write::<u16>(0x9000, 0xDEAD).unwrap();

    let mut child = parent.fork();
    child.memory.write::<u16>(0x9000, 0xBEEF).unwrap();

    assert_eq!(parent.memory.read::<u16>(0x9000).unwrap(), 0xDEAD);
    assert_eq!(child.memory.read::<u16>(0x9000).unwrap(), 0xBEEF);

    // The child executes independently with inherited register state
    child.cpu.set_reg(10, 7);
    child.simulate(u64::MAX).unwrap();
    assert_eq!(child.return_value(), 7);
    assert_eq!(parent.memory.read::<u16>(0x9000).unwrap(), 0xDEAD);
}

#[test]
fn test_minimal_fork_shares_nothing() {
    let options = MachineOptions {
        minimal_fork: true,
        ..MachineOptions::default()
    };
    let mut parent = Machine::<Rv64>::new(options);
    parent.memory.write::<u64>(0x9000, 123).unwrap();

    let child = parent.fork();
    // The child faults pages in itself: unmapped reads are zero
    assert_eq!(child.memory.read::<u64>(0x9000).unwrap(), 0);
    assert_eq!(child.memory.pages_active(), 0);
}

#[test]
fn test_cross_segment_call_and_return() {
    // Two executable areas separated by an unmapped gap become two
    // segments; jalr crosses between them and back.
    let mut m = Machine::<Rv64>::new(MachineOptions::default());
    let callee = 0x4_0000;
    m.init_execute_area(
        CODE_BASE,
        &asm::assemble(&[
            asm::lui(6, callee as i32),
            asm::jalr(1, 6, 0), // call the far function
            asm::wfi(),
        ]),
    )
    .unwrap();
    m.init_execute_area(
        callee,
        &asm::assemble(&[
            asm::addi(10, 0, 55),
            asm::jalr(0, 1, 0), // return
        ]),
    )
    .unwrap();
    m.cpu.pc = CODE_BASE;

    let reason = m.simulate(u64::MAX).unwrap();
    assert_eq!(reason, StopReason::Stopped);
    assert_eq!(m.return_value(), 55);
    assert_eq!(m.instruction_counter(), 5);
}

#[test]
fn test_x0_stays_zero() {
    let mut m = machine_with(&[
        asm::addi(0, 0, 123), // folds to NOP at decode
        asm::add(0, 5, 6),    // also a NOP
        asm::addi(10, 0, 1),
        asm::wfi(),
    ]);
    m.cpu.set_reg(5, 50);
    m.cpu.set_reg(6, 60);
    m.simulate(u64::MAX).unwrap();
    assert_eq!(Rv64::to_u64(m.cpu.reg(0)), 0);
    assert_eq!(m.return_value(), 1);
}

#[test]
fn test_illegal_instruction_faults() {
    // An all-ones word is not a valid encoding group we implement
    let mut m = machine_with(&[0xFFFF_FFFF, asm::wfi()]);
    let err = m.simulate(u64::MAX).unwrap_err();
    assert!(matches!(
        err,
        MachineError::UnimplementedInstruction { .. } | MachineError::IllegalOpcode { .. }
    ));
}

#[test]
fn test_branch_out_of_segment_is_invalid() {
    // A branch whose target leaves the segment is rewritten to Invalid
    // at decode time; the fault is deferred until the entry is reached.
    let mut m = machine_with(&[
        asm::addi(10, 0, 2),
        asm::beq(0, 0, -2048), // target is below the code page
        asm::wfi(),
    ]);
    let err = m.simulate(u64::MAX).unwrap_err();
    assert!(matches!(err, MachineError::IllegalOpcode { .. }));
    // The instructions before the invalid entry still ran
    assert_eq!(m.return_value(), 2);
}

#[test]
fn test_write_to_exec_segment_faults() {
    let mut m = machine_with(&[asm::wfi()]);
    // init_execute_area applies R+X
    assert!(matches!(
        m.memory.write::<u32>(CODE_BASE, 0),
        Err(rvsim_mem::MemoryError::ProtectionFault(_))
    ));
}

#[test]
fn test_stop_reports_next_pc() {
    let mut m = machine_with(&[asm::nop(), asm::wfi()]);
    let reason = m.simulate(u64::MAX).unwrap();
    assert_eq!(reason, StopReason::Stopped);
    // The PC is parked after the stop instruction
    assert_eq!(m.cpu.pc, CODE_BASE + 8);
    assert_eq!(m.instruction_counter(), 2);
}
