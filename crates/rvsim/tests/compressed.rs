//! C-extension execution through the compressed fast-path bytecodes.

#![cfg(feature = "compressed")]

use rvsim::{Machine, MachineOptions, Rv64, StopReason, Xlen};
use rvsim_isa::asm;

const CODE_BASE: u64 = 0x1_0000;

/// Mixed 16/32-bit words, assembled little-endian.
enum Word {
    C(u16),
    Full(u32),
}

fn assemble(words: &[Word]) -> Vec<u8> {
    let mut out = Vec::new();
    for word in words {
        match word {
            Word::C(half) => out.extend_from_slice(&half.to_le_bytes()),
            Word::Full(full) => out.extend_from_slice(&full.to_le_bytes()),
        }
    }
    out
}

fn machine_with(words: &[Word]) -> Machine<Rv64> {
    let mut m = Machine::<Rv64>::new(MachineOptions::default());
    m.init_execute_area(CODE_BASE, &assemble(words)).unwrap();
    m.cpu.pc = CODE_BASE;
    m
}

#[test]
fn test_compressed_arithmetic() {
    // c.li a0, 5; c.addi a0, 3; c.mv a1, a0; c.add a0, a1; wfi
    let mut m = machine_with(&[
        Word::C(0x4515),
        Word::C(0x050D),
        Word::C(0x85AA),
        Word::C(0x952E),
        Word::Full(asm::wfi()),
    ]);
    let reason = m.simulate(u64::MAX).unwrap();
    assert_eq!(reason, StopReason::Stopped);
    assert_eq!(m.return_value(), 16);
    assert_eq!(Rv64::to_u64(m.cpu.reg(11)), 8);
    assert_eq!(m.instruction_counter(), 5);
}

#[test]
fn test_compressed_branch_loop() {
    // c.li a5, 8; loop: c.addi a5, -1; c.bnez a5, loop; wfi
    let mut m = machine_with(&[
        Word::C(0x47A1),
        Word::C(0x17FD),
        Word::C(0xFFFD),
        Word::Full(asm::wfi()),
    ]);
    m.simulate(u64::MAX).unwrap();
    assert_eq!(Rv64::to_u64(m.cpu.reg(15)), 0);
    assert_eq!(m.instruction_counter(), 18);
}

#[test]
fn test_compressed_jump_skips() {
    // c.j +4 skips the c.addi; c.li a0, 7; wfi
    let mut m = machine_with(&[
        Word::C(0xA011),
        Word::C(0x0505), // c.addi a0, 1 (skipped)
        Word::C(0x451D), // c.li a0, 7
        Word::Full(asm::wfi()),
    ]);
    m.simulate(u64::MAX).unwrap();
    assert_eq!(m.return_value(), 7);
    assert_eq!(m.instruction_counter(), 3);
}

#[test]
fn test_mixed_width_stream_matches_interpreter() {
    let words = [
        Word::C(0x4515),                  // c.li a0, 5
        Word::Full(asm::slli(11, 10, 4)), // a1 = a0 << 4
        Word::C(0x952E),                  // c.add a0, a1
        Word::Full(asm::addi(12, 10, -1)),
        Word::Full(asm::wfi()),
    ];

    let mut fast = machine_with(&words);
    fast.simulate(u64::MAX).unwrap();

    let mut golden = machine_with(&words);
    while !golden.stopped() {
        golden.step_one().unwrap();
    }

    for reg in 0..32 {
        assert_eq!(fast.cpu.reg(reg), golden.cpu.reg(reg), "x{reg} diverged");
    }
    assert_eq!(fast.instruction_counter(), golden.instruction_counter());
}

#[test]
fn test_jump_into_instruction_middle_faults() {
    // With 2-byte slots, the upper half of a 4-byte instruction is an
    // invalid entry; a jump into it must fault rather than misdecode.
    let mut m = machine_with(&[
        Word::Full(asm::jalr(0, 6, 0)),
        Word::Full(asm::wfi()),
    ]);
    m.cpu.set_reg(6, CODE_BASE + 2);
    let err = m.simulate(u64::MAX).unwrap_err();
    assert!(matches!(err, rvsim::MachineError::IllegalOpcode { .. }));
}
