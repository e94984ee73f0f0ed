//! The three dispatch modes must agree bit-for-bit on architectural
//! state, and all of them must match the slow-path interpreter.

use rvsim::syscalls::{self, SYS_EXIT};
use rvsim::{DispatchMode, Machine, MachineOptions, Rv64, Xlen, NUM_REGS};
use rvsim_isa::asm;

const CODE_BASE: u64 = 0x1_0000;
const DATA_BASE: i32 = 0x2_0000;

const MODES: [DispatchMode; 3] = [
    DispatchMode::Switch,
    DispatchMode::Threaded,
    DispatchMode::TailCall,
];

fn machine_with(code: &[u32], dispatch: DispatchMode) -> Machine<Rv64> {
    let options = MachineOptions {
        dispatch,
        ..MachineOptions::default()
    };
    let mut m = Machine::<Rv64>::new(options);
    m.init_execute_area(CODE_BASE, &asm::assemble(code)).unwrap();
    m.cpu.pc = CODE_BASE;
    syscalls::setup_linux_syscalls(&mut m).unwrap();
    m
}

fn state_of(m: &Machine<Rv64>) -> (Vec<u64>, u64, u64) {
    let regs = (0..NUM_REGS).map(|i| Rv64::to_u64(m.cpu.reg(i))).collect();
    (regs, m.cpu.pc, m.instruction_counter())
}

/// A branchy, memory-touching workload.
fn workload() -> Vec<u32> {
    let mut code = vec![
        asm::lui(5, DATA_BASE),   // x5 = scratch base
        asm::addi(6, 0, 64),      // loop counter
        asm::addi(7, 0, 0),       // accumulator
        // loop:
        asm::mul(8, 6, 6),
        asm::add(7, 7, 8),
        asm::sw(5, 7, 0),
        asm::lw(9, 5, 0),
        asm::xor(10, 9, 6),
        asm::sd(5, 10, 8),
        asm::ld(11, 5, 8),
        asm::srai(12, 11, 3),
        asm::addi(6, 6, -1),
        asm::bne(6, 0, -36),
        // tail
        asm::addi(10, 7, 0),
        asm::addi(17, 0, SYS_EXIT as i32),
        asm::ecall(),
    ];
    // A stretch of straight-line filler long enough to force a block
    // split, never executed (after ecall)
    code.extend(std::iter::repeat_n(asm::addi(13, 13, 1), 300));
    code
}

#[test]
fn test_modes_agree_on_completion() {
    let mut reference: Option<(Vec<u64>, u64, u64)> = None;
    for mode in MODES {
        let mut m = machine_with(&workload(), mode);
        m.simulate(u64::MAX).unwrap();
        let state = state_of(&m);
        match &reference {
            None => reference = Some(state),
            Some(expected) => assert_eq!(&state, expected, "mode {mode:?} diverged"),
        }
    }
}

#[test]
fn test_modes_agree_under_instruction_limit() {
    for limit in [1, 7, 50, 173, 400] {
        let mut reference: Option<(Vec<u64>, u64, u64)> = None;
        for mode in MODES {
            let mut m = machine_with(&workload(), mode);
            let _ = m.simulate(limit).unwrap();
            let state = state_of(&m);
            match &reference {
                None => reference = Some(state),
                Some(expected) => {
                    assert_eq!(&state, expected, "mode {mode:?} diverged at limit {limit}");
                }
            }
        }
    }
}

/// Deterministic pseudo-random straight-line instruction stream.
fn random_alu_program(samples: usize) -> Vec<u32> {
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    let mut rng = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    let mut code = vec![
        asm::lui(5, DATA_BASE), // memory base, never clobbered below
    ];
    for _ in 0..samples {
        let rd = 6 + (rng() % 10) as usize; // x6..x15
        let rs1 = (rng() % 16) as usize;
        let rs2 = (rng() % 16) as usize;
        let imm = (rng() % 4096) as i32 - 2048;
        let shamt = (rng() % 64) as u32;
        let offset = ((rng() % 128) * 8) as i32;
        let instr = match rng() % 27 {
            0 => asm::addi(rd, rs1, imm),
            1 => asm::slti(rd, rs1, imm),
            2 => asm::sltiu(rd, rs1, imm),
            3 => asm::xori(rd, rs1, imm),
            4 => asm::ori(rd, rs1, imm),
            5 => asm::andi(rd, rs1, imm),
            6 => asm::slli(rd, rs1, shamt),
            7 => asm::srli(rd, rs1, shamt),
            8 => asm::srai(rd, rs1, shamt),
            9 => asm::add(rd, rs1, rs2),
            10 => asm::sub(rd, rs1, rs2),
            11 => asm::sll(rd, rs1, rs2),
            12 => asm::slt(rd, rs1, rs2),
            13 => asm::sltu(rd, rs1, rs2),
            14 => asm::xor(rd, rs1, rs2),
            15 => asm::srl(rd, rs1, rs2),
            16 => asm::sra(rd, rs1, rs2),
            17 => asm::or(rd, rs1, rs2),
            18 => asm::and(rd, rs1, rs2),
            19 => asm::mul(rd, rs1, rs2),
            20 => asm::mulhu(rd, rs1, rs2),
            21 => asm::div(rd, rs1, rs2),
            22 => asm::rem(rd, rs1, rs2),
            23 => asm::addw(rd, rs1, rs2),
            24 => asm::addiw(rd, rs1, imm),
            25 => asm::sw(5, rs2, offset),
            _ => asm::lw(rd, 5, offset),
        };
        code.push(instr);
    }
    code.push(asm::wfi());
    code
}

#[test]
fn test_dispatch_matches_interpreter_on_random_stream() {
    let program = random_alu_program(10_000);

    // Golden: the slow-path interpreter, one instruction at a time
    let mut golden = machine_with(&program, DispatchMode::Switch);
    while !golden.stopped() {
        golden.step_one().unwrap();
        if golden.stopped() {
            break;
        }
    }

    for mode in MODES {
        let mut m = machine_with(&program, mode);
        m.simulate(u64::MAX).unwrap();
        assert_eq!(
            state_of(&m).0,
            state_of(&golden).0,
            "mode {mode:?} diverged from the interpreter"
        );
        assert_eq!(m.instruction_counter(), golden.instruction_counter());
    }
}
