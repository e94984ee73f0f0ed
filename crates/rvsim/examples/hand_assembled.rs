//! Run a hand-assembled guest program without an ELF.
//!
//! ```console
//! cargo run --example hand_assembled
//! ```

use rvsim::syscalls::{self, SYS_EXIT};
use rvsim::{Machine, MachineOptions, Rv64};
use rvsim_isa::asm;

fn main() -> anyhow::Result<()> {
    let code = asm::assemble(&[
        asm::addi(10, 0, 0),  // a0 = 0
        asm::addi(5, 0, 100), // t0 = 100
        // loop: a0 += t0; t0 -= 1
        asm::add(10, 10, 5),
        asm::addi(5, 5, -1),
        asm::bne(5, 0, -8),
        // exit(a0)
        asm::addi(17, 0, SYS_EXIT as i32),
        asm::ecall(),
    ]);

    let mut machine = Machine::<Rv64>::new(MachineOptions::default());
    machine.init_execute_area(0x1_0000, &code)?;
    machine.cpu.pc = 0x1_0000;
    syscalls::setup_linux_syscalls(&mut machine)?;

    machine.simulate(u64::MAX)?;

    println!(
        "sum(1..=100) = {} in {} instructions",
        machine.return_value(),
        machine.instruction_counter()
    );
    Ok(())
}
