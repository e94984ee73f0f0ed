//! rvsim CLI — run RISC-V ELF programs.

mod cli;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use rvsim::{get_elf_xlen, Machine, MachineOptions, Rv32, Rv64, StopReason, Xlen};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, EXIT_FAILURE};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("rvsim: {err:#}");
            ExitCode::from(EXIT_FAILURE as u8)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    let Commands::Run {
        input,
        max_instructions,
        memory_max,
        stack_size,
        dispatch,
        force_align,
        dump_registers,
    } = cli.command;

    let binary = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
    let options = MachineOptions {
        memory_max,
        stack_size,
        dispatch: dispatch.into(),
        force_align_memory: force_align,
        ..MachineOptions::default()
    };

    let imax = max_instructions.unwrap_or(u64::MAX);
    match get_elf_xlen(&binary)? {
        32 => execute::<Rv32>(&binary, options, imax, dump_registers),
        64 => execute::<Rv64>(&binary, options, imax, dump_registers),
        other => anyhow::bail!("unsupported ELF class (XLEN {other})"),
    }
}

fn execute<X: Xlen>(
    binary: &[u8],
    options: MachineOptions,
    imax: u64,
    dump_registers: bool,
) -> anyhow::Result<u8> {
    let mut machine = Machine::<X>::from_elf(binary, options)?;
    rvsim::syscalls::setup_linux_syscalls(&mut machine)?;
    rvsim::syscalls::setup_default_native_heap(&mut machine)?;

    let reason = machine.simulate(imax)?;

    if dump_registers {
        eprintln!("{}", machine.cpu.to_string_dump());
    }
    match reason {
        StopReason::Stopped => {
            info!(
                instructions = machine.instruction_counter(),
                exit = machine.return_value(),
                "program stopped"
            );
        }
        StopReason::InstructionLimit => {
            warn!(
                instructions = machine.instruction_counter(),
                pc = format_args!("0x{:x}", machine.cpu.pc),
                "instruction limit reached"
            );
        }
    }
    Ok(machine.return_value() as u8)
}
