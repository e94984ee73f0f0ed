//! CLI definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use rvsim::DispatchMode;

/// Exit code when the emulator itself fails.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "rvsim")]
#[command(about = "User-mode RISC-V emulator")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (sets the log filter to debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a RISC-V ELF program
    Run {
        /// Input ELF file
        #[arg(value_name = "ELF")]
        input: PathBuf,

        /// Stop after this many instructions
        #[arg(long)]
        max_instructions: Option<u64>,

        /// Guest memory ceiling in bytes
        #[arg(long, default_value_t = 64 << 20)]
        memory_max: u64,

        /// Stack size in bytes
        #[arg(long, default_value_t = 1 << 20)]
        stack_size: u64,

        /// Dispatch loop flavor
        #[arg(long, value_enum, default_value = "threaded")]
        dispatch: DispatchModeArg,

        /// Require natural alignment on data accesses
        #[arg(long)]
        force_align: bool,

        /// Print the register bank when execution ends
        #[arg(long)]
        dump_registers: bool,
    },
}

/// Dispatch mode argument.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum DispatchModeArg {
    Switch,
    Threaded,
    Tailcall,
}

impl From<DispatchModeArg> for DispatchMode {
    fn from(arg: DispatchModeArg) -> Self {
        match arg {
            DispatchModeArg::Switch => DispatchMode::Switch,
            DispatchModeArg::Threaded => DispatchMode::Threaded,
            DispatchModeArg::Tailcall => DispatchMode::TailCall,
        }
    }
}
