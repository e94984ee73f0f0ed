//! Machine construction options.

use rvsim_mem::PageFaultHandler;

/// Extension toggles fixed at build time. The decoder refuses encodings
/// from disabled extensions instead of branching at runtime.
pub const ATOMICS_ENABLED: bool = cfg!(feature = "atomics");
pub const FLOAT_ENABLED: bool = cfg!(feature = "float");
pub const COMPRESSED_ENABLED: bool = cfg!(feature = "compressed");
pub const VECTOR_ENABLED: bool = cfg!(feature = "vector");

/// Interpreter loop flavor. All modes share the same bytecode table and
/// agree bit-for-bit on architectural state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Match-based loop; the portable baseline.
    Switch,
    /// Function-pointer table indexed by bytecode.
    #[default]
    Threaded,
    /// Continuation-passing trampoline.
    TailCall,
}

/// Machine configuration.
pub struct MachineOptions {
    /// Guest memory ceiling.
    pub memory_max: u64,
    /// Stack size, carved from the top of memory.
    pub stack_size: u64,
    /// Hart id reported to the guest.
    pub cpu_id: u32,
    /// Load the program image on construction.
    pub load_program: bool,
    /// Apply ELF segment protections to guest pages.
    pub protect_segments: bool,
    /// Permit segments that are both writable and executable.
    pub allow_write_exec_segment: bool,
    /// Strip read from execute-only segments.
    pub enforce_exec_only: bool,
    /// Log the memory layout while loading.
    pub verbose_loader: bool,
    /// Accept dynamically linked binaries (experimental).
    pub dynamic_linking: bool,
    /// Fork without loaning pages from the source machine.
    pub minimal_fork: bool,
    /// Pre-allocate the heap region contiguously for locality.
    pub use_memory_arena: bool,
    /// Override the exit trampoline with a program symbol.
    pub default_exit_function: Option<String>,
    /// Require natural alignment on all data accesses.
    pub force_align_memory: bool,
    /// Interpreter loop flavor.
    pub dispatch: DispatchMode,
    /// Host hook consulted before the default unmapped-page policy.
    pub page_fault_handler: Option<PageFaultHandler>,

    // Binary translator knobs
    /// Minimum block size worth handing to a translator.
    pub block_size_treshold: u32,
    /// Upper bound on translated blocks.
    pub translate_blocks_max: u32,
    /// Upper bound on translated instructions.
    pub translate_instr_max: u32,
}

impl Clone for MachineOptions {
    /// Clones every knob; the page fault handler is not clonable and
    /// resets to `None`.
    fn clone(&self) -> Self {
        Self {
            memory_max: self.memory_max,
            stack_size: self.stack_size,
            cpu_id: self.cpu_id,
            load_program: self.load_program,
            protect_segments: self.protect_segments,
            allow_write_exec_segment: self.allow_write_exec_segment,
            enforce_exec_only: self.enforce_exec_only,
            verbose_loader: self.verbose_loader,
            dynamic_linking: self.dynamic_linking,
            minimal_fork: self.minimal_fork,
            use_memory_arena: self.use_memory_arena,
            default_exit_function: self.default_exit_function.clone(),
            force_align_memory: self.force_align_memory,
            dispatch: self.dispatch,
            page_fault_handler: None,
            block_size_treshold: self.block_size_treshold,
            translate_blocks_max: self.translate_blocks_max,
            translate_instr_max: self.translate_instr_max,
        }
    }
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            memory_max: 64 << 20,
            stack_size: 1 << 20,
            cpu_id: 0,
            load_program: true,
            protect_segments: true,
            allow_write_exec_segment: false,
            enforce_exec_only: false,
            verbose_loader: false,
            dynamic_linking: false,
            minimal_fork: false,
            use_memory_arena: false,
            default_exit_function: None,
            force_align_memory: false,
            dispatch: DispatchMode::default(),
            page_fault_handler: None,
            block_size_treshold: 6,
            translate_blocks_max: 5000,
            translate_instr_max: 150_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = MachineOptions::default();
        assert_eq!(opts.memory_max, 64 << 20);
        assert_eq!(opts.stack_size, 1 << 20);
        assert!(opts.protect_segments);
        assert!(!opts.minimal_fork);
        assert_eq!(opts.dispatch, DispatchMode::Threaded);
    }
}
