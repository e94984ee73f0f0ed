//! System call plumbing and the built-in Linux subset.
//!
//! The machine core only owns the dispatch table; this module installs
//! the handlers a user-mode guest needs: process exit, brk, write to
//! the standard streams, the mmap family, and the host-side heap
//! service calls backed by the arena.

use std::io::Write;
use std::sync::Arc;

use rvsim_isa::Xlen;
use rvsim_mem::{page_round_up, Arena, PageAttributes, PAGE_MASK};
use tracing::trace;

use crate::error::Result;
use crate::machine::Machine;

/// Size of the system call table.
pub const SYSCALLS_MAX: usize = 512;

/// The last syscall id is reserved for EBREAK.
pub const SYSCALL_EBREAK: usize = SYSCALLS_MAX - 1;

pub const ENOSYS: i32 = 38;
pub const EINVAL: i32 = 22;
pub const EBADF: i32 = 9;
pub const ENOMEM: i32 = 12;

// Linux syscall numbers (RISC-V ABI)
pub const SYS_WRITE: usize = 64;
pub const SYS_EXIT: usize = 93;
pub const SYS_EXIT_GROUP: usize = 94;
pub const SYS_MREMAP: usize = 163;
pub const SYS_BRK: usize = 214;
pub const SYS_MUNMAP: usize = 215;
pub const SYS_MMAP: usize = 222;
pub const SYS_MPROTECT: usize = 226;
pub const SYS_MADVISE: usize = 233;

// Host-side heap service calls, outside the kernel's number space
pub const SYS_NATIVE_MALLOC: usize = 480;
pub const SYS_NATIVE_CALLOC: usize = 481;
pub const SYS_NATIVE_REALLOC: usize = 482;
pub const SYS_NATIVE_FREE: usize = 483;
pub const SYS_NATIVE_MEMINFO: usize = 484;

pub const MAP_ANONYMOUS: u64 = 0x20;

/// How far brk may advance past the initial heap address.
pub const BRK_MAX: u64 = 0x40_0000;

/// Install the default Linux syscall subset.
pub fn setup_linux_syscalls<X: Xlen>(machine: &mut Machine<X>) -> Result<()> {
    machine.install_syscall_handler(
        SYS_EXIT,
        Arc::new(|m: &mut Machine<X>| {
            trace!(code = m.sysarg(0), "exit");
            m.stop();
            Ok(())
        }),
    )?;
    machine.install_syscall_handler(
        SYS_EXIT_GROUP,
        Arc::new(|m: &mut Machine<X>| {
            m.stop();
            Ok(())
        }),
    )?;
    machine.install_syscall_handler(
        SYS_BRK,
        Arc::new(|m: &mut Machine<X>| {
            let requested = m.sysarg(0);
            let heap = m.memory.heap_address();
            if requested >= heap && requested <= heap + BRK_MAX {
                m.memory.set_brk(requested);
            }
            let brk = m.memory.brk();
            m.set_result(brk.cast_signed());
            Ok(())
        }),
    )?;
    machine.install_syscall_handler(
        SYS_WRITE,
        Arc::new(|m: &mut Machine<X>| {
            let fd = m.sysarg(0).cast_signed();
            let addr = m.sysarg(1);
            let len = m.sysarg(2);
            if fd != 1 && fd != 2 {
                m.set_result(-i64::from(EBADF));
                return Ok(());
            }
            let mut buf = vec![0u8; len as usize];
            m.memory.read_into(addr, &mut buf)?;
            let written = if fd == 1 {
                std::io::stdout().write(&buf)
            } else {
                std::io::stderr().write(&buf)
            };
            m.set_result(written.map_or(-i64::from(EBADF), |n| n as i64));
            Ok(())
        }),
    )?;
    add_mman_syscalls(machine)
}

/// Linux memory mapping system call emulation.
fn add_mman_syscalls<X: Xlen>(machine: &mut Machine<X>) -> Result<()> {
    // munmap
    machine.install_syscall_handler(
        SYS_MUNMAP,
        Arc::new(|m: &mut Machine<X>| {
            let addr = m.sysarg(0);
            let len = m.sysarg(1);
            trace!(addr, len, "munmap");
            m.memory.free_pages(addr, len);
            // A free that ends exactly at the cursor retracts it
            m.memory.mmap_retract(addr, len);
            m.set_result(0);
            Ok(())
        }),
    )?;
    // mmap
    machine.install_syscall_handler(
        SYS_MMAP,
        Arc::new(|m: &mut Machine<X>| {
            let addr_g = m.sysarg(0);
            let length = m.sysarg(1);
            let prot = m.sysarg(2) as u32;
            let flags = m.sysarg(3);
            trace!(addr_g, length, prot, flags, "mmap");
            if addr_g & PAGE_MASK != 0 {
                m.set_result(-1); // MAP_FAILED
                return Ok(());
            }
            let length = page_round_up(length);
            let nextfree = m.memory.mmap_address();
            if addr_g == 0 || addr_g == nextfree {
                if nextfree + length > m.memory.memory_max() {
                    m.set_result(-i64::from(ENOMEM));
                    return Ok(());
                }
                // Anonymous pages are already zero through CoW
                let addr = m.memory.mmap_allocate(length);
                m.set_result(addr.cast_signed());
            } else if addr_g < nextfree {
                // Lax fixed-mapping emulation: hand the hint back
                // untouched instead of failing
                m.set_result(addr_g.cast_signed());
            } else {
                m.set_result(addr_g.cast_signed());
            }
            Ok(())
        }),
    )?;
    // mremap
    machine.install_syscall_handler(
        SYS_MREMAP,
        Arc::new(|m: &mut Machine<X>| {
            let old_addr = m.sysarg(0);
            let old_size = page_round_up(m.sysarg(1));
            let new_size = page_round_up(m.sysarg(2));
            trace!(old_addr, old_size, new_size, "mremap");
            // Only the common case of growing the last mapping
            if old_addr + old_size == m.memory.mmap_address() {
                m.memory.set_mmap_address(old_addr + new_size);
                m.set_result(old_addr.cast_signed());
                return Ok(());
            }
            m.set_result(-1);
            Ok(())
        }),
    )?;
    // mprotect
    machine.install_syscall_handler(
        SYS_MPROTECT,
        Arc::new(|m: &mut Machine<X>| {
            let addr = m.sysarg(0);
            let len = m.sysarg(1);
            let prot = m.sysarg(2) as u32;
            trace!(addr, len, prot, "mprotect");
            m.memory
                .set_page_attr(addr, len, PageAttributes::from_prot(prot));
            m.set_result(0);
            Ok(())
        }),
    )?;
    // madvise
    machine.install_syscall_handler(
        SYS_MADVISE,
        Arc::new(|m: &mut Machine<X>| {
            let addr = m.sysarg(0);
            let len = m.sysarg(1);
            let advice = m.sysarg(2).cast_signed();
            trace!(addr, len, advice, "madvise");
            match advice {
                // NORMAL, RANDOM, SEQUENTIAL, WILLNEED
                0..=3 => m.set_result(0),
                // DONTNEED, FREE, REMOVE
                4 | 8 | 9 => {
                    m.memory.free_pages(addr, len);
                    m.set_result(0);
                }
                _ => m.set_result(-i64::from(EINVAL)),
            }
            Ok(())
        }),
    )?;
    Ok(())
}

/// Install the arena over `[base, end)` and the heap service calls that
/// let the guest malloc without walking its own free lists.
pub fn setup_native_heap<X: Xlen>(machine: &mut Machine<X>, base: u64, end: u64) -> Result<()> {
    machine.set_arena(Arena::new(base as u32, end as u32));

    machine.install_syscall_handler(
        SYS_NATIVE_MALLOC,
        Arc::new(|m: &mut Machine<X>| {
            let size = m.sysarg(0) as u32;
            let ptr = m.arena_mut().map_or(0, |a| a.malloc(size));
            m.set_result(i64::from(ptr));
            Ok(())
        }),
    )?;
    machine.install_syscall_handler(
        SYS_NATIVE_CALLOC,
        Arc::new(|m: &mut Machine<X>| {
            let count = m.sysarg(0);
            let size = m.sysarg(1);
            let total = count.saturating_mul(size) as u32;
            let ptr = m.arena_mut().map_or(0, |a| a.malloc(total));
            if ptr != 0 {
                m.memory.memset(u64::from(ptr), 0, u64::from(total))?;
            }
            m.set_result(i64::from(ptr));
            Ok(())
        }),
    )?;
    machine.install_syscall_handler(
        SYS_NATIVE_REALLOC,
        Arc::new(|m: &mut Machine<X>| {
            let ptr = m.sysarg(0) as u32;
            let size = m.sysarg(1) as u32;
            let (new_ptr, old_len) = m.arena_mut().map_or((0, 0), |a| a.realloc(ptr, size));
            if new_ptr != 0 && old_len != 0 && new_ptr != ptr {
                m.memory
                    .memcpy(u64::from(new_ptr), u64::from(ptr), u64::from(old_len))?;
            }
            m.set_result(i64::from(new_ptr));
            Ok(())
        }),
    )?;
    machine.install_syscall_handler(
        SYS_NATIVE_FREE,
        Arc::new(|m: &mut Machine<X>| {
            let ptr = m.sysarg(0) as u32;
            let result = m.arena_mut().map_or(-1, |a| a.free(ptr));
            m.set_result(i64::from(result));
            Ok(())
        }),
    )?;
    machine.install_syscall_handler(
        SYS_NATIVE_MEMINFO,
        Arc::new(|m: &mut Machine<X>| {
            let out = m.sysarg(0);
            let (used, free) = m
                .arena()
                .map_or((0, 0), |a| (a.bytes_used(), a.bytes_free()));
            m.memory.write::<u32>(out, used)?;
            m.memory.write::<u32>(out + 4, free)?;
            m.set_result(0);
            Ok(())
        }),
    )?;
    Ok(())
}

/// Size of the native heap region reserved by the loader.
pub const NATIVE_HEAP_SIZE: u64 = 16 << 20;

/// Default placement of the native heap: the region between the program
/// break reserve and the mmap area.
pub fn setup_default_native_heap<X: Xlen>(machine: &mut Machine<X>) -> Result<()> {
    let base = machine.memory.heap_address() + BRK_MAX;
    let end = (base + NATIVE_HEAP_SIZE).min(machine.memory.mmap_start());
    setup_native_heap(machine, base, end)
}
