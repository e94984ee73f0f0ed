//! The mmap family and the native heap, driven through the syscall
//! interface.

use rvsim::syscalls::{
    self, MAP_ANONYMOUS, SYS_MADVISE, SYS_MMAP, SYS_MPROTECT, SYS_MREMAP, SYS_MUNMAP,
    SYS_NATIVE_FREE, SYS_NATIVE_MALLOC, SYS_NATIVE_REALLOC,
};
use rvsim::{Machine, MachineOptions, Rv64, Xlen};
use rvsim_isa::{REG_A0, REG_A1, REG_A2, REG_A3};

const PROT_READ: u64 = 1;
const PROT_WRITE: u64 = 2;

fn machine() -> Machine<Rv64> {
    let mut m = Machine::<Rv64>::new(MachineOptions::default());
    m.memory.set_heap_address(0x10_0000);
    m.memory.set_brk(0x10_0000);
    m.memory.set_mmap_start(0x100_0000);
    syscalls::setup_linux_syscalls(&mut m).unwrap();
    m
}

fn call(m: &mut Machine<Rv64>, nr: usize, args: [u64; 4]) -> u64 {
    m.cpu.set_reg(REG_A0, args[0]);
    m.cpu.set_reg(REG_A1, args[1]);
    m.cpu.set_reg(REG_A2, args[2]);
    m.cpu.set_reg(REG_A3, args[3]);
    m.system_call(nr as u64).unwrap();
    Rv64::to_u64(m.cpu.reg(REG_A0))
}

#[test]
fn test_mmap_munmap_cycle() {
    let mut m = machine();

    let addr = call(
        &mut m,
        SYS_MMAP,
        [0, 8192, PROT_READ | PROT_WRITE, MAP_ANONYMOUS],
    );
    assert_eq!(addr, 0x100_0000);

    // Write a pattern, unmap, and map the same length again
    m.memory.write::<u64>(addr, 0x0123_4567_89AB_CDEF).unwrap();
    assert_eq!(call(&mut m, SYS_MUNMAP, [addr, 8192, 0, 0]), 0);

    let addr2 = call(
        &mut m,
        SYS_MMAP,
        [0, 8192, PROT_READ | PROT_WRITE, MAP_ANONYMOUS],
    );
    // The freed range ended at the cursor, so the address is reused
    assert_eq!(addr2, addr);
    // ... and the pages read as zero again
    assert_eq!(m.memory.read::<u64>(addr2).unwrap(), 0);
}

#[test]
fn test_munmap_in_the_middle_keeps_cursor() {
    let mut m = machine();
    let a = call(&mut m, SYS_MMAP, [0, 4096, 3, MAP_ANONYMOUS]);
    let b = call(&mut m, SYS_MMAP, [0, 4096, 3, MAP_ANONYMOUS]);
    assert_eq!(b, a + 4096);

    // Unmapping the first range does not retract the cursor
    call(&mut m, SYS_MUNMAP, [a, 4096, 0, 0]);
    let c = call(&mut m, SYS_MMAP, [0, 4096, 3, MAP_ANONYMOUS]);
    assert_eq!(c, b + 4096);
}

#[test]
fn test_mremap_tail_extension() {
    let mut m = machine();
    let addr = call(&mut m, SYS_MMAP, [0, 8192, 3, MAP_ANONYMOUS]);
    // The last mapping can grow in place
    let grown = call(&mut m, SYS_MREMAP, [addr, 8192, 16384, 0]);
    assert_eq!(grown, addr);
    assert_eq!(m.memory.mmap_address(), addr + 16384);

    // Growing an interior mapping fails
    let _other = call(&mut m, SYS_MMAP, [0, 4096, 3, MAP_ANONYMOUS]);
    let failed = call(&mut m, SYS_MREMAP, [addr, 16384, 32768, 0]);
    assert_eq!(failed.cast_signed(), -1);
}

#[test]
fn test_mprotect_sets_attributes() {
    let mut m = machine();
    let addr = call(&mut m, SYS_MMAP, [0, 4096, 3, MAP_ANONYMOUS]);
    m.memory.write::<u32>(addr, 7).unwrap();

    assert_eq!(call(&mut m, SYS_MPROTECT, [addr, 4096, PROT_READ, 0]), 0);
    assert!(m.memory.write::<u32>(addr, 8).is_err());
    assert_eq!(m.memory.read::<u32>(addr).unwrap(), 7);

    assert_eq!(
        call(&mut m, SYS_MPROTECT, [addr, 4096, PROT_READ | PROT_WRITE, 0]),
        0
    );
    assert!(m.memory.write::<u32>(addr, 8).is_ok());
}

#[test]
fn test_madvise() {
    let mut m = machine();
    let addr = call(&mut m, SYS_MMAP, [0, 4096, 3, MAP_ANONYMOUS]);
    m.memory.write::<u32>(addr, 0x55AA).unwrap();

    // WILLNEED is a no-op
    assert_eq!(call(&mut m, SYS_MADVISE, [addr, 4096, 3, 0]), 0);
    assert_eq!(m.memory.read::<u32>(addr).unwrap(), 0x55AA);

    // DONTNEED frees the pages
    assert_eq!(call(&mut m, SYS_MADVISE, [addr, 4096, 4, 0]), 0);
    assert_eq!(m.memory.read::<u32>(addr).unwrap(), 0);

    // Unknown advice is rejected
    let r = call(&mut m, SYS_MADVISE, [addr, 4096, 77, 0]);
    assert_eq!(r.cast_signed(), -22);
}

#[test]
fn test_native_heap_syscalls() {
    let mut m = machine();
    syscalls::setup_native_heap(&mut m, 0x50_0000, 0x60_0000).unwrap();

    let p = call(&mut m, SYS_NATIVE_MALLOC, [16, 0, 0, 0]);
    assert!(p >= 0x50_0000 && p < 0x60_0000);
    assert_eq!(p % 8, 0);

    m.memory.write::<u64>(p, 0xAABB_CCDD).unwrap();
    m.memory.write::<u64>(p + 8, 0x1122).unwrap();

    // Growing in place: no intervening allocation
    let q = call(&mut m, SYS_NATIVE_REALLOC, [p, 24, 0, 0]);
    assert_eq!(q, p);
    assert_eq!(m.memory.read::<u64>(p).unwrap(), 0xAABB_CCDD);

    // Force a move and verify the bytes were copied over
    let wall = call(&mut m, SYS_NATIVE_MALLOC, [8, 0, 0, 0]);
    assert_ne!(wall, 0);
    let r = call(&mut m, SYS_NATIVE_REALLOC, [q, 4096, 0, 0]);
    assert_ne!(r, q);
    assert_eq!(m.memory.read::<u64>(r).unwrap(), 0xAABB_CCDD);
    assert_eq!(m.memory.read::<u64>(r + 8).unwrap(), 0x1122);

    assert_eq!(call(&mut m, SYS_NATIVE_FREE, [r, 0, 0, 0]), 0);
    // Double free reports failure through the unknown-free path
    assert_eq!(call(&mut m, SYS_NATIVE_FREE, [r, 0, 0, 0]).cast_signed(), -1);
}

#[test]
fn test_mmap_rejects_unaligned_hint() {
    let mut m = machine();
    let r = call(&mut m, SYS_MMAP, [0x100_0001, 4096, 3, MAP_ANONYMOUS]);
    assert_eq!(r.cast_signed(), -1);
}
