//! Register width types (XLEN).
//!
//! Marker types with associated register types instead of const generics,
//! because the arithmetic differs by width (sign extension, high
//! multiplies, division edge cases) and not just by size.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::ops::{BitAnd, BitOr, BitXor, Not};

/// Marker type for 32-bit register width.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rv32;

/// Marker type for 64-bit register width.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rv64;

/// Trait for register-width-dependent operations.
///
/// The interpreter runs entirely through these helpers so a single
/// generic implementation serves both RV32 and RV64. Division and the
/// high-multiply family live here because their semantics depend on the
/// register width, including the RISC-V division-by-zero and overflow
/// rules.
pub trait Xlen: Copy + Clone + Send + Sync + Default + Debug + 'static {
    /// Register type (u32 for Rv32, u64 for Rv64).
    type Reg: Copy
        + Clone
        + Default
        + Eq
        + Ord
        + Hash
        + Debug
        + Display
        + Send
        + Sync
        + BitAnd<Output = Self::Reg>
        + BitOr<Output = Self::Reg>
        + BitXor<Output = Self::Reg>
        + Not<Output = Self::Reg>;

    /// Signed register type.
    type SignedReg: Copy + Clone + Debug;

    /// XLEN value (32 or 64).
    const VALUE: u8;

    /// Shift amount mask (0x1F for 32-bit, 0x3F for 64-bit).
    const SHIFT_MASK: u32;

    /// Bytes per register (4 for 32-bit, 8 for 64-bit).
    const REG_BYTES: usize;

    /// Zero-extend a u64 (truncating) to register width.
    fn from_u64(val: u64) -> Self::Reg;

    /// Convert register to u64, zero-extending.
    fn to_u64(val: Self::Reg) -> u64;

    /// Convert register to i64, sign-extending from XLEN.
    fn to_i64(val: Self::Reg) -> i64;

    /// Truncate an i64 to register width.
    fn from_i64(val: i64) -> Self::Reg;

    /// Sign-extend a 32-bit value to register width.
    fn sign_extend_32(val: u32) -> Self::Reg;

    /// Truncate register to 32 bits.
    fn truncate_to_32(val: Self::Reg) -> u32;

    /// Wrapping addition.
    fn wrapping_add(a: Self::Reg, b: Self::Reg) -> Self::Reg;

    /// Wrapping subtraction.
    fn wrapping_sub(a: Self::Reg, b: Self::Reg) -> Self::Reg;

    /// Add a sign-extended immediate, wrapping.
    fn add_imm(a: Self::Reg, imm: i32) -> Self::Reg {
        Self::wrapping_add(a, Self::from_i64(imm as i64))
    }

    /// Logical left shift, amount already masked by the caller.
    fn shl(a: Self::Reg, sh: u32) -> Self::Reg;

    /// Logical right shift.
    fn shr(a: Self::Reg, sh: u32) -> Self::Reg;

    /// Arithmetic right shift.
    fn sra(a: Self::Reg, sh: u32) -> Self::Reg;

    /// Signed less-than.
    fn lt_signed(a: Self::Reg, b: Self::Reg) -> bool {
        Self::to_i64(a) < Self::to_i64(b)
    }

    /// Low half of multiplication.
    fn mul(a: Self::Reg, b: Self::Reg) -> Self::Reg;

    /// High half of signed × signed multiplication.
    fn mulh(a: Self::Reg, b: Self::Reg) -> Self::Reg;

    /// High half of unsigned × unsigned multiplication.
    fn mulhu(a: Self::Reg, b: Self::Reg) -> Self::Reg;

    /// High half of signed × unsigned multiplication.
    fn mulhsu(a: Self::Reg, b: Self::Reg) -> Self::Reg;

    /// Signed division: x/0 = -1, overflow (MIN / -1) = MIN.
    fn div(a: Self::Reg, b: Self::Reg) -> Self::Reg;

    /// Unsigned division: x/0 = all ones.
    fn divu(a: Self::Reg, b: Self::Reg) -> Self::Reg;

    /// Signed remainder: x%0 = x, overflow = 0.
    fn rem(a: Self::Reg, b: Self::Reg) -> Self::Reg;

    /// Unsigned remainder: x%0 = x.
    fn remu(a: Self::Reg, b: Self::Reg) -> Self::Reg;
}

impl Xlen for Rv32 {
    type Reg = u32;
    type SignedReg = i32;

    const VALUE: u8 = 32;
    const SHIFT_MASK: u32 = 0x1F;
    const REG_BYTES: usize = 4;

    #[inline]
    fn from_u64(val: u64) -> u32 {
        val as u32
    }

    #[inline]
    fn to_u64(val: u32) -> u64 {
        val as u64
    }

    #[inline]
    fn to_i64(val: u32) -> i64 {
        val.cast_signed() as i64
    }

    #[inline]
    fn from_i64(val: i64) -> u32 {
        val as u32
    }

    #[inline]
    fn sign_extend_32(val: u32) -> u32 {
        val
    }

    #[inline]
    fn truncate_to_32(val: u32) -> u32 {
        val
    }

    #[inline]
    fn wrapping_add(a: u32, b: u32) -> u32 {
        a.wrapping_add(b)
    }

    #[inline]
    fn wrapping_sub(a: u32, b: u32) -> u32 {
        a.wrapping_sub(b)
    }

    #[inline]
    fn shl(a: u32, sh: u32) -> u32 {
        a.wrapping_shl(sh)
    }

    #[inline]
    fn shr(a: u32, sh: u32) -> u32 {
        a.wrapping_shr(sh)
    }

    #[inline]
    fn sra(a: u32, sh: u32) -> u32 {
        a.cast_signed().wrapping_shr(sh).cast_unsigned()
    }

    #[inline]
    fn mul(a: u32, b: u32) -> u32 {
        a.wrapping_mul(b)
    }

    #[inline]
    fn mulh(a: u32, b: u32) -> u32 {
        ((a.cast_signed() as i64 * b.cast_signed() as i64) >> 32) as u32
    }

    #[inline]
    fn mulhu(a: u32, b: u32) -> u32 {
        ((a as u64 * b as u64) >> 32) as u32
    }

    #[inline]
    fn mulhsu(a: u32, b: u32) -> u32 {
        ((a.cast_signed() as i64 * b as i64) >> 32) as u32
    }

    #[inline]
    fn div(a: u32, b: u32) -> u32 {
        let (a, b) = (a.cast_signed(), b.cast_signed());
        if b == 0 {
            u32::MAX
        } else {
            a.wrapping_div(b).cast_unsigned()
        }
    }

    #[inline]
    fn divu(a: u32, b: u32) -> u32 {
        if b == 0 {
            u32::MAX
        } else {
            a / b
        }
    }

    #[inline]
    fn rem(a: u32, b: u32) -> u32 {
        let (a, b) = (a.cast_signed(), b.cast_signed());
        if b == 0 {
            a.cast_unsigned()
        } else {
            a.wrapping_rem(b).cast_unsigned()
        }
    }

    #[inline]
    fn remu(a: u32, b: u32) -> u32 {
        if b == 0 {
            a
        } else {
            a % b
        }
    }
}

impl Xlen for Rv64 {
    type Reg = u64;
    type SignedReg = i64;

    const VALUE: u8 = 64;
    const SHIFT_MASK: u32 = 0x3F;
    const REG_BYTES: usize = 8;

    #[inline]
    fn from_u64(val: u64) -> u64 {
        val
    }

    #[inline]
    fn to_u64(val: u64) -> u64 {
        val
    }

    #[inline]
    fn to_i64(val: u64) -> i64 {
        val.cast_signed()
    }

    #[inline]
    fn from_i64(val: i64) -> u64 {
        val.cast_unsigned()
    }

    #[inline]
    fn sign_extend_32(val: u32) -> u64 {
        val.cast_signed() as i64 as u64
    }

    #[inline]
    fn truncate_to_32(val: u64) -> u32 {
        val as u32
    }

    #[inline]
    fn wrapping_add(a: u64, b: u64) -> u64 {
        a.wrapping_add(b)
    }

    #[inline]
    fn wrapping_sub(a: u64, b: u64) -> u64 {
        a.wrapping_sub(b)
    }

    #[inline]
    fn shl(a: u64, sh: u32) -> u64 {
        a.wrapping_shl(sh)
    }

    #[inline]
    fn shr(a: u64, sh: u32) -> u64 {
        a.wrapping_shr(sh)
    }

    #[inline]
    fn sra(a: u64, sh: u32) -> u64 {
        a.cast_signed().wrapping_shr(sh).cast_unsigned()
    }

    #[inline]
    fn mul(a: u64, b: u64) -> u64 {
        a.wrapping_mul(b)
    }

    #[inline]
    fn mulh(a: u64, b: u64) -> u64 {
        ((a.cast_signed() as i128 * b.cast_signed() as i128) >> 64) as u64
    }

    #[inline]
    fn mulhu(a: u64, b: u64) -> u64 {
        ((a as u128 * b as u128) >> 64) as u64
    }

    #[inline]
    fn mulhsu(a: u64, b: u64) -> u64 {
        ((a.cast_signed() as i128 * b as i128) >> 64) as u64
    }

    #[inline]
    fn div(a: u64, b: u64) -> u64 {
        let (a, b) = (a.cast_signed(), b.cast_signed());
        if b == 0 {
            u64::MAX
        } else {
            a.wrapping_div(b).cast_unsigned()
        }
    }

    #[inline]
    fn divu(a: u64, b: u64) -> u64 {
        if b == 0 {
            u64::MAX
        } else {
            a / b
        }
    }

    #[inline]
    fn rem(a: u64, b: u64) -> u64 {
        let (a, b) = (a.cast_signed(), b.cast_signed());
        if b == 0 {
            a.cast_unsigned()
        } else {
            a.wrapping_rem(b).cast_unsigned()
        }
    }

    #[inline]
    fn remu(a: u64, b: u64) -> u64 {
        if b == 0 {
            a
        } else {
            a % b
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xlen_rv32() {
        assert_eq!(Rv32::VALUE, 32);
        assert_eq!(Rv32::SHIFT_MASK, 0x1F);
        assert_eq!(Rv32::REG_BYTES, 4);
        assert_eq!(Rv32::sign_extend_32(0xFFFF_FFFF), 0xFFFF_FFFF);
    }

    #[test]
    fn test_xlen_rv64() {
        assert_eq!(Rv64::VALUE, 64);
        assert_eq!(Rv64::SHIFT_MASK, 0x3F);
        assert_eq!(Rv64::REG_BYTES, 8);
        // Sign extension: 0xFFFFFFFF (-1 as i32) becomes all ones
        assert_eq!(Rv64::sign_extend_32(0xFFFF_FFFF), u64::MAX);
        // Positive value stays the same
        assert_eq!(Rv64::sign_extend_32(0x7FFF_FFFF), 0x7FFF_FFFF);
    }

    #[test]
    fn test_division_edge_cases() {
        // Division by zero yields all ones (signed -1)
        assert_eq!(Rv32::div(17, 0), u32::MAX);
        assert_eq!(Rv64::div(17, 0), u64::MAX);
        assert_eq!(Rv32::divu(17, 0), u32::MAX);
        // Signed overflow: MIN / -1 = MIN
        assert_eq!(Rv32::div(i32::MIN.cast_unsigned(), u32::MAX), i32::MIN.cast_unsigned());
        assert_eq!(Rv64::div(i64::MIN.cast_unsigned(), u64::MAX), i64::MIN.cast_unsigned());
        // Remainder by zero yields the dividend
        assert_eq!(Rv32::rem(17, 0), 17);
        assert_eq!(Rv64::remu(17, 0), 17);
        // Overflow remainder is zero
        assert_eq!(Rv32::rem(i32::MIN.cast_unsigned(), u32::MAX), 0);
    }

    #[test]
    fn test_mulh_family() {
        assert_eq!(Rv32::mulh(0x8000_0000, 0x8000_0000), 0x4000_0000);
        assert_eq!(Rv32::mulhu(0xFFFF_FFFF, 0xFFFF_FFFF), 0xFFFF_FFFE);
        assert_eq!(Rv64::mulhu(u64::MAX, u64::MAX), u64::MAX - 1);
        // -1 * 1 has all-ones high half when signed
        assert_eq!(Rv64::mulh(u64::MAX, 1), u64::MAX);
        assert_eq!(Rv64::mulhsu(u64::MAX, 1), u64::MAX);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(Rv32::sra(0x8000_0000, 31), 0xFFFF_FFFF);
        assert_eq!(Rv32::shr(0x8000_0000, 31), 1);
        assert_eq!(Rv64::sra(1u64 << 63, 63), u64::MAX);
    }
}
