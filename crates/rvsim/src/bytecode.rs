//! Internal bytecode ids and the packed operand layouts used by the
//! decoder cache.
//!
//! The decoder collapses raw encodings into these ids and, for the hot
//! bytecodes, repacks the operands so handlers read register numbers and
//! immediates without re-extracting scattered bit fields. The `Function`
//! fallback keeps the original 32-bit word instead.

/// Decoded instruction bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Bytecode {
    Invalid = 0,

    Addi,
    Li,
    Mv,
    Slli,
    Slti,
    Sltiu,
    Xori,
    Srli,
    Srai,
    Ori,
    Andi,

    Lui,
    Auipc,

    Ldb,
    Ldbu,
    Ldh,
    Ldhu,
    Ldw,
    Ldwu,
    Ldd,

    Stb,
    Sth,
    Stw,
    Std,

    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    BeqFw,
    BneFw,

    Jal,
    Jalr,
    FastJal,
    FastCall,

    OpAdd,
    OpSub,
    OpSll,
    OpSlt,
    OpSltu,
    OpXor,
    OpSrl,
    OpOr,
    OpAnd,
    OpMul,
    OpMulh,
    OpMulhsu,
    OpMulhu,
    OpDiv,
    OpDivu,
    OpRem,
    OpRemu,
    OpSra,
    OpSh1add,
    OpSh2add,
    OpSh3add,

    Addiw,

    // Compressed fast paths
    CAddi,
    CMv,
    CBnez,
    CLdd,
    CStd,
    CFunction,
    CJumpFunction,

    Syscall,
    Stop,
    Nop,

    Flw,
    Fld,
    Fsw,
    Fsd,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fmadd,

    Vle32,
    Vse32,
    VfaddVv,

    /// Cold instruction executed through an interned handler.
    Function,
    /// Same, but the instruction terminates its block (straight-line
    /// code hitting the block size cap or the end of the segment).
    FunctionBlockEnd,
    /// Externally translated code registered for this address.
    Translator,
    /// SYSTEM group: EBREAK, CSR accesses, and anything privileged.
    System,
}

/// Number of bytecode ids (size of the dispatch tables).
pub const BYTECODES_MAX: usize = Bytecode::System as usize + 1;

impl Bytecode {
    /// Whether this bytecode terminates a straight-line block.
    #[must_use]
    pub const fn ends_block(self) -> bool {
        matches!(
            self,
            Bytecode::Invalid
                | Bytecode::Beq
                | Bytecode::Bne
                | Bytecode::Blt
                | Bytecode::Bge
                | Bytecode::Bltu
                | Bytecode::Bgeu
                | Bytecode::BeqFw
                | Bytecode::BneFw
                | Bytecode::Jal
                | Bytecode::Jalr
                | Bytecode::FastJal
                | Bytecode::FastCall
                | Bytecode::CBnez
                | Bytecode::CJumpFunction
                | Bytecode::Syscall
                | Bytecode::Stop
                | Bytecode::FunctionBlockEnd
                | Bytecode::Translator
                | Bytecode::System
        )
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        if value as usize >= BYTECODES_MAX {
            Bytecode::Invalid
        } else {
            // Safety-free conversion: the enum is a dense repr(u8) range
            // starting at 0, checked by test_bytecode_roundtrip.
            unsafe { std::mem::transmute::<u8, Bytecode>(value) }
        }
    }
}

/// Packed operands for ADDI-class, loads/stores and branches:
/// `(imm:16, rs2:8, rs1:8)` from the top.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct ItypePacked(pub u32);

impl ItypePacked {
    #[must_use]
    pub const fn pack(rs1: usize, rs2: usize, imm: i32) -> Self {
        Self(((rs1 as u32) << 24) | ((rs2 as u32) << 16) | ((imm as u32) & 0xFFFF))
    }

    #[must_use]
    #[inline]
    pub const fn rs1(self) -> usize {
        (self.0 >> 24) as usize
    }

    #[must_use]
    #[inline]
    pub const fn rs2(self) -> usize {
        ((self.0 >> 16) & 0xFF) as usize
    }

    #[must_use]
    #[inline]
    pub const fn signed_imm(self) -> i32 {
        (self.0 & 0xFFFF) as u16 as i16 as i32
    }

    #[must_use]
    #[inline]
    pub const fn unsigned_imm(self) -> u32 {
        self.0 & 0xFFFF
    }
}

/// Packed operands for register-register ops: `(rd:16, rs2:8, rs1:8)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct OpTypePacked(pub u32);

impl OpTypePacked {
    #[must_use]
    pub const fn pack(rd: usize, rs1: usize, rs2: usize) -> Self {
        Self(((rs1 as u32) << 24) | ((rs2 as u32) << 16) | (rd as u32))
    }

    #[must_use]
    #[inline]
    pub const fn rd(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }

    #[must_use]
    #[inline]
    pub const fn rs1(self) -> usize {
        (self.0 >> 24) as usize
    }

    #[must_use]
    #[inline]
    pub const fn rs2(self) -> usize {
        ((self.0 >> 16) & 0xFF) as usize
    }
}

/// Packed operands for LI: `(rd:8, zero:8, imm:16)` from the bottom.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct ImmPacked(pub u32);

impl ImmPacked {
    #[must_use]
    pub const fn pack(rd: usize, imm: i32) -> Self {
        Self((rd as u32) | (((imm as u32) & 0xFFFF) << 16))
    }

    #[must_use]
    #[inline]
    pub const fn rd(self) -> usize {
        (self.0 & 0xFF) as usize
    }

    #[must_use]
    #[inline]
    pub const fn signed_imm(self) -> i32 {
        (self.0 >> 16) as u16 as i16 as i32
    }
}

/// Packed operands for MV: `(rd:16, rs1:16)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct MovePacked(pub u32);

impl MovePacked {
    #[must_use]
    pub const fn pack(rd: usize, rs1: usize) -> Self {
        Self((rd as u32) | ((rs1 as u32) << 16))
    }

    #[must_use]
    #[inline]
    pub const fn rd(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }

    #[must_use]
    #[inline]
    pub const fn rs1(self) -> usize {
        (self.0 >> 16) as usize
    }
}

/// Packed operands for JAL: `(offset:24, rd:8)` with a signed offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct JtypePacked(pub u32);

impl JtypePacked {
    #[must_use]
    pub const fn pack(offset: i32, rd: usize) -> Self {
        Self((((offset as u32) & 0x00FF_FFFF) << 8) | (rd as u32))
    }

    #[must_use]
    #[inline]
    pub const fn rd(self) -> usize {
        (self.0 & 0xFF) as usize
    }

    #[must_use]
    #[inline]
    pub const fn offset(self) -> i32 {
        (self.0 & 0xFFFF_FF00).cast_signed() >> 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytecode_roundtrip() {
        for id in 0..BYTECODES_MAX as u8 {
            assert_eq!(Bytecode::from_u8(id) as u8, id);
        }
        assert_eq!(Bytecode::from_u8(BYTECODES_MAX as u8), Bytecode::Invalid);
        assert_eq!(Bytecode::from_u8(0xFF), Bytecode::Invalid);
    }

    #[test]
    fn test_itype_packed() {
        let p = ItypePacked::pack(31, 7, -2048);
        assert_eq!(p.rs1(), 31);
        assert_eq!(p.rs2(), 7);
        assert_eq!(p.signed_imm(), -2048);
        assert_eq!(ItypePacked::pack(1, 2, 2047).signed_imm(), 2047);
    }

    #[test]
    fn test_optype_packed() {
        let p = OpTypePacked::pack(5, 6, 7);
        assert_eq!(p.rd(), 5);
        assert_eq!(p.rs1(), 6);
        assert_eq!(p.rs2(), 7);
    }

    #[test]
    fn test_imm_packed() {
        let p = ImmPacked::pack(9, -1);
        assert_eq!(p.rd(), 9);
        assert_eq!(p.signed_imm(), -1);
    }

    #[test]
    fn test_jtype_packed() {
        let p = JtypePacked::pack(-4096, 1);
        assert_eq!(p.rd(), 1);
        assert_eq!(p.offset(), -4096);
        let p = JtypePacked::pack(0x7F_FFFE, 0);
        assert_eq!(p.offset(), 0x7F_FFFE);
    }

    #[test]
    fn test_block_enders() {
        assert!(Bytecode::Jal.ends_block());
        assert!(Bytecode::Syscall.ends_block());
        assert!(Bytecode::Invalid.ends_block());
        assert!(!Bytecode::Addi.ends_block());
        assert!(!Bytecode::Function.ends_block());
    }
}
