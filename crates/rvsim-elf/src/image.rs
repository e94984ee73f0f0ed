//! ELF image ready to be mapped into guest memory.

use rvsim_isa::Xlen;

use crate::constants::{PF_W, PF_X, PT_DYNAMIC, PT_INTERP, PT_LOAD, STT_FUNC};
use crate::file::{ElfFile, Symbol};
use crate::{ElfError, Result};

/// A loadable memory segment.
///
/// `data` holds only the file-backed bytes (filesz); the span up to
/// `virtual_end` is BSS and must read as zero.
#[derive(Clone, Debug)]
pub struct MemorySegment {
    pub virtual_start: u64,
    pub virtual_end: u64,
    pub data: Vec<u8>,
    pub flags: u32,
}

impl MemorySegment {
    /// Size of file data (non-BSS).
    #[must_use]
    pub fn filesz(&self) -> u64 {
        self.data.len() as u64
    }

    /// Total memory size including BSS.
    #[must_use]
    pub fn memsz(&self) -> u64 {
        self.virtual_end - self.virtual_start
    }

    /// Check if the segment is writable.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        (self.flags & PF_W) != 0
    }

    /// Check if the segment is executable.
    #[must_use]
    pub const fn is_executable(&self) -> bool {
        (self.flags & PF_X) != 0
    }
}

/// ELF image: entry point plus loadable segments and symbols.
#[derive(Clone, Debug)]
pub struct ElfImage<X: Xlen> {
    pub entry_point: X::Reg,
    pub e_flags: u32,
    pub segments: Vec<MemorySegment>,
    pub symbols: Vec<Symbol>,
    /// Whether the binary requests dynamic linking (PT_INTERP/PT_DYNAMIC).
    pub is_dynamic: bool,
}

impl<X: Xlen> ElfImage<X> {
    /// Parse ELF bytes into a loadable image.
    ///
    /// # Errors
    ///
    /// Fails on malformed ELF data, a width mismatch, or when no
    /// loadable segment exists.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let elf = ElfFile::<X>::parse(data)?;

        let mut segments = Vec::new();
        let mut is_dynamic = false;
        for ph in &elf.program_headers {
            match ph.p_type {
                PT_INTERP | PT_DYNAMIC => is_dynamic = true,
                PT_LOAD => {
                    let file_end = ph.offset.checked_add(ph.filesz).ok_or(ElfError::SegmentBeyondFile)?;
                    if file_end as usize > data.len() {
                        return Err(ElfError::SegmentBeyondFile);
                    }
                    segments.push(MemorySegment {
                        virtual_start: ph.vaddr,
                        virtual_end: ph.vaddr + ph.memsz,
                        data: data[ph.offset as usize..file_end as usize].to_vec(),
                        flags: ph.flags,
                    });
                }
                _ => {}
            }
        }
        if segments.is_empty() {
            return Err(ElfError::NoLoadableSegments);
        }

        Ok(Self {
            entry_point: elf.entry_point,
            e_flags: elf.e_flags,
            segments,
            symbols: elf.symbols,
            is_dynamic,
        })
    }

    /// Highest mapped virtual address across all segments.
    #[must_use]
    pub fn highest_address(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.virtual_end)
            .max()
            .unwrap_or(0)
    }

    /// Look up a symbol address by name.
    #[must_use]
    pub fn lookup_symbol(&self, name: &str) -> Option<u64> {
        self.symbols.iter().find(|s| s.name == name).map(|s| s.value)
    }

    /// Look up a function symbol address by name.
    #[must_use]
    pub fn lookup_function(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|s| s.name == name && s.sym_type == STT_FUNC)
            .map(|s| s.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvsim_isa::Rv64;

    /// Build a minimal ELF64 with one PT_LOAD segment holding `code`.
    fn minimal_elf64(entry: u64, vaddr: u64, code: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 64 + 56];
        out[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little-endian
        out[6] = 1; // version
        out[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out[18..20].copy_from_slice(&243u16.to_le_bytes()); // EM_RISCV
        out[24..32].copy_from_slice(&entry.to_le_bytes());
        out[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        out[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        out[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum

        let file_offset = out.len() as u64;
        let mut ph = vec![0u8; 56];
        ph[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        ph[4..8].copy_from_slice(&(PF_X | 0x4).to_le_bytes()); // R+X
        ph[8..16].copy_from_slice(&file_offset.to_le_bytes());
        ph[16..24].copy_from_slice(&vaddr.to_le_bytes());
        ph[32..40].copy_from_slice(&(code.len() as u64).to_le_bytes()); // filesz
        ph[40..48].copy_from_slice(&(code.len() as u64 + 64).to_le_bytes()); // memsz: BSS tail
        out[64..120].copy_from_slice(&ph);
        out.extend_from_slice(code);
        out
    }

    #[test]
    fn test_parse_minimal_image() {
        let code = [0x13, 0x00, 0x00, 0x00]; // nop
        let elf = minimal_elf64(0x1_0000, 0x1_0000, &code);
        let image = ElfImage::<Rv64>::parse(&elf).unwrap();

        assert_eq!(image.entry_point, 0x1_0000);
        assert_eq!(image.segments.len(), 1);
        let seg = &image.segments[0];
        assert_eq!(seg.virtual_start, 0x1_0000);
        assert_eq!(seg.filesz(), 4);
        assert_eq!(seg.memsz(), 68);
        assert!(seg.is_executable());
        assert!(!seg.is_writable());
        assert!(!image.is_dynamic);
    }

    #[test]
    fn test_xlen_mismatch() {
        let code = [0u8; 4];
        let elf = minimal_elf64(0, 0, &code);
        assert!(matches!(
            ElfImage::<rvsim_isa::Rv32>::parse(&elf),
            Err(ElfError::XlenMismatch { .. })
        ));
    }
}
