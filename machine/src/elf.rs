//! ELF executable parsing.
//!
//! The loader walks *section* headers (not program headers) and considers
//! everything flagged `SHF_ALLOC` loadable, with `SHT_NOBITS` sections
//! zero-filled. Both ELF32 and ELF64 are accepted; the binary must be a
//! little-endian RISC-V executable of the current ELF version.

use crate::ExceptionType;

/// Byte source an ELF image is parsed from. Implemented by the kernel's
/// open-file handle.
pub trait ReadAt {
    /// Read up to `buf.len()` bytes at `offset`, returning how many were
    /// actually available.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;
}

bitflags::bitflags! {
    /// Section attribute flags (`sh_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u64 {
        /// Writable during execution.
        const WRITE = 0x1;
        /// Occupies memory during execution.
        const ALLOC = 0x2;
        /// Contains executable instructions.
        const EXECINSTR = 0x4;
    }
}

/// Why an executable was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("not a valid RISC-V executable")]
    Format,
    #[error("executable endianness does not match the machine")]
    Endianness,
}

/// A loadable view of one section.
#[derive(Debug, Clone)]
pub struct Section {
    /// Virtual address the section occupies.
    pub addr: u64,
    /// Size in memory, in bytes.
    pub size: u64,
    /// Offset of the section image in the file. Meaningless when
    /// `zero_fill` is set.
    pub offset: u64,
    pub flags: SectionFlags,
    /// `SHT_NOBITS`: no image in the file, fill with zeroes.
    pub zero_fill: bool,
}

impl Section {
    /// Loadable sections occupy memory at run time.
    pub fn loadable(&self) -> bool {
        self.flags.contains(SectionFlags::ALLOC) && self.size > 0
    }

    pub fn writable(&self) -> bool {
        self.flags.contains(SectionFlags::WRITE)
    }
}

/// A parsed ELF image: entry point plus its section table.
#[derive(Debug)]
pub struct ElfFile {
    /// 32-bit (true) or 64-bit (false) format.
    pub is_32bits: bool,
    /// Virtual address execution starts at.
    pub entry: u64,
    sections: Vec<Section>,
}

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 0xf3;
const SHT_NOBITS: u32 = 8;

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

impl ElfFile {
    /// Parse the headers of an executable, validating class, endianness,
    /// machine, type and version.
    pub fn parse(file: &dyn ReadAt) -> Result<ElfFile, ElfError> {
        let mut ident = [0u8; 16];
        if file.read_at(&mut ident, 0) != 16 || &ident[0..4] != b"\x7fELF" {
            return Err(ElfError::Format);
        }
        let is_32bits = match ident[EI_CLASS] {
            ELFCLASS32 => true,
            ELFCLASS64 => false,
            _ => return Err(ElfError::Format),
        };
        if ident[EI_DATA] != ELFDATA2LSB {
            // The simulated machine is little-endian.
            return Err(ElfError::Endianness);
        }
        if ident[EI_VERSION] != 1 {
            return Err(ElfError::Format);
        }

        let ehsize = if is_32bits { 52 } else { 64 };
        let mut header = vec![0u8; ehsize];
        if file.read_at(&mut header, 0) != ehsize {
            return Err(ElfError::Format);
        }
        let e_type = read_u16(&header, 16);
        let e_machine = read_u16(&header, 18);
        if e_type != ET_EXEC || e_machine != EM_RISCV {
            return Err(ElfError::Format);
        }
        let (entry, shoff, shentsize, shnum) = if is_32bits {
            (
                read_u32(&header, 24) as u64,
                read_u32(&header, 32) as u64,
                read_u16(&header, 46) as usize,
                read_u16(&header, 48) as usize,
            )
        } else {
            (
                read_u64(&header, 24),
                read_u64(&header, 40),
                read_u16(&header, 58) as usize,
                read_u16(&header, 60) as usize,
            )
        };
        let expected_shentsize = if is_32bits { 40 } else { 64 };
        if shentsize != expected_shentsize {
            return Err(ElfError::Format);
        }

        let mut table = vec![0u8; shentsize * shnum];
        if file.read_at(&mut table, shoff) != table.len() {
            return Err(ElfError::Format);
        }
        let mut sections = Vec::with_capacity(shnum);
        for i in 0..shnum {
            let sh = &table[i * shentsize..(i + 1) * shentsize];
            let (sh_type, flags, addr, offset, size) = if is_32bits {
                (
                    read_u32(sh, 4),
                    read_u32(sh, 8) as u64,
                    read_u32(sh, 12) as u64,
                    read_u32(sh, 16) as u64,
                    read_u32(sh, 20) as u64,
                )
            } else {
                (
                    read_u32(sh, 4),
                    read_u64(sh, 8),
                    read_u64(sh, 16),
                    read_u64(sh, 24),
                    read_u64(sh, 32),
                )
            };
            sections.push(Section {
                addr,
                size,
                offset,
                flags: SectionFlags::from_bits_truncate(flags),
                zero_fill: sh_type == SHT_NOBITS,
            });
        }
        Ok(ElfFile {
            is_32bits,
            entry,
            sections,
        })
    }

    /// Iterator over the sections that occupy memory at run time.
    pub fn loadable_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.loadable())
    }

    /// Highest virtual address any loadable section reaches.
    pub fn top_address(&self) -> u64 {
        self.loadable_sections()
            .map(|s| s.addr + s.size)
            .max()
            .unwrap_or(0)
    }
}

impl ElfError {
    /// The exception a failed load surfaces as, when raised from a trap.
    pub fn exception(&self) -> ExceptionType {
        ExceptionType::IllegalInstruction
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    impl ReadAt for Vec<u8> {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
            let offset = offset as usize;
            if offset >= self.len() {
                return 0;
            }
            let n = buf.len().min(self.len() - offset);
            buf[..n].copy_from_slice(&self[offset..offset + n]);
            n
        }
    }

    /// Build a minimal ELF32 image: one PROGBITS section at `addr` with
    /// `payload`, one NOBITS section right after it.
    pub fn sample_elf32(addr: u32, payload: &[u8], bss_size: u32) -> Vec<u8> {
        let shoff = 52u32;
        let data_off = shoff + 3 * 40;
        let mut image = vec![0u8; data_off as usize + payload.len()];
        image[0..4].copy_from_slice(b"\x7fELF");
        image[4] = ELFCLASS32;
        image[5] = ELFDATA2LSB;
        image[6] = 1;
        image[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        image[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..28].copy_from_slice(&addr.to_le_bytes()); // e_entry
        image[32..36].copy_from_slice(&shoff.to_le_bytes()); // e_shoff
        image[46..48].copy_from_slice(&40u16.to_le_bytes()); // e_shentsize
        image[48..50].copy_from_slice(&3u16.to_le_bytes()); // e_shnum

        let mut write_shdr = |index: usize, sh_type: u32, flags: u32, vaddr: u32, off: u32, size: u32| {
            let base = shoff as usize + index * 40;
            image[base + 4..base + 8].copy_from_slice(&sh_type.to_le_bytes());
            image[base + 8..base + 12].copy_from_slice(&flags.to_le_bytes());
            image[base + 12..base + 16].copy_from_slice(&vaddr.to_le_bytes());
            image[base + 16..base + 20].copy_from_slice(&off.to_le_bytes());
            image[base + 20..base + 24].copy_from_slice(&size.to_le_bytes());
        };
        // Index 0 is the customary null section.
        write_shdr(0, 0, 0, 0, 0, 0);
        // .text/.data image
        write_shdr(1, 1, 0x2 | 0x1, addr, data_off, payload.len() as u32);
        // .bss
        write_shdr(2, SHT_NOBITS, 0x2 | 0x1, addr + payload.len() as u32, 0, bss_size);
        image[data_off as usize..].copy_from_slice(payload);
        image
    }

    #[test]
    fn parses_sample_image() {
        let image = sample_elf32(0, &[1, 2, 3, 4], 128);
        let elf = ElfFile::parse(&image).unwrap();
        assert!(elf.is_32bits);
        assert_eq!(elf.entry, 0);
        let sections: Vec<_> = elf.loadable_sections().collect();
        assert_eq!(sections.len(), 2);
        assert!(!sections[0].zero_fill);
        assert!(sections[1].zero_fill);
        assert_eq!(elf.top_address(), 4 + 128);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut image = sample_elf32(0, &[0; 4], 0);
        image[0] = 0;
        assert_eq!(ElfFile::parse(&image).unwrap_err(), ElfError::Format);
    }

    #[test]
    fn rejects_big_endian() {
        let mut image = sample_elf32(0, &[0; 4], 0);
        image[EI_DATA] = 2;
        assert_eq!(ElfFile::parse(&image).unwrap_err(), ElfError::Endianness);
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut image = sample_elf32(0, &[0; 4], 0);
        image[18..20].copy_from_slice(&0x3eu16.to_le_bytes());
        assert_eq!(ElfFile::parse(&image).unwrap_err(), ElfError::Format);
    }
}
