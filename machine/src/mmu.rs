//! Memory management unit: translation and checked access to user memory.
//!
//! Physical memory is an array of `NumPhysPages` frames of `PageSize`
//! bytes. Every user access goes through the translation table the kernel
//! installed for the running thread; a failed translation comes back as an
//! [`MmuFault`] for the kernel to resolve (page fault) or to punish
//! (address error, read-only violation).

use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::stats::Stats;
use crate::translation::TranslationTable;
use crate::ExceptionType;

/// A failed user-memory access.
#[derive(Debug, Clone, Copy)]
pub struct MmuFault {
    pub exception: ExceptionType,
    /// The virtual address that caused the failure.
    pub vaddr: u64,
}

pub struct Mmu {
    cfg: Arc<Config>,
    main_memory: Mutex<Vec<u8>>,
    translation: Mutex<Option<Arc<TranslationTable>>>,
    stats: Arc<Stats>,
}

impl Mmu {
    pub fn new(cfg: Arc<Config>, stats: Arc<Stats>) -> Self {
        let size = cfg.num_phys_pages as usize * cfg.page_size;
        Self {
            cfg,
            main_memory: Mutex::new(vec![0; size]),
            translation: Mutex::new(None),
            stats,
        }
    }

    /// Install the translation table of the thread about to run. `None`
    /// while a pure-kernel thread has the CPU.
    pub fn set_translation(&self, table: Option<Arc<TranslationTable>>) {
        *self.translation.lock().unwrap() = table;
    }

    pub fn translation(&self) -> Option<Arc<TranslationTable>> {
        self.translation.lock().unwrap().clone()
    }

    /// Translate `vaddr` for an access of `size` bytes, setting the U bit
    /// (and M when `writing`). The access must not straddle a page.
    pub fn translate(&self, vaddr: u64, size: usize, writing: bool) -> Result<u64, MmuFault> {
        let page_size = self.cfg.page_size as u64;
        if vaddr % size as u64 != 0 {
            return Err(MmuFault {
                exception: ExceptionType::BusError,
                vaddr,
            });
        }
        let vpn = (vaddr / page_size) as usize;
        let offset = vaddr % page_size;
        let table = self.translation().ok_or(MmuFault {
            exception: ExceptionType::AddressError,
            vaddr,
        })?;
        if vpn >= table.max_num_pages() {
            return Err(MmuFault {
                exception: ExceptionType::AddressError,
                vaddr,
            });
        }
        let entry = table.entry(vpn);
        if !entry.read_allowed && !entry.write_allowed {
            return Err(MmuFault {
                exception: ExceptionType::AddressError,
                vaddr,
            });
        }
        if writing && !entry.write_allowed {
            return Err(MmuFault {
                exception: ExceptionType::ReadOnly,
                vaddr,
            });
        }
        if !entry.valid {
            return Err(MmuFault {
                exception: ExceptionType::PageFault,
                vaddr,
            });
        }
        let frame = entry.physical_page;
        if frame >= self.cfg.num_phys_pages as usize {
            return Err(MmuFault {
                exception: ExceptionType::BusError,
                vaddr,
            });
        }
        table.update(vpn, |e| {
            e.u = true;
            if writing {
                e.m = true;
            }
        });
        Ok(frame as u64 * page_size + offset)
    }

    /// Read `size` bytes (1, 2, 4 or 8) of user memory, little-endian.
    pub fn read_mem(&self, vaddr: u64, size: usize) -> Result<u64, MmuFault> {
        assert!(matches!(size, 1 | 2 | 4 | 8));
        let phys = self.translate(vaddr, size, false)? as usize;
        let memory = self.main_memory.lock().unwrap();
        let mut value: u64 = 0;
        for (i, byte) in memory[phys..phys + size].iter().enumerate() {
            value |= (*byte as u64) << (8 * i);
        }
        Ok(value)
    }

    /// Write `size` bytes (1, 2, 4 or 8) of user memory, little-endian.
    pub fn write_mem(&self, vaddr: u64, size: usize, value: u64) -> Result<(), MmuFault> {
        assert!(matches!(size, 1 | 2 | 4 | 8));
        let phys = self.translate(vaddr, size, true)? as usize;
        let mut memory = self.main_memory.lock().unwrap();
        for i in 0..size {
            memory[phys + i] = (value >> (8 * i)) as u8;
        }
        Ok(())
    }

    // Untranslated frame access, for the kernel populating or saving pages.

    pub fn read_frame(&self, frame: usize, buf: &mut [u8]) {
        let page_size = self.cfg.page_size;
        assert!(buf.len() <= page_size);
        let memory = self.main_memory.lock().unwrap();
        buf.copy_from_slice(&memory[frame * page_size..frame * page_size + buf.len()]);
    }

    pub fn write_frame(&self, frame: usize, buf: &[u8]) {
        let page_size = self.cfg.page_size;
        assert!(buf.len() <= page_size);
        let mut memory = self.main_memory.lock().unwrap();
        memory[frame * page_size..frame * page_size + buf.len()].copy_from_slice(buf);
    }

    pub fn zero_frame(&self, frame: usize) {
        let page_size = self.cfg.page_size;
        let mut memory = self.main_memory.lock().unwrap();
        memory[frame * page_size..(frame + 1) * page_size].fill(0);
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mmu_with_table() -> (Mmu, Arc<TranslationTable>) {
        let mut cfg = Config::default();
        cfg.num_phys_pages = 4;
        let cfg = Arc::new(cfg);
        let mmu = Mmu::new(cfg, Arc::new(Stats::new()));
        let table = Arc::new(TranslationTable::new(8));
        mmu.set_translation(Some(table.clone()));
        (mmu, table)
    }

    #[test]
    fn unmapped_access_is_address_error() {
        let (mmu, _table) = mmu_with_table();
        let err = mmu.read_mem(0, 4).unwrap_err();
        assert_eq!(err.exception, ExceptionType::AddressError);
    }

    #[test]
    fn invalid_resident_bit_is_page_fault() {
        let (mmu, table) = mmu_with_table();
        table.update(0, |e| e.read_allowed = true);
        let err = mmu.read_mem(0, 4).unwrap_err();
        assert_eq!(err.exception, ExceptionType::PageFault);
    }

    #[test]
    fn write_to_read_only_page_is_readonly_fault() {
        let (mmu, table) = mmu_with_table();
        table.update(0, |e| {
            e.read_allowed = true;
            e.valid = true;
            e.physical_page = 1;
        });
        let err = mmu.write_mem(8, 4, 1).unwrap_err();
        assert_eq!(err.exception, ExceptionType::ReadOnly);
    }

    #[test]
    fn round_trip_sets_reference_bits() {
        let (mmu, table) = mmu_with_table();
        table.update(1, |e| {
            e.read_allowed = true;
            e.write_allowed = true;
            e.valid = true;
            e.physical_page = 2;
        });
        let page = 128u64;
        mmu.write_mem(page + 16, 8, 0x0123_4567_89ab_cdef).unwrap();
        assert_eq!(mmu.read_mem(page + 16, 8).unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(mmu.read_mem(page + 16, 1).unwrap(), 0xef);
        let e = table.entry(1);
        assert!(e.u && e.m);
    }
}
