//! Process address spaces.
//!
//! An address space owns a translation table sized at `MaxVirtPages` and a
//! bump-pointer allocator of virtual pages; there is no de-allocation
//! short of tearing the whole space down. Executable sections come from
//! the ELF image, demand-paged by default (each page records its file
//! offset and faults in on first touch) or loaded eagerly when the
//! `eager-load` feature is on; the two are observationally equivalent.
//! Stacks are allocated eagerly behind a four-page unmapped guard region.

use std::sync::{Arc, Mutex};

use rvos_machine::config::Config;
use rvos_machine::elf::ElfFile;
use rvos_machine::mmu::Mmu;
use rvos_machine::translation::TranslationTable;

use crate::error::ErrorKind;
use crate::fs::open_file::OpenFile;
use crate::sync::Semaphore;
use crate::thread::scheduler::Scheduler;
use crate::vm::physmem::PhysicalMemManager;
use crate::vm::swap::SwapManager;

/// Unmapped pages kept below every stack to catch overflows.
const STACK_GUARD_PAGES: usize = 4;

struct MappedRegion {
    file: Arc<OpenFile>,
    first_page: usize,
    num_pages: usize,
}

pub struct AddrSpace {
    cfg: Arc<Config>,
    mmu: Arc<Mmu>,
    physmem: Arc<PhysicalMemManager>,
    swap: Arc<SwapManager>,
    pub translation: Arc<TranslationTable>,
    free_page_id: Mutex<usize>,
    code_start: Mutex<u64>,
    exec_file: Option<Arc<OpenFile>>,
    mapped_files: Mutex<Vec<MappedRegion>>,
    /// Serializes fault resolution within this space.
    pub(crate) fault_sem: Semaphore,
}

impl AddrSpace {
    /// Build an address space, loading `exec_file` when given one (an
    /// empty space otherwise).
    pub fn new(
        cfg: Arc<Config>,
        mmu: Arc<Mmu>,
        physmem: Arc<PhysicalMemManager>,
        swap: Arc<SwapManager>,
        sched: &Arc<Scheduler>,
        exec_file: Option<Arc<OpenFile>>,
    ) -> Result<Arc<AddrSpace>, ErrorKind> {
        let space = Arc::new(AddrSpace {
            cfg: cfg.clone(),
            mmu,
            physmem,
            swap,
            translation: Arc::new(TranslationTable::new(cfg.max_virt_pages as usize)),
            free_page_id: Mutex::new(0),
            code_start: Mutex::new(0),
            exec_file: exec_file.clone(),
            mapped_files: Mutex::new(Vec::new()),
            fault_sem: Semaphore::new("page fault", 1, sched.clone()),
        });
        if let Some(file) = exec_file {
            let elf = ElfFile::parse(file.as_ref()).map_err(|e| match e {
                rvos_machine::elf::ElfError::Endianness => ErrorKind::WrongFileEndianess,
                rvos_machine::elf::ElfError::Format => ErrorKind::ExecFileFormatError,
            })?;
            Self::load(&space, &elf)?;
        }
        Ok(space)
    }

    /// Entry point of the loaded program.
    pub fn code_start_address(&self) -> u64 {
        *self.code_start.lock().unwrap()
    }

    /// Reserve `num_pages` contiguous virtual pages. `None` when the
    /// space would overflow `MaxVirtPages`.
    pub fn alloc(&self, num_pages: usize) -> Option<usize> {
        let mut free_page_id = self.free_page_id.lock().unwrap();
        if *free_page_id + num_pages >= self.translation.max_num_pages() {
            return None;
        }
        let base = *free_page_id;
        *free_page_id += num_pages;
        Some(base)
    }

    fn load(space: &Arc<AddrSpace>, elf: &ElfFile) -> Result<(), ErrorKind> {
        let page_size = space.cfg.page_size as u64;
        let top = elf.top_address();
        let base = space
            .alloc(top.div_ceil(page_size) as usize)
            .ok_or(ErrorKind::OutOfMemory)?;
        assert_eq!(base, 0, "program region must start at virtual address 0");
        log::debug!(target: "vm", "allocated virtual area [0x0,{top:#x}) for program");

        for section in elf.loadable_sections() {
            assert!(
                section.addr % page_size == 0,
                "loadable section not page-aligned"
            );
            log::debug!(
                target: "vm",
                "section at {:#x}, size {:#x}, {}{}",
                section.addr,
                section.size,
                if section.writable() { "R/W" } else { "R" },
                if section.zero_fill { ", zero-fill" } else { "" }
            );
            let first_page = (section.addr / page_size) as usize;
            let num_pages = (section.size as usize).div_ceil(page_size as usize);
            for page in 0..num_pages {
                let vp = first_page + page;
                space.translation.update(vp, |e| {
                    e.read_allowed = true;
                    e.write_allowed = section.writable();
                    e.swap = false;
                    e.io = false;
                });
                space.populate_program_page(
                    vp,
                    section.zero_fill,
                    section.offset + page as u64 * page_size,
                )?;
            }
        }
        *space.code_start.lock().unwrap() = elf.entry;
        log::debug!(target: "vm", "program start address {:#x}", elf.entry);
        Ok(())
    }

    /// Demand paging: record where the page lives; it faults in on first
    /// touch.
    #[cfg(not(feature = "eager-load"))]
    fn populate_program_page(
        self: &Arc<Self>,
        vp: usize,
        zero_fill: bool,
        file_offset: u64,
    ) -> Result<(), ErrorKind> {
        self.translation.update(vp, |e| {
            e.valid = false;
            e.addr_disk = if zero_fill { None } else { Some(file_offset) };
        });
        Ok(())
    }

    /// Eager loading: wire a frame now and fill it from the image.
    #[cfg(feature = "eager-load")]
    fn populate_program_page(
        self: &Arc<Self>,
        vp: usize,
        zero_fill: bool,
        file_offset: u64,
    ) -> Result<(), ErrorKind> {
        let frame = self.physmem.add_physical_to_virtual_mapping(self, vp)?;
        if zero_fill {
            self.mmu.zero_frame(frame);
        } else {
            let mut buffer = vec![0u8; self.cfg.page_size];
            let file = self.exec_file.as_ref().expect("no executable to load from");
            file.read_at(&mut buffer, file_offset);
            self.mmu.write_frame(frame, &buffer);
        }
        self.translation.update(vp, |e| {
            e.valid = true;
            e.physical_page = frame;
            e.addr_disk = None;
        });
        self.physmem.unlock_page(frame);
        Ok(())
    }

    /// Carve out a stack: a guard region with no access rights, then the
    /// stack pages, eagerly wired and zeroed. Returns the initial stack
    /// pointer (top of stack minus the argc/argv slot).
    pub fn stack_allocate(self: &Arc<Self>) -> Option<u64> {
        let page_size = self.cfg.page_size;
        self.alloc(STACK_GUARD_PAGES)?;
        let num_pages = self.cfg.user_stack_size.div_ceil(page_size);
        let base = self.alloc(num_pages)?;
        log::debug!(
            target: "vm",
            "allocated virtual area [{:#x},{:#x}) for stack",
            base * page_size,
            (base + num_pages) * page_size
        );
        for vp in base..base + num_pages {
            let frame = self.physmem.add_physical_to_virtual_mapping(self, vp).ok()?;
            self.mmu.zero_frame(frame);
            self.translation.update(vp, |e| {
                e.read_allowed = true;
                e.write_allowed = true;
                e.swap = false;
                e.io = false;
                e.addr_disk = None;
                e.valid = true;
                e.physical_page = frame;
            });
            self.physmem.unlock_page(frame);
        }
        Some(((base + num_pages) * page_size) as u64 - 4 * std::mem::size_of::<u32>() as u64)
    }

    /// Map `size` bytes of `file` into fresh virtual pages, demand-paged
    /// read/write. Returns the base virtual address.
    pub fn mmap(self: &Arc<Self>, file: Arc<OpenFile>, size: usize) -> Result<u64, ErrorKind> {
        if size == 0 {
            return Err(ErrorKind::IncError);
        }
        let page_size = self.cfg.page_size;
        let num_pages = size.div_ceil(page_size);
        let base = self.alloc(num_pages).ok_or(ErrorKind::OutOfMemory)?;
        for page in 0..num_pages {
            self.translation.update(base + page, |e| {
                e.read_allowed = true;
                e.write_allowed = true;
                e.swap = false;
                e.io = false;
                e.valid = false;
                e.addr_disk = Some((page * page_size) as u64);
            });
        }
        self.mapped_files.lock().unwrap().push(MappedRegion {
            file,
            first_page: base,
            num_pages,
        });
        log::debug!(
            target: "vm",
            "mapped file at [{:#x},{:#x})",
            base * page_size,
            (base + num_pages) * page_size
        );
        Ok((base * page_size) as u64)
    }

    /// The file backing virtual page `vp`: a mapped region when one covers
    /// it, the executable otherwise.
    pub fn backing_file(&self, vp: usize) -> Option<Arc<OpenFile>> {
        let mapped = self.mapped_files.lock().unwrap();
        for region in mapped.iter() {
            if vp >= region.first_page && vp < region.first_page + region.num_pages {
                return Some(region.file.clone());
            }
        }
        self.exec_file.clone()
    }

    /// Pages allocated so far.
    pub fn num_allocated_pages(&self) -> usize {
        *self.free_page_id.lock().unwrap()
    }
}

impl Drop for AddrSpace {
    /// Release every resource the space still holds: resident frames back
    /// to the frame table, staged pages back to the swap bitmap.
    fn drop(&mut self) {
        for vp in 0..self.num_allocated_pages() {
            let entry = self.translation.entry(vp);
            if entry.valid {
                self.physmem
                    .remove_physical_to_virtual_mapping(entry.physical_page);
            } else if entry.swap {
                if let Some(sector) = entry.addr_disk {
                    self.swap.release_page_swap(sector as u32);
                }
            }
        }
    }
}
