//! Page-fault resolution.
//!
//! A faulting page is brought in from wherever it lives: the swap disk,
//! its backing file (executable or mapped file), or nowhere (anonymous
//! pages are zero-filled). The frame stays locked and the page entry
//! carries the `io` bit for the whole transfer; faulters racing on the
//! same space serialize on the space's fault semaphore and re-check
//! residency after acquiring it, and a faulter finding the `io` bit set
//! (page-out in progress) yields until it clears.

use std::sync::Arc;

use rvos_machine::config::Config;
use rvos_machine::mmu::Mmu;
use rvos_machine::stats::Stats;

use crate::error::ErrorKind;
use crate::thread::scheduler::Scheduler;
use crate::vm::addrspace::AddrSpace;
use crate::vm::physmem::PhysicalMemManager;
use crate::vm::swap::SwapManager;

pub struct PageFaultManager {
    cfg: Arc<Config>,
    mmu: Arc<Mmu>,
    physmem: Arc<PhysicalMemManager>,
    swap: Arc<SwapManager>,
    sched: Arc<Scheduler>,
    stats: Arc<Stats>,
}

impl PageFaultManager {
    pub fn new(
        cfg: Arc<Config>,
        mmu: Arc<Mmu>,
        physmem: Arc<PhysicalMemManager>,
        swap: Arc<SwapManager>,
        sched: Arc<Scheduler>,
        stats: Arc<Stats>,
    ) -> Arc<PageFaultManager> {
        Arc::new(PageFaultManager {
            cfg,
            mmu,
            physmem,
            swap,
            sched,
            stats,
        })
    }

    /// Resolve a fault on virtual page `vp` of the current thread's
    /// address space. On return the page is resident and the faulting
    /// instruction can re-execute.
    pub fn page_fault(&self, vp: usize) -> Result<(), ErrorKind> {
        let current = self.sched.current_thread();
        let process = current
            .process()
            .expect("page fault outside any address space");
        let space = process.addrspace.clone();
        log::debug!(target: "vm", "page fault on virtual page {vp} of \"{}\"", current.name());

        space.fault_sem.p();
        let result = self.resolve(&space, vp);
        space.fault_sem.v();
        result
    }

    pub(crate) fn resolve(&self, space: &Arc<AddrSpace>, vp: usize) -> Result<(), ErrorKind> {
        // Another faulter may have resolved the page while we waited for
        // the semaphore, and an eviction in progress must finish before
        // the page can be mapped again.
        loop {
            let entry = space.translation.entry(vp);
            if entry.valid {
                return Ok(());
            }
            if !entry.io {
                break;
            }
            self.sched.yield_current();
            if space.translation.entry(vp).io && self.sched.ready_count() == 0 {
                // The evictor is parked in its page-out I/O; advance
                // simulated time so the completion interrupt can land.
                self.sched.interrupt().idle();
            }
        }

        let entry = space.translation.entry(vp);
        let frame = self.physmem.add_physical_to_virtual_mapping(space, vp)?;
        space.translation.update(vp, |e| e.io = true);

        let mut buffer = vec![0u8; self.cfg.page_size];
        if entry.swap {
            let sector = entry.addr_disk.expect("swap page without a sector") as u32;
            self.swap.get_page_swap(sector, &mut buffer);
            self.mmu.write_frame(frame, &buffer);
            self.swap.release_page_swap(sector);
            space.translation.update(vp, |e| {
                e.swap = false;
                e.addr_disk = None;
            });
        } else if let Some(offset) = entry.addr_disk {
            let file = space
                .backing_file(vp)
                .ok_or(ErrorKind::InexistFileError)?;
            file.read_at(&mut buffer, offset);
            self.mmu.write_frame(frame, &buffer);
        } else {
            self.mmu.zero_frame(frame);
        }

        space.translation.update(vp, |e| {
            e.valid = true;
            e.physical_page = frame;
            e.u = false;
            e.m = false;
            e.io = false;
        });
        self.physmem.unlock_page(frame);
        self.stats.incr_page_faults();
        Ok(())
    }
}
