//! Physical frame management.
//!
//! A frame table mirrors the machine's physical pages: free or owned by
//! exactly one (address space, virtual page) pair, with a lock bit pinning
//! frames whose contents are in flux. When no frame is free, the clock
//! algorithm picks a victim: referenced frames get their U bit cleared and
//! a second chance, unreferenced ones are evicted, staging dirty or
//! unbacked contents to swap first.
//!
//! The back-link to the owner is a weak reference resolved at use; a
//! frame whose address space died collapses to reclaimable space instead
//! of a dangling pointer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use rvos_machine::config::Config;
use rvos_machine::mmu::Mmu;

use crate::error::ErrorKind;
use crate::vm::addrspace::AddrSpace;
use crate::vm::swap::SwapManager;

#[derive(Clone)]
pub struct FrameEntry {
    pub free: bool,
    /// Pinned: not a candidate for eviction.
    pub locked: bool,
    /// Virtual page this frame backs. Meaningful when owned.
    pub virtual_page: usize,
    pub owner: Option<Weak<AddrSpace>>,
}

impl FrameEntry {
    fn empty() -> FrameEntry {
        FrameEntry {
            free: true,
            locked: false,
            virtual_page: 0,
            owner: None,
        }
    }
}

pub struct PhysicalMemManager {
    cfg: Arc<Config>,
    mmu: Arc<Mmu>,
    swap: Arc<SwapManager>,
    frames: Mutex<Vec<FrameEntry>>,
    free_list: Mutex<VecDeque<usize>>,
    clock: Mutex<usize>,
}

impl PhysicalMemManager {
    pub fn new(cfg: Arc<Config>, mmu: Arc<Mmu>, swap: Arc<SwapManager>) -> Arc<Self> {
        let num_frames = cfg.num_phys_pages as usize;
        Arc::new(PhysicalMemManager {
            cfg,
            mmu,
            swap,
            frames: Mutex::new(vec![FrameEntry::empty(); num_frames]),
            free_list: Mutex::new((0..num_frames).collect()),
            clock: Mutex::new(0),
        })
    }

    /// Take a frame off the free list, or `None` when memory is full.
    /// Does not run the replacement algorithm.
    pub fn find_free_page(&self) -> Option<usize> {
        let frame = self.free_list.lock().unwrap().pop_front()?;
        let mut frames = self.frames.lock().unwrap();
        assert!(frames[frame].free, "free list holds an owned frame");
        frames[frame].free = false;
        Some(frame)
    }

    /// Give `owner`'s virtual page `vp` a frame, evicting if none is
    /// free. The frame comes back locked; the caller unlocks it once the
    /// populating I/O is done.
    pub fn add_physical_to_virtual_mapping(
        &self,
        owner: &Arc<AddrSpace>,
        vp: usize,
    ) -> Result<usize, ErrorKind> {
        let frame = match self.find_free_page() {
            Some(frame) => frame,
            None => self.evict_page()?,
        };
        let mut frames = self.frames.lock().unwrap();
        frames[frame] = FrameEntry {
            free: false,
            locked: true,
            virtual_page: vp,
            owner: Some(Arc::downgrade(owner)),
        };
        Ok(frame)
    }

    /// Second-chance replacement. Returns a claimed, locked frame.
    fn evict_page(&self) -> Result<usize, ErrorKind> {
        let num_frames = self.cfg.num_phys_pages as usize;
        // Two sweeps clear every U bit, a third finds a victim; beyond
        // that everything is locked, which is a kernel bug.
        for _ in 0..3 * num_frames {
            let frame = {
                let mut clock = self.clock.lock().unwrap();
                *clock = (*clock + 1) % num_frames;
                *clock
            };
            let (owner, vp) = {
                let mut frames = self.frames.lock().unwrap();
                let entry = &frames[frame];
                if entry.free || entry.locked {
                    continue;
                }
                let vp = entry.virtual_page;
                match entry.owner.as_ref().and_then(Weak::upgrade) {
                    Some(owner) => {
                        if owner.translation.entry(vp).u {
                            // Second chance.
                            owner.translation.update(vp, |e| e.u = false);
                            continue;
                        }
                        // Victim found; pin it across the page-out so a
                        // concurrent fault cannot steal it.
                        frames[frame].locked = true;
                        (owner, vp)
                    }
                    None => {
                        // The owning address space is gone; the frame is
                        // plain reclaimable space.
                        frames[frame].locked = true;
                        frames[frame].owner = None;
                        return Ok(frame);
                    }
                }
            };
            self.page_out(&owner, vp, frame)?;
            return Ok(frame);
        }
        panic!("clock algorithm found no evictable frame");
    }

    /// Detach `vp` from `frame`, staging its contents to swap when they
    /// exist nowhere else.
    fn page_out(&self, owner: &Arc<AddrSpace>, vp: usize, frame: usize) -> Result<(), ErrorKind> {
        let entry = owner.translation.entry(vp);
        assert!(entry.valid && entry.physical_page == frame);
        owner.translation.update(vp, |e| {
            e.valid = false;
            e.io = true;
        });
        // Dirty pages, and pages with no backing store at all (anonymous
        // pages that were populated in place), must reach the swap disk;
        // clean file-backed pages can be refetched from their file.
        let must_write = entry.m || (!entry.swap && entry.addr_disk.is_none());
        if must_write {
            let mut buffer = vec![0u8; self.cfg.page_size];
            self.mmu.read_frame(frame, &mut buffer);
            let previous = if entry.swap {
                entry.addr_disk.map(|s| s as u32)
            } else {
                None
            };
            let sector = self
                .swap
                .put_page_swap(previous, &buffer)
                .ok_or(ErrorKind::OutOfDisk)?;
            owner.translation.update(vp, |e| {
                e.swap = true;
                e.addr_disk = Some(sector as u64);
                e.m = false;
                e.io = false;
            });
        } else {
            owner.translation.update(vp, |e| e.io = false);
        }
        log::debug!(
            target: "vm",
            "evicted virtual page {vp} from frame {frame} (written {must_write})"
        );
        Ok(())
    }

    /// Free a frame, clearing the owner's resident bit when the owner is
    /// still alive.
    pub fn remove_physical_to_virtual_mapping(&self, frame: usize) {
        let (owner, vp) = {
            let mut frames = self.frames.lock().unwrap();
            let entry = &mut frames[frame];
            assert!(!entry.free, "freeing a frame twice");
            let owner = entry.owner.take();
            entry.free = true;
            entry.locked = false;
            (owner, entry.virtual_page)
        };
        if let Some(owner) = owner.and_then(|w| w.upgrade()) {
            owner.translation.update(vp, |e| e.valid = false);
        }
        self.free_list.lock().unwrap().push_front(frame);
    }

    /// Drop the pin a fault handler placed on `frame`.
    pub fn unlock_page(&self, frame: usize) {
        let mut frames = self.frames.lock().unwrap();
        assert!(!frames[frame].free && frames[frame].locked);
        frames[frame].locked = false;
    }

    /// Re-point a frame at another address space's page.
    pub fn change_owner(&self, frame: usize, owner: &Arc<AddrSpace>, vp: usize) {
        let mut frames = self.frames.lock().unwrap();
        assert!(!frames[frame].free);
        frames[frame].owner = Some(Arc::downgrade(owner));
        frames[frame].virtual_page = vp;
    }

    /// Verify the frame-table invariants: the free list and the owned
    /// frames partition the frame set, and every owned frame's back-link
    /// matches a resident page pointing back at it.
    pub fn audit(&self) {
        let frames = self.frames.lock().unwrap();
        let free_list = self.free_list.lock().unwrap();
        for (i, entry) in frames.iter().enumerate() {
            let on_free_list = free_list.contains(&i);
            assert_eq!(
                entry.free, on_free_list,
                "frame {i}: free flag and free list disagree"
            );
            if entry.free {
                assert!(entry.owner.is_none(), "frame {i}: free but owned");
                assert!(!entry.locked, "frame {i}: free but locked");
            } else if let Some(owner) = entry.owner.as_ref().and_then(Weak::upgrade) {
                let pte = owner.translation.entry(entry.virtual_page);
                if pte.valid {
                    assert_eq!(
                        pte.physical_page, i,
                        "frame {i}: back-link does not match page table"
                    );
                }
            }
        }
    }

    #[allow(dead_code)]
    pub(crate) fn frame(&self, index: usize) -> FrameEntry {
        self.frames.lock().unwrap()[index].clone()
    }
}
