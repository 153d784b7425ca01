//! The swap area.
//!
//! A dedicated disk whose sectors are handed out by a bitmap. Evicted
//! dirty pages are staged here; a page read back in gives its sector up
//! immediately (it will claim a fresh one if evicted again).

use std::sync::{Arc, Mutex};

use rvos_machine::disk::NUM_SECTORS;

use crate::drivers::DriverDisk;
use crate::fs::bitmap::BitMap;

pub struct SwapManager {
    disk: Arc<DriverDisk>,
    page_flags: Mutex<BitMap>,
}

impl SwapManager {
    pub fn new(disk: Arc<DriverDisk>) -> Arc<SwapManager> {
        Arc::new(SwapManager {
            disk,
            page_flags: Mutex::new(BitMap::new(NUM_SECTORS)),
        })
    }

    /// Claim a free swap sector.
    pub fn get_free_page(&self) -> Option<u32> {
        self.page_flags.lock().unwrap().find().map(|s| s as u32)
    }

    /// Return a swap sector to the free pool.
    pub fn release_page_swap(&self, sector: u32) {
        log::trace!(target: "vm", "swap sector {sector} released");
        self.page_flags.lock().unwrap().clear(sector as usize);
    }

    /// Read the page staged at `sector` into `buffer`.
    pub fn get_page_swap(&self, sector: u32, buffer: &mut [u8]) {
        log::trace!(target: "vm", "reading swap sector {sector}");
        self.disk.read_sector(sector, buffer);
    }

    /// Stage a page in the swap area. Writes to `sector` when given one,
    /// otherwise claims a free sector; returns the sector actually used,
    /// or `None` when the swap area is full.
    pub fn put_page_swap(&self, sector: Option<u32>, buffer: &[u8]) -> Option<u32> {
        let sector = match sector {
            Some(s) => s,
            None => self.get_free_page()?,
        };
        log::trace!(target: "vm", "writing swap sector {sector}");
        self.disk.write_sector(sector, buffer);
        Some(sector)
    }

    /// Unallocated swap sectors.
    pub fn num_free(&self) -> usize {
        self.page_flags.lock().unwrap().num_clear()
    }
}
