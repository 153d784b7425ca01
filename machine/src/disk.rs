//! Raw disk device emulation.
//!
//! A disk is a fixed run of [`NUM_SECTORS`] equal-size sectors backed by a
//! host file, stamped with a magic number so a stale image is never
//! mistaken for a disk. Requests are asynchronous: the data moves
//! immediately (simulated DMA) and a completion interrupt fires a fixed
//! number of ticks later. Only one request may be outstanding; the
//! synchronous layer above (the disk driver) enforces that with a lock.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::interrupt::Interrupt;
use crate::stats::Stats;

/// Number of sectors of every disk unit.
pub const NUM_SECTORS: usize = 1024;
/// Stamp identifying a valid disk image.
pub const MAGIC_NUMBER: u32 = 0x456789ab;
/// Ticks between a request and its completion interrupt.
pub const DISK_DELAY: u64 = 100;

/// Completion callback installed by the disk driver.
pub type RequestDone = Arc<dyn Fn() + Send + Sync>;

pub struct Disk {
    name: &'static str,
    sector_size: usize,
    file: Mutex<File>,
    busy: Arc<AtomicBool>,
    handler: Mutex<Option<RequestDone>>,
    interrupt: Arc<Interrupt>,
    stats: Arc<Stats>,
}

impl Disk {
    /// Open (or create and stamp) the image at `path`.
    pub fn new(
        name: &'static str,
        path: &Path,
        sector_size: usize,
        interrupt: Arc<Interrupt>,
        stats: Arc<Stats>,
    ) -> std::io::Result<Self> {
        let fresh = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if fresh {
            file.write_all(&MAGIC_NUMBER.to_le_bytes())?;
            file.set_len((4 + NUM_SECTORS * sector_size) as u64)?;
            log::debug!(target: "machine", "{name}: created fresh image {}", path.display());
        } else {
            let mut magic = [0u8; 4];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut magic)?;
            assert_eq!(
                u32::from_le_bytes(magic),
                MAGIC_NUMBER,
                "{name}: {} is not a disk image",
                path.display()
            );
        }
        Ok(Self {
            name,
            sector_size,
            file: Mutex::new(file),
            busy: Arc::new(AtomicBool::new(false)),
            handler: Mutex::new(None),
            interrupt,
            stats,
        })
    }

    /// Install the completion callback. Called once by the disk driver.
    pub fn set_request_done(&self, handler: RequestDone) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn begin_request(&self) {
        assert!(
            !self.busy.swap(true, Ordering::SeqCst),
            "{}: request while device busy",
            self.name
        );
    }

    fn schedule_completion(&self) {
        let busy = self.busy.clone();
        let handler = self.handler.lock().unwrap().clone();
        self.interrupt.schedule(
            DISK_DELAY,
            Box::new(move || {
                busy.store(false, Ordering::SeqCst);
                if let Some(handler) = handler {
                    handler();
                }
            }),
        );
    }

    /// Read one sector into `data`; completion interrupt follows.
    pub fn read_request(&self, sector: usize, data: &mut [u8]) {
        assert!(sector < NUM_SECTORS);
        assert_eq!(data.len(), self.sector_size);
        self.begin_request();
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((4 + sector * self.sector_size) as u64))
            .unwrap();
        file.read_exact(data).unwrap();
        drop(file);
        self.stats.incr_disk_reads();
        log::trace!(target: "machine", "{}: read sector {sector}", self.name);
        self.schedule_completion();
    }

    /// Write one sector from `data`; completion interrupt follows.
    pub fn write_request(&self, sector: usize, data: &[u8]) {
        assert!(sector < NUM_SECTORS);
        assert_eq!(data.len(), self.sector_size);
        self.begin_request();
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((4 + sector * self.sector_size) as u64))
            .unwrap();
        file.write_all(data).unwrap();
        drop(file);
        self.stats.incr_disk_writes();
        log::trace!(target: "machine", "{}: wrote sector {sector}", self.name);
        self.schedule_completion();
    }
}
