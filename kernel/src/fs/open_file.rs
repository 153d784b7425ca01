//! Open-file handles.
//!
//! A seekable, byte-oriented view over a file header. `read_at`/`write_at`
//! move whole sectors through the disk driver and copy the relevant window;
//! writes never grow the file (the range past end-of-file is truncated).
//! Handles produced by the open-file table share that table entry's lock,
//! making every read or write call atomic with respect to other holders of
//! the same file.

use std::sync::{Arc, Mutex};

use rvos_machine::config::Config;
use rvos_machine::elf::ReadAt;

use crate::drivers::DriverDisk;
use crate::fs::header::FileHeader;
use crate::sync::Lock;

pub struct OpenFile {
    name: Mutex<String>,
    /// Sector holding this file's header.
    sector: u32,
    header: FileHeader,
    position: Mutex<u64>,
    disk: Arc<DriverDisk>,
    cfg: Arc<Config>,
    /// Per-file lock of the open-file-table entry, when opened through it.
    lock: Option<Arc<Lock>>,
}

impl OpenFile {
    /// Open the file whose header sits at `sector`.
    pub fn from_sector(
        cfg: Arc<Config>,
        disk: Arc<DriverDisk>,
        sector: u32,
        lock: Option<Arc<Lock>>,
    ) -> OpenFile {
        let header = FileHeader::fetch_from(&cfg, &disk, sector);
        OpenFile {
            name: Mutex::new(String::new()),
            sector,
            header,
            position: Mutex::new(0),
            disk,
            cfg,
            lock,
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    pub fn header_sector(&self) -> u32 {
        self.sector
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn is_dir(&self) -> bool {
        self.header.is_dir
    }

    pub fn length(&self) -> u64 {
        self.header.length() as u64
    }

    /// Move the seek pointer.
    pub fn seek(&self, position: u64) {
        *self.position.lock().unwrap() = position;
    }

    pub fn tell(&self) -> u64 {
        *self.position.lock().unwrap()
    }

    /// Read at the seek pointer, advancing it.
    pub fn read(&self, into: &mut [u8]) -> usize {
        let position = self.tell();
        let num_read = self.read_at(into, position);
        self.seek(position + num_read as u64);
        num_read
    }

    /// Write at the seek pointer, advancing it.
    pub fn write(&self, from: &[u8]) -> usize {
        let position = self.tell();
        let num_written = self.write_at(from, position);
        self.seek(position + num_written as u64);
        num_written
    }

    /// Read up to `into.len()` bytes starting at `position`. Short reads
    /// happen at end of file; exactly at end of file, zero.
    pub fn read_at(&self, into: &mut [u8], position: u64) -> usize {
        self.with_file_lock(|| self.do_read_at(into, position))
    }

    /// Write up to `from.len()` bytes starting at `position`, truncated to
    /// the file length.
    pub fn write_at(&self, from: &[u8], position: u64) -> usize {
        self.with_file_lock(|| self.do_write_at(from, position))
    }

    fn with_file_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        if let Some(lock) = &self.lock {
            lock.acquire();
            let result = f();
            lock.release();
            result
        } else {
            f()
        }
    }

    fn do_read_at(&self, into: &mut [u8], position: u64) -> usize {
        let sector_size = self.cfg.sector_size as u64;
        let length = self.length();
        if position >= length || into.is_empty() {
            return 0;
        }
        let num_bytes = into.len().min((length - position) as usize);
        let first_sector = position / sector_size;
        let last_sector = (position + num_bytes as u64 - 1) / sector_size;

        let mut staging =
            vec![0u8; ((last_sector - first_sector + 1) * sector_size) as usize];
        for (i, sector_index) in (first_sector..=last_sector).enumerate() {
            let sector = self.header.byte_to_sector(sector_index * sector_size);
            self.disk.read_sector(
                sector,
                &mut staging[i * sector_size as usize..(i + 1) * sector_size as usize],
            );
        }
        let start = (position - first_sector * sector_size) as usize;
        into[..num_bytes].copy_from_slice(&staging[start..start + num_bytes]);
        num_bytes
    }

    fn do_write_at(&self, from: &[u8], position: u64) -> usize {
        let sector_size = self.cfg.sector_size as u64;
        let length = self.length();
        if position >= length || from.is_empty() {
            return 0;
        }
        let num_bytes = from.len().min((length - position) as usize);
        let first_sector = position / sector_size;
        let last_sector = (position + num_bytes as u64 - 1) / sector_size;
        let num_staging = (last_sector - first_sector + 1) as usize;

        let mut staging = vec![0u8; num_staging * sector_size as usize];
        let start = (position - first_sector * sector_size) as usize;
        // Partially overwritten edge sectors keep their surroundings.
        if start > 0 {
            let sector = self.header.byte_to_sector(first_sector * sector_size);
            self.disk
                .read_sector(sector, &mut staging[..sector_size as usize]);
        }
        if start + num_bytes < staging.len() && (num_staging > 1 || start == 0) {
            let sector = self.header.byte_to_sector(last_sector * sector_size);
            self.disk.read_sector(
                sector,
                &mut staging[(num_staging - 1) * sector_size as usize..],
            );
        }
        staging[start..start + num_bytes].copy_from_slice(&from[..num_bytes]);
        for (i, sector_index) in (first_sector..=last_sector).enumerate() {
            let sector = self.header.byte_to_sector(sector_index * sector_size);
            self.disk.write_sector(
                sector,
                &staging[i * sector_size as usize..(i + 1) * sector_size as usize],
            );
        }
        num_bytes
    }
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("name", &self.name())
            .field("sector", &self.sector)
            .field("length", &self.length())
            .finish()
    }
}

impl ReadAt for OpenFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        OpenFile::read_at(self, buf, offset)
    }
}
