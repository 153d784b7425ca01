//! File headers (inodes).
//!
//! A header occupies exactly one sector and maps a file's bytes onto disk
//! sectors through direct pointers only; there is no indirection, so the
//! largest file is `NumDirect` sectors. Layout, all little-endian u32:
//! length in bytes, length in sectors, directory flag, parent-directory
//! header sector, then the direct block array filling the rest of the
//! sector.

use std::sync::Arc;

use rvos_machine::config::Config;

use crate::drivers::DriverDisk;
use crate::error::ErrorKind;
use crate::fs::bitmap::BitMap;

/// Sector number that marks "no sector".
pub const INVALID_SECTOR: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct FileHeader {
    pub num_bytes: u32,
    pub num_sectors: u32,
    pub is_dir: bool,
    pub parent_sector: u32,
    data_sectors: Vec<u32>,
    sector_size: usize,
}

impl FileHeader {
    /// An empty header for a regular file.
    pub fn new(cfg: &Config) -> FileHeader {
        FileHeader {
            num_bytes: 0,
            num_sectors: 0,
            is_dir: false,
            parent_sector: 0,
            data_sectors: vec![INVALID_SECTOR; cfg.num_direct()],
            sector_size: cfg.sector_size,
        }
    }

    /// Claim space for a `file_size`-byte file out of `freemap`.
    pub fn allocate(&mut self, freemap: &mut BitMap, file_size: usize) -> Result<(), ErrorKind> {
        let num_sectors = file_size.div_ceil(self.sector_size);
        if num_sectors > self.data_sectors.len() {
            return Err(ErrorKind::FileTooLarge);
        }
        if freemap.num_clear() < num_sectors {
            return Err(ErrorKind::OutOfDisk);
        }
        self.num_bytes = file_size as u32;
        self.num_sectors = num_sectors as u32;
        for i in 0..num_sectors {
            self.data_sectors[i] = freemap.find().unwrap() as u32;
        }
        Ok(())
    }

    /// Return this file's data sectors to `freemap`.
    pub fn deallocate(&self, freemap: &mut BitMap) {
        for i in 0..self.num_sectors as usize {
            assert!(
                freemap.test(self.data_sectors[i] as usize),
                "freeing an unallocated sector"
            );
            freemap.clear(self.data_sectors[i] as usize);
        }
    }

    /// Disk sector holding the byte at `offset`.
    pub fn byte_to_sector(&self, offset: u64) -> u32 {
        self.data_sectors[(offset / self.sector_size as u64) as usize]
    }

    pub fn length(&self) -> u32 {
        self.num_bytes
    }

    pub fn data_sectors(&self) -> &[u32] {
        &self.data_sectors[..self.num_sectors as usize]
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.sector_size);
        bytes.extend_from_slice(&self.num_bytes.to_le_bytes());
        bytes.extend_from_slice(&self.num_sectors.to_le_bytes());
        bytes.extend_from_slice(&(self.is_dir as u32).to_le_bytes());
        bytes.extend_from_slice(&self.parent_sector.to_le_bytes());
        for sector in &self.data_sectors {
            bytes.extend_from_slice(&sector.to_le_bytes());
        }
        assert_eq!(bytes.len(), self.sector_size);
        bytes
    }

    fn from_bytes(cfg: &Config, bytes: &[u8]) -> FileHeader {
        let word = |i: usize| {
            u32::from_le_bytes(bytes[4 * i..4 * i + 4].try_into().unwrap())
        };
        let mut header = FileHeader::new(cfg);
        header.num_bytes = word(0);
        header.num_sectors = word(1);
        header.is_dir = word(2) != 0;
        header.parent_sector = word(3);
        for i in 0..header.data_sectors.len() {
            header.data_sectors[i] = word(4 + i);
        }
        header
    }

    /// Read a header back from its sector.
    pub fn fetch_from(cfg: &Config, disk: &Arc<DriverDisk>, sector: u32) -> FileHeader {
        let mut bytes = vec![0u8; cfg.sector_size];
        disk.read_sector(sector, &mut bytes);
        FileHeader::from_bytes(cfg, &bytes)
    }

    /// Write this header to its sector.
    pub fn write_back(&self, disk: &Arc<DriverDisk>, sector: u32) {
        disk.write_sector(sector, &self.to_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::default()
    }

    #[test]
    fn allocate_claims_exact_sector_count() {
        let cfg = cfg();
        let mut freemap = BitMap::new(64);
        let mut header = FileHeader::new(&cfg);
        header.allocate(&mut freemap, 300).unwrap();
        assert_eq!(header.num_sectors, 3);
        assert_eq!(header.length(), 300);
        assert_eq!(freemap.num_clear(), 61);
        assert_eq!(header.byte_to_sector(0), header.data_sectors()[0]);
        assert_eq!(header.byte_to_sector(299), header.data_sectors()[2]);
        header.deallocate(&mut freemap);
        assert_eq!(freemap.num_clear(), 64);
    }

    #[test]
    fn allocate_rejects_oversized_file() {
        let cfg = cfg();
        let mut freemap = BitMap::new(1024);
        let mut header = FileHeader::new(&cfg);
        let max = cfg.max_file_size();
        assert!(header.allocate(&mut freemap, max).is_ok());
        let mut header = FileHeader::new(&cfg);
        assert_eq!(
            header.allocate(&mut freemap, max + 1),
            Err(ErrorKind::FileTooLarge)
        );
    }

    #[test]
    fn allocate_fails_when_disk_full() {
        let cfg = cfg();
        let mut freemap = BitMap::new(2);
        let mut header = FileHeader::new(&cfg);
        assert_eq!(
            header.allocate(&mut freemap, 3 * cfg.sector_size),
            Err(ErrorKind::OutOfDisk)
        );
    }

    #[test]
    fn byte_serialization_round_trips() {
        let cfg = cfg();
        let mut freemap = BitMap::new(64);
        let mut header = FileHeader::new(&cfg);
        header.is_dir = true;
        header.parent_sector = 1;
        header.allocate(&mut freemap, 200).unwrap();
        let copy = FileHeader::from_bytes(&cfg, &header.to_bytes());
        assert_eq!(copy.num_bytes, 200);
        assert_eq!(copy.num_sectors, 2);
        assert!(copy.is_dir);
        assert_eq!(copy.parent_sector, 1);
        assert_eq!(copy.data_sectors(), header.data_sectors());
    }
}
