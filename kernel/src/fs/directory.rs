//! Directories.
//!
//! A directory is a file whose contents are exactly `NumDirEntries`
//! fixed-size records of `{u32 inUse, name[FILE_NAME_MAX_LEN], u32
//! sector}`. Capacity never grows: a full table is a distinct error.
//! Names are length-limited, case-sensitive and contain no '/'.

use crate::error::ErrorKind;
use crate::fs::open_file::OpenFile;
use crate::fs::FileSystem;

/// On-disk length of a directory entry's name field.
pub const FILE_NAME_MAX_LEN: usize = 28;

/// Serialized size of one entry.
pub const DIR_ENTRY_SIZE: usize = 4 + FILE_NAME_MAX_LEN + 4;

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub in_use: bool,
    pub name: String,
    /// Sector of the entry's file header.
    pub sector: u32,
}

impl DirectoryEntry {
    fn empty() -> DirectoryEntry {
        DirectoryEntry {
            in_use: false,
            name: String::new(),
            sector: 0,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DIR_ENTRY_SIZE);
        bytes.extend_from_slice(&(self.in_use as u32).to_le_bytes());
        let mut name = [0u8; FILE_NAME_MAX_LEN];
        let raw = self.name.as_bytes();
        let n = raw.len().min(FILE_NAME_MAX_LEN);
        name[..n].copy_from_slice(&raw[..n]);
        bytes.extend_from_slice(&name);
        bytes.extend_from_slice(&self.sector.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> DirectoryEntry {
        let in_use = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) != 0;
        let name_bytes = &bytes[4..4 + FILE_NAME_MAX_LEN];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(FILE_NAME_MAX_LEN);
        let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
        let sector = u32::from_le_bytes(
            bytes[4 + FILE_NAME_MAX_LEN..DIR_ENTRY_SIZE].try_into().unwrap(),
        );
        DirectoryEntry { in_use, name, sector }
    }
}

pub struct Directory {
    table: Vec<DirectoryEntry>,
}

impl Directory {
    /// An empty directory of `size` entries.
    pub fn new(size: usize) -> Directory {
        Directory {
            table: (0..size).map(|_| DirectoryEntry::empty()).collect(),
        }
    }

    /// Size of the serialized form, in bytes.
    pub fn file_size(num_entries: usize) -> usize {
        num_entries * DIR_ENTRY_SIZE
    }

    /// Read the table from its backing file.
    pub fn fetch_from(&mut self, file: &OpenFile) {
        let mut bytes = vec![0u8; self.table.len() * DIR_ENTRY_SIZE];
        file.read_at(&mut bytes, 0);
        for (i, chunk) in bytes.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            self.table[i] = DirectoryEntry::from_bytes(chunk);
        }
    }

    /// Write the table back to its backing file.
    pub fn write_back(&self, file: &OpenFile) {
        let bytes: Vec<u8> = self.table.iter().flat_map(|e| e.to_bytes()).collect();
        file.write_at(&bytes, 0);
    }

    fn find_index(&self, name: &str) -> Option<usize> {
        let name = truncated(name);
        self.table
            .iter()
            .position(|e| e.in_use && e.name == name)
    }

    /// Header sector of the named entry.
    pub fn find(&self, name: &str) -> Option<u32> {
        self.find_index(name).map(|i| self.table[i].sector)
    }

    /// Add an entry. Fails when the name exists or the table is full.
    pub fn add(&mut self, name: &str, sector: u32) -> Result<(), ErrorKind> {
        if self.find_index(name).is_some() {
            return Err(ErrorKind::AlreadyInDirectory);
        }
        match self.table.iter_mut().find(|e| !e.in_use) {
            Some(entry) => {
                entry.in_use = true;
                entry.name = truncated(name);
                entry.sector = sector;
                Ok(())
            }
            None => Err(ErrorKind::NoSpaceInDirectory),
        }
    }

    /// Mark the named entry unused. Data blocks are reclaimed by the file
    /// system layer, not here.
    pub fn remove(&mut self, name: &str) -> Result<(), ErrorKind> {
        match self.find_index(name) {
            Some(i) => {
                self.table[i].in_use = false;
                Ok(())
            }
            None => Err(ErrorKind::InexistFileError),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.table.iter().all(|e| !e.in_use)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.table.iter().filter(|e| e.in_use)
    }

    /// Append a tree listing of this directory to `out`, descending into
    /// subdirectories. Entries at `depth` are prefixed with a `+--` branch
    /// marker.
    pub fn list(&self, fs: &FileSystem, depth: usize, out: &mut String) {
        for entry in self.entries() {
            for j in 0..depth {
                if j + 3 < depth {
                    out.push(' ');
                } else if j + 3 == depth {
                    out.push('+');
                } else {
                    out.push('-');
                }
            }
            out.push_str(&entry.name);
            let file = fs.open_sector(entry.sector);
            if file.is_dir() {
                out.push_str("(D)\n");
                let mut sub = Directory::new(self.table.len());
                sub.fetch_from(&file);
                sub.list(fs, depth + 4, out);
            } else {
                out.push('\n');
            }
        }
    }
}

fn truncated(name: &str) -> String {
    if name.len() > FILE_NAME_MAX_LEN {
        let mut end = FILE_NAME_MAX_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name[..end].to_string()
    } else {
        name.to_string()
    }
}
