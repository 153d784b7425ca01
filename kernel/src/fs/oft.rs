//! The open-file table.
//!
//! One entry per distinct open file name, holding a reference count, the
//! per-file lock serializing reads and writes, and the deferred-unlink
//! flag. A removed-while-open file stays readable through existing handles
//! and loses its data sectors at the last close. All structural mutation
//! happens under the table's creation lock, acquired by the file-system
//! entry points.

use std::sync::{Arc, Mutex};

use crate::error::ErrorKind;
use crate::fs::open_file::OpenFile;
use crate::fs::FileSystem;
use crate::sync::Lock;

/// Capacity of the table: how many distinct files can be open at once.
pub const NB_OFT_ENTRIES: usize = 15;

#[derive(Clone)]
struct OftEntry {
    name: String,
    /// Header sector of the file.
    sector: u32,
    /// Number of live handles onto this entry.
    refcount: i32,
    /// Unlinked while open; free the data at the last close.
    to_be_deleted: bool,
    lock: Arc<Lock>,
}

pub struct OpenFileTable {
    /// Serializes creation, open, close and remove against each other.
    pub create_lock: Lock,
    entries: Mutex<Vec<Option<OftEntry>>>,
}

impl OpenFileTable {
    pub fn new(create_lock: Lock) -> OpenFileTable {
        OpenFileTable {
            create_lock,
            entries: Mutex::new(vec![None; NB_OFT_ENTRIES]),
        }
    }

    fn find(&self, name: &str) -> Option<(usize, OftEntry)> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .position(|e| matches!(e, Some(entry) if entry.name == name))
            .map(|i| (i, entries[i].clone().unwrap()))
    }

    fn free_slot(&self) -> Option<usize> {
        self.entries.lock().unwrap().iter().position(Option::is_none)
    }

    /// Reference count of the named entry, if present.
    pub fn refcount(&self, name: &str) -> Option<i32> {
        self.find(name).map(|(_, e)| e.refcount)
    }

    /// Open `path`, yielding a fresh handle sharing the entry's per-file
    /// lock. Caller holds the creation lock.
    pub(super) fn open(&self, fs: &FileSystem, path: &str) -> Result<Arc<OpenFile>, ErrorKind> {
        if let Some((index, entry)) = self.find(path) {
            if entry.to_be_deleted {
                // Nobody may reopen a file pending deletion.
                return Err(ErrorKind::OpenFileError);
            }
            self.entries.lock().unwrap()[index]
                .as_mut()
                .unwrap()
                .refcount += 1;
            let file = fs.open_sector_locked(entry.sector, Some(entry.lock.clone()));
            file.set_name(path);
            log::debug!(target: "fs", "file {path} was in the open-file table");
            return Ok(Arc::new(file));
        }

        let slot = self.free_slot().ok_or(ErrorKind::OpenFileError)?;
        let (dir_sector, leaf) = fs.find_dir(path)?;
        let (_, directory) = fs.fetch_directory(dir_sector);
        let sector = directory.find(&leaf).ok_or(ErrorKind::InexistFileError)?;
        let probe = fs.open_sector(sector);
        if probe.is_dir() {
            return Err(ErrorKind::NotAFile);
        }
        let lock = Arc::new(Lock::new("file synchronisation", fs.sched().clone()));
        self.entries.lock().unwrap()[slot] = Some(OftEntry {
            name: path.to_string(),
            sector,
            refcount: 1,
            to_be_deleted: false,
            lock: lock.clone(),
        });
        let file = fs.open_sector_locked(sector, Some(lock));
        file.set_name(path);
        log::debug!(target: "fs", "file {path} opened");
        Ok(Arc::new(file))
    }

    /// Drop one reference to the named entry; the last close destroys the
    /// entry and completes a pending unlink. Caller holds the creation
    /// lock.
    pub(super) fn close(&self, fs: &FileSystem, name: &str) {
        let Some((index, _)) = self.find(name) else {
            return;
        };
        let released = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries[index].as_mut().unwrap();
            entry.refcount -= 1;
            if entry.refcount <= 0 {
                entries[index].take()
            } else {
                None
            }
        };
        if let Some(entry) = released {
            log::debug!(target: "fs", "file {name} left the open-file table");
            if entry.to_be_deleted {
                fs.free_file_data(entry.sector);
            }
        }
    }

    /// Unlink `path` from its directory. An open file is only marked; its
    /// sectors are freed at the last close. Caller holds the creation
    /// lock.
    pub(super) fn remove(&self, fs: &FileSystem, path: &str) -> Result<(), ErrorKind> {
        let (dir_sector, leaf) = fs.find_dir(path)?;
        let (dir_file, mut directory) = fs.fetch_directory(dir_sector);
        directory.find(&leaf).ok_or(ErrorKind::InexistFileError)?;
        if let Some((index, _)) = self.find(path) {
            self.entries.lock().unwrap()[index]
                .as_mut()
                .unwrap()
                .to_be_deleted = true;
            directory.remove(&leaf)?;
            directory.write_back(&dir_file);
            log::debug!(target: "fs", "file {path} unlinked while open");
            Ok(())
        } else {
            fs.remove_file(path)
        }
    }
}
