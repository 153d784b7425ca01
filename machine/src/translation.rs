//! Per-address-space translation tables.
//!
//! A translation table is a flat array with one entry per virtual page,
//! sized once at address-space creation. There is no second level and no
//! indirection: the table *is* the page table the MMU walks.

use std::sync::Mutex;

/// One virtual page of one address space.
///
/// Invariants: `valid` implies the owning frame's back-link names this table
/// and this page; `io` implies the page cannot be evicted and concurrent
/// mappers must wait; neither access bit set means the page is unmapped and
/// any access raises an address error.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageTableEntry {
    /// Page is resident in physical memory.
    pub valid: bool,
    /// Referenced recently. Set by the MMU, cleared by page replacement.
    pub u: bool,
    /// Modified. Set by the MMU, cleared when the page is copied to disk.
    pub m: bool,
    /// Program may read the page.
    pub read_allowed: bool,
    /// Program may write the page.
    pub write_allowed: bool,
    /// Backing store is the swap disk; otherwise a file (or anonymous).
    pub swap: bool,
    /// Page is undergoing disk I/O; not evictable, mappers must wait.
    pub io: bool,
    /// Physical frame number. Meaningful iff `valid`.
    pub physical_page: usize,
    /// Swap sector when `swap`, byte offset into the backing file
    /// otherwise; `None` for an anonymous (zero-fill) page.
    pub addr_disk: Option<u64>,
}

/// A linear page table, indexed by virtual page number.
pub struct TranslationTable {
    entries: Mutex<Vec<PageTableEntry>>,
}

impl TranslationTable {
    /// Create a table of `max_num_pages` unmapped entries.
    pub fn new(max_num_pages: usize) -> Self {
        Self {
            entries: Mutex::new(vec![PageTableEntry::default(); max_num_pages]),
        }
    }

    pub fn max_num_pages(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Copy of the entry for `virtual_page`.
    pub fn entry(&self, virtual_page: usize) -> PageTableEntry {
        self.entries.lock().unwrap()[virtual_page]
    }

    /// Mutate the entry for `virtual_page` in place.
    pub fn update<R>(&self, virtual_page: usize, f: impl FnOnce(&mut PageTableEntry) -> R) -> R {
        f(&mut self.entries.lock().unwrap()[virtual_page])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_start_unmapped() {
        let table = TranslationTable::new(8);
        assert_eq!(table.max_num_pages(), 8);
        let e = table.entry(3);
        assert!(!e.valid && !e.read_allowed && !e.write_allowed);
        assert!(e.addr_disk.is_none());
    }

    #[test]
    fn update_is_visible() {
        let table = TranslationTable::new(4);
        table.update(2, |e| {
            e.valid = true;
            e.physical_page = 7;
            e.addr_disk = Some(640);
        });
        let e = table.entry(2);
        assert!(e.valid);
        assert_eq!(e.physical_page, 7);
        assert_eq!(e.addr_disk, Some(640));
    }
}
