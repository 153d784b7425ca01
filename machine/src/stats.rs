//! Simulated-time and event statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for everything the machine does, reported at halt when
/// `PrintStat` is set. Ticks are split by what the processor was doing.
#[derive(Default)]
pub struct Stats {
    system_ticks: AtomicU64,
    user_ticks: AtomicU64,
    idle_ticks: AtomicU64,
    num_disk_reads: AtomicU64,
    num_disk_writes: AtomicU64,
    num_console_chars_read: AtomicU64,
    num_console_chars_written: AtomicU64,
    num_page_faults: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_system_ticks(&self, n: u64) {
        self.system_ticks.fetch_add(n, Ordering::SeqCst);
    }

    pub fn add_user_ticks(&self, n: u64) {
        self.user_ticks.fetch_add(n, Ordering::SeqCst);
    }

    pub fn add_idle_ticks(&self, n: u64) {
        self.idle_ticks.fetch_add(n, Ordering::SeqCst);
    }

    pub fn incr_disk_reads(&self) {
        self.num_disk_reads.fetch_add(1, Ordering::SeqCst);
    }

    pub fn incr_disk_writes(&self) {
        self.num_disk_writes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn incr_console_chars_read(&self) {
        self.num_console_chars_read.fetch_add(1, Ordering::SeqCst);
    }

    pub fn incr_console_chars_written(&self) {
        self.num_console_chars_written.fetch_add(1, Ordering::SeqCst);
    }

    pub fn incr_page_faults(&self) {
        self.num_page_faults.fetch_add(1, Ordering::SeqCst);
    }

    pub fn page_faults(&self) -> u64 {
        self.num_page_faults.load(Ordering::SeqCst)
    }

    /// Total simulated time since boot.
    pub fn total_ticks(&self) -> u64 {
        self.system_ticks.load(Ordering::SeqCst)
            + self.user_ticks.load(Ordering::SeqCst)
            + self.idle_ticks.load(Ordering::SeqCst)
    }

    /// Split a tick count into (seconds, nanoseconds) of simulated wall
    /// time, at `frequency` MHz.
    pub fn ticks_to_time(ticks: u64, frequency: u32) -> (u32, u32) {
        let cycles_per_sec = frequency as u64 * 1_000_000;
        let seconds = ticks / cycles_per_sec;
        let nanos = (ticks % cycles_per_sec) * 1_000 / frequency as u64;
        (seconds as u32, nanos as u32)
    }

    pub fn report(&self) -> String {
        format!(
            "Ticks: total {} (system {}, user {}, idle {})\n\
             Disk I/O: reads {}, writes {}\n\
             Console I/O: reads {}, writes {}\n\
             Paging: faults {}\n",
            self.total_ticks(),
            self.system_ticks.load(Ordering::SeqCst),
            self.user_ticks.load(Ordering::SeqCst),
            self.idle_ticks.load(Ordering::SeqCst),
            self.num_disk_reads.load(Ordering::SeqCst),
            self.num_disk_writes.load(Ordering::SeqCst),
            self.num_console_chars_read.load(Ordering::SeqCst),
            self.num_console_chars_written.load(Ordering::SeqCst),
            self.page_faults(),
        )
    }
}
