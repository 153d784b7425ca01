//! Synchronous disk access.
//!
//! The raw device accepts one request at a time and signals completion
//! with an interrupt. The driver serializes requesters with a lock and
//! parks the requesting thread on a semaphore that the completion
//! interrupt V's.

use std::sync::Arc;

use rvos_machine::disk::Disk;

use crate::sync::{Lock, Semaphore};
use crate::thread::scheduler::Scheduler;

pub struct DriverDisk {
    device: Arc<Disk>,
    lock: Lock,
    semaphore: Arc<Semaphore>,
}

impl DriverDisk {
    pub fn new(
        sem_name: &str,
        lock_name: &str,
        device: Arc<Disk>,
        sched: &Arc<Scheduler>,
    ) -> Arc<DriverDisk> {
        let semaphore = Arc::new(Semaphore::new(sem_name, 0, sched.clone()));
        let request_done = semaphore.clone();
        device.set_request_done(Arc::new(move || request_done.v()));
        Arc::new(DriverDisk {
            device,
            lock: Lock::new(lock_name, sched.clone()),
            semaphore,
        })
    }

    /// Read the sector into `data`, waiting for the I/O to complete.
    pub fn read_sector(&self, sector: u32, data: &mut [u8]) {
        self.lock.acquire();
        self.device.read_request(sector as usize, data);
        self.semaphore.p();
        self.lock.release();
    }

    /// Write the sector from `data`, waiting for the I/O to complete.
    pub fn write_sector(&self, sector: u32, data: &[u8]) {
        self.lock.acquire();
        self.device.write_request(sector as usize, data);
        self.semaphore.p();
        self.lock.release();
    }
}
