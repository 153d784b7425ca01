//! Processes.
//!
//! A process groups an address space, the executable it was loaded from
//! and the count of threads running in it. The last thread to finish
//! drops the process, which tears the address space down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::ErrorKind;
use crate::vm::addrspace::AddrSpace;
use crate::Kernel;

/// Per-process event counters.
#[derive(Default)]
pub struct ProcessStat {
    memory_accesses: AtomicU64,
}

impl ProcessStat {
    pub fn incr_memory_access(&self) {
        self.memory_accesses.fetch_add(1, Ordering::SeqCst);
    }

    pub fn memory_accesses(&self) -> u64 {
        self.memory_accesses.load(Ordering::SeqCst)
    }
}

pub struct Process {
    name: String,
    pub addrspace: Arc<AddrSpace>,
    num_threads: Mutex<i32>,
    pub stat: ProcessStat,
}

impl Process {
    /// Load the executable at `path` into a fresh address space.
    pub fn new(kernel: &Arc<Kernel>, path: &str) -> Result<Arc<Process>, ErrorKind> {
        let exec_file = kernel.filesystem.open(path)?;
        log::info!(target: "vm", "loading executable {path}");
        let addrspace = AddrSpace::new(
            kernel.cfg.clone(),
            kernel.machine.mmu.clone(),
            kernel.physmem.clone(),
            kernel.swap.clone(),
            &kernel.scheduler,
            Some(exec_file),
        )
        .inspect_err(|_| kernel.filesystem.close(path))?;
        Ok(Arc::new(Process {
            name: path.to_string(),
            addrspace,
            num_threads: Mutex::new(0),
            stat: ProcessStat::default(),
        }))
    }

    /// A process with an empty address space and no executable; threads
    /// started in it run purely kernel-provided code.
    pub fn new_empty(kernel: &Arc<Kernel>, name: &str) -> Result<Arc<Process>, ErrorKind> {
        let addrspace = AddrSpace::new(
            kernel.cfg.clone(),
            kernel.machine.mmu.clone(),
            kernel.physmem.clone(),
            kernel.swap.clone(),
            &kernel.scheduler,
            None,
        )?;
        Ok(Arc::new(Process {
            name: name.to_string(),
            addrspace,
            num_threads: Mutex::new(0),
            stat: ProcessStat::default(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry point recorded by the loader.
    pub fn code_start_address(&self) -> u64 {
        self.addrspace.code_start_address()
    }

    pub fn incr_threads(&self) {
        *self.num_threads.lock().unwrap() += 1;
    }

    pub fn decr_threads(&self) {
        *self.num_threads.lock().unwrap() -= 1;
    }

    pub fn num_threads(&self) -> i32 {
        *self.num_threads.lock().unwrap()
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("num_threads", &self.num_threads())
            .finish()
    }
}
