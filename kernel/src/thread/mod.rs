//! Kernel threads.
//!
//! A thread carries two execution contexts: the simulated-CPU context
//! (program counter plus the integer and floating-point register files)
//! and a host-side context, which here is a real host thread parked behind
//! a per-thread *gate*. Exactly one gate is open at any instant, so the
//! kernel multiplexes a single simulated CPU no matter how many host
//! threads back it.
//!
//! Lifecycle: created, then made ready by `start` (user thread) or
//! `Kernel::spawn` (kernel thread), then running/blocked until `Finish`.
//! A finished thread is marked invalid so a stale identifier can never
//! reach it again, hands the CPU to its successor, and unwinds its own
//! host stack; the `Arc` releases the control block once the last
//! reference drops.

pub mod scheduler;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use rvos_machine::interrupt::IntStatus;
use rvos_machine::{Cpu, CpuContext, ARG1_REG, STACK_REG};

use crate::error::ErrorKind;
use crate::process::Process;
use crate::sync::Semaphore;
use crate::Kernel;
use scheduler::Scheduler;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Ready,
    Running,
    Blocked,
    Finished,
}

/// The gate a host thread parks on while its kernel thread does not own
/// the simulated CPU.
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
        *open = false;
    }
}

pub struct Thread {
    name: String,
    id: u64,
    state: Mutex<ThreadState>,
    /// Cleared at `Finish`; a thread identifier found in the object
    /// registry is only dereferenced while this holds.
    valid: AtomicBool,
    context: Mutex<CpuContext>,
    process: Mutex<Option<Arc<Process>>>,
    gate: Gate,
    join_sem: Semaphore,
}

impl Thread {
    /// Build an empty thread. It runs nothing until started or spawned.
    pub fn new(name: &str, sched: &Arc<Scheduler>) -> Arc<Thread> {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst);
        Arc::new(Thread {
            name: name.to_string(),
            id,
            state: Mutex::new(ThreadState::Created),
            valid: AtomicBool::new(true),
            context: Mutex::new(CpuContext::default()),
            process: Mutex::new(None),
            gate: Gate::new(),
            join_sem: Semaphore::new(&format!("join {name}"), 0, sched.clone()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        *self.state.lock().unwrap() = state;
    }

    /// False once the thread has finished.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.lock().unwrap().clone()
    }

    pub(crate) fn take_process(&self) -> Option<Arc<Process>> {
        self.process.lock().unwrap().take()
    }

    /// Translation table the MMU must use while this thread runs; `None`
    /// for pure-kernel threads.
    pub fn translation(&self) -> Option<Arc<rvos_machine::translation::TranslationTable>> {
        self.process
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.addrspace.translation.clone())
    }

    pub(crate) fn save_context(&self, cpu: &Cpu) {
        *self.context.lock().unwrap() = cpu.save_context();
    }

    pub(crate) fn context(&self) -> CpuContext {
        self.context.lock().unwrap().clone()
    }

    pub(crate) fn gate_open(&self) {
        self.gate.open();
    }

    pub(crate) fn gate_wait(&self) {
        self.gate.wait();
    }

    pub(crate) fn join_sem(&self) -> &Semaphore {
        &self.join_sem
    }

    /// Wait until this thread finishes. `Finish` performs one `V`; every
    /// joiner passes the baton back so any number of threads may join.
    pub fn join(&self) {
        self.join_sem.p();
        self.join_sem.v();
    }

    /// Attach the thread to `process` and start executing user code at
    /// `pc` with `arg` in the first argument register. A user stack is
    /// carved out of the process address space.
    pub fn start(
        self: &Arc<Self>,
        kernel: &Arc<Kernel>,
        process: Arc<Process>,
        pc: i64,
        arg: i64,
    ) -> Result<(), ErrorKind> {
        let stack_ptr = process
            .addrspace
            .stack_allocate()
            .ok_or(ErrorKind::OutOfMemory)?;
        {
            let mut context = self.context.lock().unwrap();
            context.pc = pc;
            context.int_registers[STACK_REG] = stack_ptr as i64;
            context.int_registers[ARG1_REG] = arg;
        }
        process.incr_threads();
        *self.process.lock().unwrap() = Some(process);

        let engine = kernel.make_engine();
        let spawned_kernel = kernel.clone();
        let thread = self.clone();
        let host = std::thread::Builder::new().name(self.name.clone());
        host.spawn(move || {
            thread.gate_wait();
            spawned_kernel.scheduler.interrupt().set_level(IntStatus::On);
            crate::syscall::run_user(&spawned_kernel, engine);
            // `Finish` already handed the CPU away; just unwind.
        })
        .expect("host thread spawn failed");
        kernel.scheduler.ready_to_run(self.clone());
        log::debug!(target: "thread", "started thread \"{}\" (pc {pc:#x})", self.name);
        Ok(())
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
