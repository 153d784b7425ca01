//! The scheduler: ready queue and context switching.
//!
//! Strict FIFO, no priorities. A context switch saves the outgoing
//! thread's simulated-CPU registers into its control block, restores the
//! incoming thread's registers and translation table into the machine,
//! then swaps the host-side contexts by opening the incoming thread's gate
//! and parking on its own.
//!
//! When nothing is runnable, the scheduler lets the machine idle: simulated
//! time jumps to the next pending device interrupt, whose handler usually
//! readies a sleeping thread. A machine that idles indefinitely without
//! producing a runnable thread is deadlocked, which is fatal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rvos_machine::interrupt::{IntStatus, Interrupt};
use rvos_machine::Machine;

use super::{Thread, ThreadState};

/// Consecutive idle rounds tolerated before declaring deadlock. The timer
/// rearms itself forever, so an idle machine keeps firing interrupts; only
/// a bound on fruitless rounds distinguishes "waiting for the disk" from
/// "everyone is asleep".
const IDLE_ROUNDS_LIMIT: usize = 1_000_000;

pub struct Scheduler {
    machine: Arc<Machine>,
    ready: Mutex<VecDeque<Arc<Thread>>>,
    current: Mutex<Option<Arc<Thread>>>,
}

impl Scheduler {
    pub fn new(machine: Arc<Machine>) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            machine,
            ready: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
        })
    }

    /// Adopt the calling host thread as the initial kernel thread.
    pub fn attach_main(self: &Arc<Self>, name: &str) -> Arc<Thread> {
        let main = Thread::new(name, self);
        main.set_state(ThreadState::Running);
        *self.current.lock().unwrap() = Some(main.clone());
        main
    }

    pub fn interrupt(&self) -> &Arc<Interrupt> {
        &self.machine.interrupt
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Append `thread` to the ready queue.
    pub fn ready_to_run(&self, thread: Arc<Thread>) {
        thread.set_state(ThreadState::Ready);
        self.ready.lock().unwrap().push_back(thread);
    }

    /// Pop the first ready thread, if any.
    pub fn find_next_to_run(&self) -> Option<Arc<Thread>> {
        self.ready.lock().unwrap().pop_front()
    }

    /// The thread owning the simulated CPU.
    pub fn current_thread(&self) -> Arc<Thread> {
        self.current
            .lock()
            .unwrap()
            .clone()
            .expect("no current thread; kernel not bootstrapped")
    }

    /// Number of threads waiting for the CPU.
    pub fn ready_count(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    /// Put the caller at the back of the ready queue and run the next
    /// thread, if there is one.
    pub fn yield_current(&self) {
        let old = self.machine.interrupt.set_level(IntStatus::Off);
        if let Some(next) = self.find_next_to_run() {
            let current = self.current_thread();
            log::trace!(target: "thread", "\"{}\" yields to \"{}\"", current.name(), next.name());
            self.ready_to_run(current.clone());
            self.switch_from_to(current, next);
        }
        self.machine.interrupt.set_level(old);
    }

    /// Relinquish the CPU without requeueing. The caller must already sit
    /// on some wait queue and must have disabled interrupts; it resumes
    /// when that queue's owner makes it ready again.
    pub fn sleep_current(&self) {
        assert_eq!(
            self.machine.interrupt.level(),
            IntStatus::Off,
            "sleep with interrupts enabled"
        );
        let current = self.current_thread();
        current.set_state(ThreadState::Blocked);
        let next = self.next_or_idle();
        self.switch_from_to(current, next);
    }

    /// Terminate the calling thread: wake joiners, detach from its
    /// process, hand the CPU to a successor. Does not return control to
    /// the thread's previous activity; the caller is expected to unwind
    /// its host stack right after.
    pub fn finish_current(&self) {
        self.machine.interrupt.set_level(IntStatus::Off);
        let current = self.current_thread();
        log::debug!(target: "thread", "thread \"{}\" finishing", current.name());
        current.join_sem().v();
        current.invalidate();
        if let Some(process) = current.take_process() {
            process.decr_threads();
        }
        current.set_state(ThreadState::Finished);
        let next = self.next_or_idle();
        self.install(&next);
        *self.current.lock().unwrap() = Some(next.clone());
        next.set_state(ThreadState::Running);
        next.gate_open();
        // The dying thread keeps running on its own host stack just long
        // enough to unwind; it touches no kernel state past this point.
    }

    fn next_or_idle(&self) -> Arc<Thread> {
        let mut rounds = 0;
        loop {
            if let Some(next) = self.find_next_to_run() {
                return next;
            }
            if !self.machine.interrupt.idle() {
                panic!("no thread ready and no pending interrupt: machine deadlocked");
            }
            rounds += 1;
            assert!(
                rounds < IDLE_ROUNDS_LIMIT,
                "machine idled {rounds} rounds without a runnable thread: deadlock"
            );
        }
    }

    /// Install `thread`'s simulated-CPU state and address space.
    fn install(&self, thread: &Arc<Thread>) {
        self.machine.cpu.restore_context(&thread.context());
        self.machine.mmu.set_translation(thread.translation());
    }

    fn switch_from_to(&self, current: Arc<Thread>, next: Arc<Thread>) {
        if Arc::ptr_eq(&current, &next) {
            current.set_state(ThreadState::Running);
            return;
        }
        current.save_context(&self.machine.cpu);
        self.install(&next);
        *self.current.lock().unwrap() = Some(next.clone());
        next.set_state(ThreadState::Running);
        next.gate_open();
        current.gate_wait();
        // Back on the CPU; whoever switched to us restored our context.
    }
}
