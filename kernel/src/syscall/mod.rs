//! System-call dispatch and the user-mode run loop.
//!
//! Entry from a trap: the call number sits in register 17, arguments in
//! registers 10 through 13, and the result goes back into register 10.
//! Failures return −1 and park the error kind plus a context string in
//! the last-error slot for `PError`; success clears the slot. Object
//! identifiers are validated against the registry and pattern-matched to
//! the expected kind before use. File descriptors 0, 1 and 2 bypass the
//! file system and talk to the console driver.

pub mod uaccess;

use std::sync::Arc;

use rvos_machine::stats::Stats;
use rvos_machine::{
    ExceptionType, ExecutionEngine, MachineStatus, Step, ARG1_REG, ARG2_REG, ARG3_REG,
    SYSCALL_REG,
};

use crate::error::ErrorKind;
use crate::fs::open_file::OpenFile;
use crate::object::KernelObject;
use crate::process::Process;
use crate::sync::{Condition, Lock, Semaphore};
use crate::thread::Thread;
use crate::Kernel;

/// Recognized system-call numbers (register 17).
pub mod nr {
    pub const HALT: i64 = 0;
    pub const EXIT: i64 = 1;
    pub const EXEC: i64 = 2;
    pub const JOIN: i64 = 3;
    pub const CREATE: i64 = 4;
    pub const OPEN: i64 = 5;
    pub const READ: i64 = 6;
    pub const WRITE: i64 = 7;
    pub const SEEK: i64 = 8;
    pub const CLOSE: i64 = 9;
    pub const NEW_THREAD: i64 = 10;
    pub const YIELD: i64 = 11;
    pub const PERROR: i64 = 12;
    pub const P: i64 = 13;
    pub const V: i64 = 14;
    pub const SEM_CREATE: i64 = 15;
    pub const SEM_DESTROY: i64 = 16;
    pub const LOCK_CREATE: i64 = 17;
    pub const LOCK_DESTROY: i64 = 18;
    pub const LOCK_ACQUIRE: i64 = 19;
    pub const LOCK_RELEASE: i64 = 20;
    pub const COND_CREATE: i64 = 21;
    pub const COND_DESTROY: i64 = 22;
    pub const COND_WAIT: i64 = 23;
    pub const COND_SIGNAL: i64 = 24;
    pub const COND_BROADCAST: i64 = 25;
    pub const TTY_SEND: i64 = 26;
    pub const TTY_RECEIVE: i64 = 27;
    pub const MKDIR: i64 = 28;
    pub const RMDIR: i64 = 29;
    pub const REMOVE: i64 = 30;
    pub const FSLIST: i64 = 31;
    pub const SYS_TIME: i64 = 32;
    pub const MMAP: i64 = 33;
    pub const DEBUG: i64 = 34;
}

/// Console pseudo-descriptors.
const CONSOLE_INPUT: i64 = 0;
const CONSOLE_OUTPUT: i64 = 1;
const CONSOLE_ERROR: i64 = 2;

/// What the run loop does after an exception was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Resume (or re-execute) user code.
    Resume,
    /// The thread is gone; unwind its host stack.
    Exit,
}

/// Drive user execution through the instruction-set engine: advance
/// simulated time per instruction, honor timer-requested yields between
/// instructions, and route traps to the exception handler.
pub fn run_user(kernel: &Arc<Kernel>, mut engine: Box<dyn ExecutionEngine>) {
    let machine = &kernel.machine;
    machine.set_status(MachineStatus::User);
    loop {
        match engine.step(machine) {
            Step::Executed { cycles } => {
                machine.interrupt.one_tick(cycles);
                if machine.interrupt.take_yield_on_return() {
                    kernel.scheduler.yield_current();
                }
            }
            Step::Raise { exception, vaddr } => {
                machine.set_status(MachineStatus::System);
                match handle_exception(kernel, exception, vaddr) {
                    Flow::Resume => machine.set_status(MachineStatus::User),
                    Flow::Exit => return,
                }
            }
        }
    }
}

/// Entry point into the kernel for everything user code can raise.
pub fn handle_exception(kernel: &Arc<Kernel>, exception: ExceptionType, vaddr: u64) -> Flow {
    match exception {
        ExceptionType::NoException => {
            eprintln!("kernel internal error, a NoException exception was raised");
            kernel.machine.halt(0);
        }
        ExceptionType::Syscall => dispatch(kernel),
        ExceptionType::PageFault => {
            let vp = (vaddr / kernel.cfg.page_size as u64) as usize;
            match kernel.pagefault.page_fault(vp) {
                Ok(()) => Flow::Resume,
                Err(e) => {
                    eprintln!("*** page fault handling failed ({e}), exiting");
                    kernel.machine.halt(-1);
                }
            }
        }
        ExceptionType::ReadOnly => fatal_user_exception(kernel, "write on read-only page", vaddr),
        ExceptionType::BusError => fatal_user_exception(kernel, "bus error", vaddr),
        ExceptionType::AddressError => {
            fatal_user_exception(kernel, "access to invalid or unmapped address", vaddr)
        }
        ExceptionType::Overflow => fatal_user_exception(kernel, "arithmetic overflow", vaddr),
        ExceptionType::IllegalInstruction => {
            fatal_user_exception(kernel, "illegal instruction", vaddr)
        }
    }
}

fn fatal_user_exception(kernel: &Arc<Kernel>, what: &str, vaddr: u64) -> ! {
    eprintln!(
        "FATAL USER EXCEPTION (thread {}, PC={:#x}):\n\t*** {what} at virtual address {vaddr:#x} ***",
        kernel.scheduler.current_thread().name(),
        kernel.machine.cpu.pc(),
    );
    kernel.machine.halt(-1)
}

fn arg(kernel: &Arc<Kernel>, reg: usize) -> i64 {
    kernel.machine.cpu.read_int_register(reg)
}

/// Success: clear the error slot and write the result register.
fn ok(kernel: &Arc<Kernel>, value: i64) {
    kernel.last_error.clear();
    kernel.machine.cpu.write_int_register(ARG1_REG, value);
}

/// Failure: park the error and return −1 to the user.
fn fail(kernel: &Arc<Kernel>, kind: ErrorKind, about: &str) {
    log::debug!(target: "exc", "syscall failed: {kind} ({about})");
    kernel.last_error.set(kind, about);
    kernel.machine.cpu.write_int_register(ARG1_REG, -1);
}

/// Context string convention of the error slot: resource-exhaustion kinds
/// carry no context, everything else names the object.
fn fail_with_context(kernel: &Arc<Kernel>, kind: ErrorKind, name: &str) {
    match kind {
        ErrorKind::OutOfDisk | ErrorKind::OutOfMemory => fail(kernel, kind, ""),
        _ => fail(kernel, kind, name),
    }
}

fn file_object(kernel: &Arc<Kernel>, id: i64) -> Option<Arc<OpenFile>> {
    match kernel.objects.get(id as i32) {
        Some(KernelObject::File(file)) => Some(file),
        _ => None,
    }
}

fn semaphore_object(kernel: &Arc<Kernel>, id: i64) -> Option<Arc<Semaphore>> {
    match kernel.objects.get(id as i32) {
        Some(KernelObject::Semaphore(sem)) => Some(sem),
        _ => None,
    }
}

fn lock_object(kernel: &Arc<Kernel>, id: i64) -> Option<Arc<Lock>> {
    match kernel.objects.get(id as i32) {
        Some(KernelObject::Lock(lock)) => Some(lock),
        _ => None,
    }
}

fn condition_object(kernel: &Arc<Kernel>, id: i64) -> Option<Arc<Condition>> {
    match kernel.objects.get(id as i32) {
        Some(KernelObject::Condition(cond)) => Some(cond),
        _ => None,
    }
}

/// Decode and execute one system call.
pub fn dispatch(kernel: &Arc<Kernel>) -> Flow {
    let number = arg(kernel, SYSCALL_REG);
    match number {
        nr::HALT => {
            log::debug!(target: "exc", "shutdown, initiated by user program");
            kernel.machine.halt(0);
        }

        nr::SYS_TIME => {
            log::debug!(target: "exc", "SysTime call");
            let addr = arg(kernel, ARG1_REG) as u64;
            let ticks = kernel.machine.stats.total_ticks();
            let (seconds, nanos) = Stats::ticks_to_time(ticks, kernel.cfg.processor_frequency);
            uaccess::write_u32(kernel, addr, seconds);
            uaccess::write_u32(kernel, addr + 4, nanos);
            kernel.last_error.clear();
        }

        nr::EXIT => {
            let current = kernel.scheduler.current_thread();
            log::debug!(target: "exc", "thread \"{}\" exit call", current.name());
            kernel.scheduler.finish_current();
            return Flow::Exit;
        }

        nr::EXEC => {
            let name = uaccess::read_file_path(kernel, arg(kernel, ARG1_REG) as u64);
            log::debug!(target: "exc", "Exec(\"{name}\") call");
            match Process::new(kernel, &name) {
                Err(e) => fail_with_context(kernel, e, &name),
                Ok(process) => {
                    let thread =
                        Thread::new(&format!("master thread of process {name}"), &kernel.scheduler);
                    let entry = process.code_start_address() as i64;
                    match thread.start(kernel, process, entry, -1) {
                        Err(e) => fail_with_context(kernel, e, &name),
                        Ok(()) => {
                            let tid = kernel.objects.add(KernelObject::Thread(thread));
                            ok(kernel, tid as i64);
                        }
                    }
                }
            }
        }

        nr::NEW_THREAD => {
            let name = uaccess::read_cstring(kernel, arg(kernel, ARG1_REG) as u64);
            let func = arg(kernel, ARG2_REG);
            let arg_value = arg(kernel, ARG3_REG);
            log::debug!(target: "exc", "NewThread(\"{name}\") call");
            let process = kernel
                .scheduler
                .current_thread()
                .process()
                .expect("NewThread outside a process");
            let thread = Thread::new(&name, &kernel.scheduler);
            match thread.start(kernel, process, func, arg_value) {
                Err(e) => fail(kernel, e, ""),
                Ok(()) => {
                    let tid = kernel.objects.add(KernelObject::Thread(thread));
                    ok(kernel, tid as i64);
                }
            }
        }

        nr::JOIN => {
            let tid = arg(kernel, ARG1_REG);
            log::debug!(target: "exc", "Join({tid}) call");
            match kernel.objects.get(tid as i32) {
                Some(KernelObject::Thread(thread)) => {
                    if thread.is_valid() {
                        thread.join();
                    }
                    // A finished thread joins immediately, without error.
                    ok(kernel, 0);
                }
                _ => fail(kernel, ErrorKind::InvalidThreadId, &tid.to_string()),
            }
        }

        nr::YIELD => {
            log::debug!(target: "exc", "Yield call");
            kernel.scheduler.yield_current();
            ok(kernel, 0);
        }

        nr::PERROR => {
            log::debug!(target: "exc", "PError call");
            let msg = uaccess::read_cstring(kernel, arg(kernel, ARG1_REG) as u64);
            let report = kernel.last_error.format_last(&msg);
            kernel.console.put_string(report.as_bytes());
        }

        nr::CREATE => {
            let name = uaccess::read_file_path(kernel, arg(kernel, ARG1_REG) as u64);
            let size = arg(kernel, ARG2_REG).max(0) as usize;
            log::debug!(target: "exc", "Create(\"{name}\", {size}) call");
            match kernel.filesystem.create(&name, size) {
                Ok(()) => ok(kernel, 0),
                Err(e) => fail_with_context(kernel, e, &name),
            }
        }

        nr::OPEN => {
            let name = uaccess::read_file_path(kernel, arg(kernel, ARG1_REG) as u64);
            log::debug!(target: "exc", "Open(\"{name}\") call");
            match kernel.filesystem.open(&name) {
                Ok(file) => {
                    let id = kernel.objects.add(KernelObject::File(file));
                    ok(kernel, id as i64);
                }
                Err(e) => fail_with_context(kernel, e, &name),
            }
        }

        nr::READ => {
            let addr = arg(kernel, ARG1_REG) as u64;
            let size = arg(kernel, ARG2_REG).max(0) as usize;
            let from = arg(kernel, ARG3_REG);
            log::debug!(target: "exc", "Read({size} bytes, id {from}) call");
            if from == CONSOLE_INPUT {
                let data = kernel.console.get_string(size);
                uaccess::write_bytes(kernel, addr, &data);
                ok(kernel, data.len() as i64);
            } else {
                match file_object(kernel, from) {
                    Some(file) => {
                        let mut buffer = vec![0u8; size];
                        let n = file.read(&mut buffer);
                        uaccess::write_bytes(kernel, addr, &buffer[..n]);
                        ok(kernel, n as i64);
                    }
                    None => fail(kernel, ErrorKind::InvalidFileId, &from.to_string()),
                }
            }
        }

        nr::WRITE => {
            let addr = arg(kernel, ARG1_REG) as u64;
            let size = arg(kernel, ARG2_REG).max(0) as usize;
            let to = arg(kernel, ARG3_REG);
            log::debug!(target: "exc", "Write({size} bytes, id {to}) call");
            let data = uaccess::read_bytes(kernel, addr, size);
            if to == CONSOLE_OUTPUT || to == CONSOLE_ERROR {
                kernel.console.put_string(&data);
                ok(kernel, size as i64);
            } else {
                match file_object(kernel, to) {
                    Some(file) => {
                        let n = file.write(&data);
                        ok(kernel, n as i64);
                    }
                    None => fail(kernel, ErrorKind::InvalidFileId, &to.to_string()),
                }
            }
        }

        nr::SEEK => {
            let offset = arg(kernel, ARG1_REG).max(0) as u64;
            let id = arg(kernel, ARG2_REG);
            log::debug!(target: "exc", "Seek({offset}, id {id}) call");
            match file_object(kernel, id) {
                Some(file) => {
                    file.seek(offset);
                    ok(kernel, 0);
                }
                None => fail(kernel, ErrorKind::InvalidFileId, &id.to_string()),
            }
        }

        nr::CLOSE => {
            let id = arg(kernel, ARG1_REG);
            log::debug!(target: "exc", "Close(id {id}) call");
            match file_object(kernel, id) {
                Some(file) => {
                    kernel.filesystem.close(&file.name());
                    kernel.objects.remove(id as i32);
                    ok(kernel, 0);
                }
                None => fail(kernel, ErrorKind::InvalidFileId, &id.to_string()),
            }
        }

        nr::REMOVE => {
            let name = uaccess::read_file_path(kernel, arg(kernel, ARG1_REG) as u64);
            log::debug!(target: "exc", "Remove(\"{name}\") call");
            match kernel.filesystem.remove(&name) {
                Ok(()) => ok(kernel, 0),
                Err(e) => fail_with_context(kernel, e, &name),
            }
        }

        nr::MKDIR => {
            let name = uaccess::read_file_path(kernel, arg(kernel, ARG1_REG) as u64);
            log::debug!(target: "exc", "Mkdir(\"{name}\") call");
            match kernel.filesystem.mkdir(&name) {
                Ok(()) => ok(kernel, 0),
                Err(e) => fail_with_context(kernel, e, &name),
            }
        }

        nr::RMDIR => {
            let name = uaccess::read_file_path(kernel, arg(kernel, ARG1_REG) as u64);
            log::debug!(target: "exc", "Rmdir(\"{name}\") call");
            match kernel.filesystem.rmdir(&name) {
                Ok(()) => ok(kernel, 0),
                Err(e) => fail_with_context(kernel, e, &name),
            }
        }

        nr::FSLIST => {
            log::debug!(target: "exc", "FSList call");
            let listing = kernel.filesystem.list();
            kernel.console.put_string(listing.as_bytes());
            kernel.last_error.clear();
        }

        nr::TTY_SEND => {
            log::debug!(target: "exc", "TtySend call");
            match &kernel.acia {
                None => fail(kernel, ErrorKind::NoAcia, ""),
                Some(acia) => {
                    let message = uaccess::read_cstring(kernel, arg(kernel, ARG1_REG) as u64);
                    let sent = acia.tty_send(&message);
                    ok(kernel, sent);
                }
            }
        }

        nr::TTY_RECEIVE => {
            log::debug!(target: "exc", "TtyReceive call");
            match &kernel.acia {
                None => fail(kernel, ErrorKind::NoAcia, ""),
                Some(acia) => {
                    let addr = arg(kernel, ARG1_REG) as u64;
                    let length = arg(kernel, ARG2_REG).max(0) as usize;
                    let data = acia.tty_receive(length);
                    uaccess::write_bytes(kernel, addr, &data);
                    uaccess::write_bytes(kernel, addr + data.len() as u64, &[0]);
                    ok(kernel, data.len() as i64);
                }
            }
        }

        nr::MMAP => {
            let id = arg(kernel, ARG1_REG);
            let size = arg(kernel, ARG2_REG).max(0) as usize;
            log::debug!(target: "exc", "Mmap(id {id}, {size}) call");
            match file_object(kernel, id) {
                Some(file) => {
                    let space = kernel
                        .scheduler
                        .current_thread()
                        .process()
                        .expect("Mmap outside a process")
                        .addrspace
                        .clone();
                    match space.mmap(file, size) {
                        Ok(addr) => ok(kernel, addr as i64),
                        Err(e) => fail(kernel, e, ""),
                    }
                }
                None => fail(kernel, ErrorKind::InvalidFileId, &id.to_string()),
            }
        }

        nr::SEM_CREATE => {
            let name = uaccess::read_cstring(kernel, arg(kernel, ARG1_REG) as u64);
            let count = arg(kernel, ARG2_REG);
            log::debug!(target: "exc", "SemCreate(\"{name}\", {count}) call");
            if count < 0 {
                fail(kernel, ErrorKind::InvalidCounter, &name);
            } else {
                let sem = Arc::new(Semaphore::new(&name, count, kernel.scheduler.clone()));
                let id = kernel.objects.add(KernelObject::Semaphore(sem));
                ok(kernel, id as i64);
            }
        }

        nr::SEM_DESTROY => {
            let id = arg(kernel, ARG1_REG);
            match semaphore_object(kernel, id) {
                Some(_) => {
                    kernel.objects.remove(id as i32);
                    ok(kernel, 0);
                }
                None => fail(kernel, ErrorKind::InvalidSemaphoreId, &id.to_string()),
            }
        }

        nr::P => match semaphore_object(kernel, arg(kernel, ARG1_REG)) {
            Some(sem) => {
                sem.p();
                ok(kernel, 0);
            }
            None => fail(
                kernel,
                ErrorKind::InvalidSemaphoreId,
                &arg(kernel, ARG1_REG).to_string(),
            ),
        },

        nr::V => match semaphore_object(kernel, arg(kernel, ARG1_REG)) {
            Some(sem) => {
                sem.v();
                ok(kernel, 0);
            }
            None => fail(
                kernel,
                ErrorKind::InvalidSemaphoreId,
                &arg(kernel, ARG1_REG).to_string(),
            ),
        },

        nr::LOCK_CREATE => {
            let name = uaccess::read_cstring(kernel, arg(kernel, ARG1_REG) as u64);
            let lock = Arc::new(Lock::new(&name, kernel.scheduler.clone()));
            let id = kernel.objects.add(KernelObject::Lock(lock));
            ok(kernel, id as i64);
        }

        nr::LOCK_DESTROY => {
            let id = arg(kernel, ARG1_REG);
            match lock_object(kernel, id) {
                Some(_) => {
                    kernel.objects.remove(id as i32);
                    ok(kernel, 0);
                }
                None => fail(kernel, ErrorKind::InvalidLockId, &id.to_string()),
            }
        }

        nr::LOCK_ACQUIRE => match lock_object(kernel, arg(kernel, ARG1_REG)) {
            Some(lock) => {
                lock.acquire();
                ok(kernel, 0);
            }
            None => fail(
                kernel,
                ErrorKind::InvalidLockId,
                &arg(kernel, ARG1_REG).to_string(),
            ),
        },

        nr::LOCK_RELEASE => match lock_object(kernel, arg(kernel, ARG1_REG)) {
            Some(lock) => {
                lock.release();
                ok(kernel, 0);
            }
            None => fail(
                kernel,
                ErrorKind::InvalidLockId,
                &arg(kernel, ARG1_REG).to_string(),
            ),
        },

        nr::COND_CREATE => {
            let name = uaccess::read_cstring(kernel, arg(kernel, ARG1_REG) as u64);
            let cond = Arc::new(Condition::new(&name, kernel.scheduler.clone()));
            let id = kernel.objects.add(KernelObject::Condition(cond));
            ok(kernel, id as i64);
        }

        nr::COND_DESTROY => {
            let id = arg(kernel, ARG1_REG);
            match condition_object(kernel, id) {
                Some(_) => {
                    kernel.objects.remove(id as i32);
                    ok(kernel, 0);
                }
                None => fail(kernel, ErrorKind::InvalidConditionId, &id.to_string()),
            }
        }

        nr::COND_WAIT => match condition_object(kernel, arg(kernel, ARG1_REG)) {
            Some(cond) => {
                cond.wait();
                ok(kernel, 0);
            }
            None => fail(
                kernel,
                ErrorKind::InvalidConditionId,
                &arg(kernel, ARG1_REG).to_string(),
            ),
        },

        nr::COND_SIGNAL => match condition_object(kernel, arg(kernel, ARG1_REG)) {
            Some(cond) => {
                cond.signal();
                ok(kernel, 0);
            }
            None => fail(
                kernel,
                ErrorKind::InvalidConditionId,
                &arg(kernel, ARG1_REG).to_string(),
            ),
        },

        nr::COND_BROADCAST => match condition_object(kernel, arg(kernel, ARG1_REG)) {
            Some(cond) => {
                cond.broadcast();
                ok(kernel, 0);
            }
            None => fail(
                kernel,
                ErrorKind::InvalidConditionId,
                &arg(kernel, ARG1_REG).to_string(),
            ),
        },

        nr::DEBUG => {
            println!(
                "Debug system call: parameter {:#x}",
                arg(kernel, ARG1_REG)
            );
            kernel.last_error.clear();
        }

        unknown => {
            eprintln!("Invalid system call number: {unknown}");
            kernel.machine.halt(-1);
        }
    }
    Flow::Resume
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::vm::addrspace::AddrSpace;
    use rvos_machine::{ScriptOp, ScriptedEngine};

    /// Give the bare test kernel a user address space so the dispatcher
    /// has memory to copy strings and buffers through.
    fn install_user_space(kernel: &Arc<Kernel>) -> Arc<AddrSpace> {
        let space = AddrSpace::new(
            kernel.cfg.clone(),
            kernel.machine.mmu.clone(),
            kernel.physmem.clone(),
            kernel.swap.clone(),
            &kernel.scheduler,
            None,
        )
        .unwrap();
        let base = space.alloc(4).unwrap();
        assert_eq!(base, 0);
        for vp in 0..4 {
            space.translation.update(vp, |e| {
                e.read_allowed = true;
                e.write_allowed = true;
            });
        }
        kernel
            .machine
            .mmu
            .set_translation(Some(space.translation.clone()));
        space
    }

    fn poke_bytes(kernel: &Arc<Kernel>, space: &Arc<AddrSpace>, addr: u64, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            loop {
                match kernel.machine.mmu.write_mem(addr + i as u64, 1, byte as u64) {
                    Ok(()) => break,
                    Err(fault) => {
                        assert_eq!(fault.exception, ExceptionType::PageFault);
                        let vp = (fault.vaddr / kernel.cfg.page_size as u64) as usize;
                        kernel.pagefault.resolve(space, vp).unwrap();
                    }
                }
            }
        }
    }

    fn peek_bytes(kernel: &Arc<Kernel>, space: &Arc<AddrSpace>, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| loop {
                match kernel.machine.mmu.read_mem(addr + i, 1) {
                    Ok(value) => break value as u8,
                    Err(fault) => {
                        assert_eq!(fault.exception, ExceptionType::PageFault);
                        let vp = (fault.vaddr / kernel.cfg.page_size as u64) as usize;
                        kernel.pagefault.resolve(space, vp).unwrap();
                    }
                }
            })
            .collect()
    }

    fn syscall(kernel: &Arc<Kernel>, number: i64, args: &[i64]) -> i64 {
        kernel.machine.cpu.write_int_register(SYSCALL_REG, number);
        for (i, &value) in args.iter().enumerate() {
            kernel.machine.cpu.write_int_register(ARG1_REG + i, value);
        }
        assert_eq!(dispatch(kernel), Flow::Resume);
        kernel.machine.cpu.read_int_register(ARG1_REG)
    }

    #[test]
    fn file_calls_cover_the_whole_session() {
        let kernel = testing::boot("sys-file");
        let space = install_user_space(&kernel);
        poke_bytes(&kernel, &space, 0, b"/f\0");

        assert_eq!(syscall(&kernel, nr::CREATE, &[0, 64]), 0);
        let fid = syscall(&kernel, nr::OPEN, &[0]);
        assert!(fid >= 3);

        poke_bytes(&kernel, &space, 16, b"hello");
        assert_eq!(syscall(&kernel, nr::WRITE, &[16, 5, fid]), 5);
        assert_eq!(syscall(&kernel, nr::SEEK, &[0, fid]), 0);
        assert_eq!(syscall(&kernel, nr::READ, &[32, 5, fid]), 5);
        assert_eq!(peek_bytes(&kernel, &space, 32, 5), b"hello");

        assert_eq!(syscall(&kernel, nr::CLOSE, &[fid]), 0);
        assert_eq!(kernel.filesystem.oft.refcount("/f"), None);
        kernel.machine.mmu.set_translation(None);
    }

    #[test]
    fn bad_identifiers_return_minus_one_with_the_right_kind() {
        let kernel = testing::boot("sys-badid");
        let space = install_user_space(&kernel);
        poke_bytes(&kernel, &space, 0, b"/nope\0");

        assert_eq!(syscall(&kernel, nr::OPEN, &[0]), -1);
        assert_eq!(
            kernel.last_error.last().map(|(k, _)| k),
            Some(ErrorKind::InexistFileError)
        );

        assert_eq!(syscall(&kernel, nr::READ, &[64, 4, 99]), -1);
        assert_eq!(
            kernel.last_error.last().map(|(k, _)| k),
            Some(ErrorKind::InvalidFileId)
        );

        // A success clears the slot.
        poke_bytes(&kernel, &space, 8, b"/ok\0");
        assert_eq!(syscall(&kernel, nr::CREATE, &[8, 0]), 0);
        assert!(kernel.last_error.last().is_none());
        kernel.machine.mmu.set_translation(None);
    }

    #[test]
    fn perror_reports_the_last_failure_on_the_console() {
        let kernel = testing::boot("sys-perror");
        let space = install_user_space(&kernel);
        poke_bytes(&kernel, &space, 0, b"/absent\0");
        assert_eq!(syscall(&kernel, nr::OPEN, &[0]), -1);

        poke_bytes(&kernel, &space, 32, b"myprog\0");
        syscall(&kernel, nr::PERROR, &[32]);
        let output = String::from_utf8(kernel.machine.console.take_output()).unwrap();
        assert_eq!(output, "myprog: file does not exist (/absent)\n");
        kernel.machine.mmu.set_translation(None);
    }

    #[test]
    fn console_descriptors_bypass_the_file_system() {
        let kernel = testing::boot("sys-console");
        let space = install_user_space(&kernel);

        poke_bytes(&kernel, &space, 0, b"to the console\n");
        assert_eq!(syscall(&kernel, nr::WRITE, &[0, 15, 1]), 15);
        assert_eq!(
            kernel.machine.console.take_output(),
            b"to the console\n".to_vec()
        );

        kernel.machine.console.push_input(b"typed\n");
        let n = syscall(&kernel, nr::READ, &[64, 32, 0]);
        assert_eq!(n, 6);
        assert_eq!(peek_bytes(&kernel, &space, 64, 6), b"typed\n");
        kernel.machine.mmu.set_translation(None);
    }

    #[test]
    fn semaphore_calls_validate_their_identifiers() {
        let kernel = testing::boot("sys-sem");
        let space = install_user_space(&kernel);
        poke_bytes(&kernel, &space, 0, b"user sem\0");

        let sid = syscall(&kernel, nr::SEM_CREATE, &[0, 2]);
        assert!(sid >= 3);
        assert_eq!(syscall(&kernel, nr::P, &[sid]), 0);
        assert_eq!(syscall(&kernel, nr::P, &[sid]), 0);
        assert_eq!(syscall(&kernel, nr::V, &[sid]), 0);
        assert_eq!(syscall(&kernel, nr::SEM_DESTROY, &[sid]), 0);
        assert_eq!(syscall(&kernel, nr::P, &[sid]), -1);
        assert_eq!(
            kernel.last_error.last().map(|(k, _)| k),
            Some(ErrorKind::InvalidSemaphoreId)
        );
        // A lock identifier is not a semaphore identifier.
        let lid = syscall(&kernel, nr::LOCK_CREATE, &[0]);
        assert_eq!(syscall(&kernel, nr::P, &[lid]), -1);
        assert_eq!(syscall(&kernel, nr::SEM_CREATE, &[0, -1]), -1);
        assert_eq!(
            kernel.last_error.last().map(|(k, _)| k),
            Some(ErrorKind::InvalidCounter)
        );
        kernel.machine.mmu.set_translation(None);
    }

    #[test]
    fn fslist_prints_the_hierarchy() {
        let kernel = testing::boot("sys-fslist");
        let space = install_user_space(&kernel);
        kernel.filesystem.create("/a", 0).unwrap();
        syscall(&kernel, nr::FSLIST, &[]);
        assert_eq!(kernel.machine.console.take_output(), b"a\n".to_vec());
        drop(space);
        kernel.machine.mmu.set_translation(None);
    }

    #[test]
    fn scripted_user_thread_runs_stores_and_exits() {
        let kernel = testing::boot("sys-user-thread");
        let page_size = kernel.cfg.page_size;
        let stack_pages = kernel.cfg.user_stack_size.div_ceil(page_size);
        let sp = ((4 + stack_pages) * page_size - 16) as u64;

        kernel.set_engine_factory(move || {
            Box::new(ScriptedEngine::new([
                ScriptOp::Store(sp - 8, 1, 0x5a),
                ScriptOp::LoadTo(sp - 8, 28),
                ScriptOp::SetReg(SYSCALL_REG, nr::YIELD),
                ScriptOp::Syscall,
                ScriptOp::SetReg(SYSCALL_REG, nr::EXIT),
                ScriptOp::Syscall,
            ]))
        });
        let process = crate::process::Process::new_empty(&kernel, "scripted").unwrap();
        let thread = Thread::new("scripted user", &kernel.scheduler);
        thread.start(&kernel, process.clone(), 0, -1).unwrap();

        let tid = kernel.objects.add(KernelObject::Thread(thread.clone()));
        assert_eq!(syscall(&kernel, nr::JOIN, &[tid as i64]), 0);
        assert!(!thread.is_valid());
        assert_eq!(process.num_threads(), 0);
        kernel.physmem.audit();
    }

    #[test]
    fn join_rejects_non_thread_identifiers() {
        let kernel = testing::boot("sys-join-bad");
        let space = install_user_space(&kernel);
        poke_bytes(&kernel, &space, 0, b"s\0");
        let sid = syscall(&kernel, nr::SEM_CREATE, &[0, 0]);
        assert_eq!(syscall(&kernel, nr::JOIN, &[sid]), -1);
        assert_eq!(
            kernel.last_error.last().map(|(k, _)| k),
            Some(ErrorKind::InvalidThreadId)
        );
        kernel.machine.mmu.set_translation(None);
    }
}
