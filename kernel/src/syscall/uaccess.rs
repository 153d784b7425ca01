//! Safe movement of data between user memory and the kernel.
//!
//! User pointers are never dereferenced: every byte crosses through the
//! MMU, one access at a time. A page fault along the way is resolved and
//! the access retried; any other fault means the user program handed the
//! kernel a rotten pointer, which is fatal for the machine, exactly as if
//! the program had touched the address itself.

use std::sync::Arc;

use rvos_machine::mmu::MmuFault;
use rvos_machine::ExceptionType;

use crate::Kernel;

/// Longest string a system call will copy in, terminator included.
pub const MAX_STRING_LENGTH: usize = 256;

fn resolve_fault(kernel: &Arc<Kernel>, fault: MmuFault) {
    match fault.exception {
        ExceptionType::PageFault => {
            let vp = (fault.vaddr / kernel.cfg.page_size as u64) as usize;
            if let Err(e) = kernel.pagefault.page_fault(vp) {
                eprintln!("*** page fault handling failed during system call: {e}");
                kernel.machine.halt(-1);
            }
        }
        other => {
            eprintln!(
                "FATAL USER EXCEPTION (thread {}, syscall argument at {:#x}): {other:?}",
                kernel.scheduler.current_thread().name(),
                fault.vaddr
            );
            kernel.machine.halt(-1);
        }
    }
}

/// Read one byte of user memory, faulting pages in as needed.
fn read_byte(kernel: &Arc<Kernel>, addr: u64) -> u8 {
    loop {
        match kernel.machine.mmu.read_mem(addr, 1) {
            Ok(value) => return value as u8,
            Err(fault) => resolve_fault(kernel, fault),
        }
    }
}

fn write_byte(kernel: &Arc<Kernel>, addr: u64, value: u8) {
    loop {
        match kernel.machine.mmu.write_mem(addr, 1, value as u64) {
            Ok(()) => return,
            Err(fault) => resolve_fault(kernel, fault),
        }
    }
}

/// Copy a NUL-terminated string out of user memory, bounded by
/// [`MAX_STRING_LENGTH`] and forcibly terminated.
pub fn read_cstring(kernel: &Arc<Kernel>, addr: u64) -> String {
    read_bounded(kernel, addr, MAX_STRING_LENGTH)
}

/// Copy a NUL-terminated file path, bounded by the configured
/// `MaxFileNameSize`.
pub fn read_file_path(kernel: &Arc<Kernel>, addr: u64) -> String {
    read_bounded(kernel, addr, kernel.cfg.max_file_name_size)
}

fn read_bounded(kernel: &Arc<Kernel>, addr: u64, max_len: usize) -> String {
    let mut bytes = Vec::new();
    for i in 0..max_len as u64 {
        let byte = read_byte(kernel, addr + i);
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Copy `len` bytes out of user memory.
pub fn read_bytes(kernel: &Arc<Kernel>, addr: u64, len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| read_byte(kernel, addr + i)).collect()
}

/// Copy a buffer into user memory.
pub fn write_bytes(kernel: &Arc<Kernel>, addr: u64, bytes: &[u8]) {
    for (i, &byte) in bytes.iter().enumerate() {
        write_byte(kernel, addr + i as u64, byte);
    }
}

/// Store a little-endian u32 into user memory.
pub fn write_u32(kernel: &Arc<Kernel>, addr: u64, value: u32) {
    write_bytes(kernel, addr, &value.to_le_bytes());
}
