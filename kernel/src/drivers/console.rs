//! Synchronous console access.
//!
//! One lock per direction keeps whole strings contiguous; within a string,
//! each character waits for the device's completion interrupt through a
//! semaphore.

use std::sync::Arc;

use rvos_machine::console::Console;

use crate::sync::{Lock, Semaphore};
use crate::thread::scheduler::Scheduler;

pub struct DriverConsole {
    device: Arc<Console>,
    put_lock: Lock,
    get_lock: Lock,
    put_sem: Arc<Semaphore>,
    get_sem: Arc<Semaphore>,
}

impl DriverConsole {
    pub fn new(device: Arc<Console>, sched: &Arc<Scheduler>) -> Arc<DriverConsole> {
        let put_sem = Arc::new(Semaphore::new("console put", 0, sched.clone()));
        let get_sem = Arc::new(Semaphore::new("console get", 0, sched.clone()));
        let put_done = put_sem.clone();
        device.set_put_done(Arc::new(move || put_done.v()));
        let get_done = get_sem.clone();
        device.set_get_done(Arc::new(move || get_done.v()));
        Arc::new(DriverConsole {
            device,
            put_lock: Lock::new("console put lock", sched.clone()),
            get_lock: Lock::new("console get lock", sched.clone()),
            put_sem,
            get_sem,
        })
    }

    /// Write `buffer` to the console, one character per device request.
    pub fn put_string(&self, buffer: &[u8]) {
        self.put_lock.acquire();
        for &ch in buffer {
            self.device.put_char(ch);
            self.put_sem.p();
        }
        self.put_lock.release();
    }

    /// Read up to `max` characters. Stops at end of input (device delivers
    /// NUL) or after a newline, whichever comes first.
    pub fn get_string(&self, max: usize) -> Vec<u8> {
        self.get_lock.acquire();
        let mut buffer = Vec::with_capacity(max);
        while buffer.len() < max {
            self.device.request_char();
            self.get_sem.p();
            let ch = self.device.get_char();
            if ch == 0 {
                break;
            }
            buffer.push(ch);
            if ch == b'\n' {
                break;
            }
        }
        self.get_lock.release();
        buffer
    }
}

#[cfg(test)]
mod tests {
    use crate::testing;

    #[test]
    fn put_string_reaches_the_device_in_order() {
        let kernel = testing::boot("console-put");
        kernel.console.put_string(b"abc");
        kernel.console.put_string(b"def");
        assert_eq!(kernel.machine.console.take_output(), b"abcdef".to_vec());
    }

    #[test]
    fn get_string_stops_at_newline_and_at_end_of_input() {
        let kernel = testing::boot("console-get");
        kernel.machine.console.push_input(b"line one\nrest");
        assert_eq!(kernel.console.get_string(64), b"line one\n".to_vec());
        assert_eq!(kernel.console.get_string(64), b"rest".to_vec());
        assert_eq!(kernel.console.get_string(64), Vec::<u8>::new());
    }

    #[test]
    fn whole_strings_stay_contiguous_across_writers() {
        let kernel = testing::boot("console-race");
        let mut writers = Vec::new();
        for message in ["<first message>", "[second message]"] {
            writers.push(kernel.spawn(message, move |k| {
                k.console.put_string(message.as_bytes());
            }));
        }
        for writer in writers {
            writer.join();
        }
        let output = String::from_utf8(kernel.machine.console.take_output()).unwrap();
        // The put lock keeps each message in one piece.
        assert!(output.contains("<first message>"));
        assert!(output.contains("[second message]"));
    }
}
