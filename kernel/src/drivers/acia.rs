//! Serial-line (ACIA) driver.
//!
//! Two working modes, selected by configuration:
//!
//! - **Busy waiting**: the driver polls the device state registers,
//!   nudging simulated time forward between polls so the pending transfer
//!   interrupts can land.
//! - **Interrupt**: emission and reception run from the device interrupt
//!   handlers; the requesting thread sleeps on a semaphore until the whole
//!   NUL-terminated message has crossed the line.

use std::sync::{Arc, Mutex};

use rvos_machine::acia::{Acia, AciaIrq, OutputState};
use rvos_machine::config::AciaMode;

use crate::sync::Semaphore;
use crate::thread::scheduler::Scheduler;

struct AciaBuffers {
    send_buffer: Vec<u8>,
    ind_send: usize,
    receive_buffer: Vec<u8>,
}

pub struct DriverAcia {
    device: Arc<Acia>,
    mode: AciaMode,
    sched: Arc<Scheduler>,
    send_sema: Arc<Semaphore>,
    receive_sema: Arc<Semaphore>,
    buffers: Arc<Mutex<AciaBuffers>>,
}

impl DriverAcia {
    pub fn new(device: Arc<Acia>, mode: AciaMode, sched: &Arc<Scheduler>) -> Arc<DriverAcia> {
        assert!(mode != AciaMode::None);
        let send_sema = Arc::new(Semaphore::new("ACIA send", 0, sched.clone()));
        let receive_sema = Arc::new(Semaphore::new("ACIA receive", 0, sched.clone()));
        let buffers = Arc::new(Mutex::new(AciaBuffers {
            send_buffer: Vec::new(),
            ind_send: 0,
            receive_buffer: Vec::new(),
        }));
        if mode == AciaMode::Interrupt {
            // Emission handler: push the next character, or wake the
            // sender when the terminating NUL has left the register.
            let dev = device.clone();
            let bufs = buffers.clone();
            let sema = send_sema.clone();
            device.set_send_handler(Arc::new(move || {
                let next = {
                    let mut b = bufs.lock().unwrap();
                    if b.ind_send < b.send_buffer.len() {
                        let ch = b.send_buffer[b.ind_send];
                        b.ind_send += 1;
                        Some(ch)
                    } else {
                        None
                    }
                };
                match next {
                    Some(ch) => dev.put_output_char(ch),
                    None => sema.v(),
                }
            }));
            // Reception handler: accumulate until the NUL terminator,
            // then wake the receiver.
            let dev = device.clone();
            let bufs = buffers.clone();
            let sema = receive_sema.clone();
            device.set_receive_handler(Arc::new(move || {
                while let Some(ch) = dev.get_input_char() {
                    let mut b = bufs.lock().unwrap();
                    b.receive_buffer.push(ch);
                    if ch == 0 {
                        drop(b);
                        sema.v();
                    }
                }
            }));
            device.set_working_mode(AciaIrq::RECEIVE);
        }
        Arc::new(DriverAcia {
            device,
            mode,
            sched: sched.clone(),
            send_sema,
            receive_sema,
            buffers,
        })
    }

    /// Send a NUL-terminated message over the line. Returns the number of
    /// payload bytes sent.
    pub fn tty_send(&self, message: &str) -> i64 {
        log::debug!(target: "drv", "ACIA send {:?}", message);
        match self.mode {
            AciaMode::None => unreachable!(),
            AciaMode::BusyWaiting => {
                for &ch in message.as_bytes().iter().chain(std::iter::once(&0)) {
                    while self.device.output_state() == OutputState::Busy {
                        if !self.sched.interrupt().idle() {
                            break;
                        }
                    }
                    self.device.put_output_char(ch);
                }
                message.len() as i64
            }
            AciaMode::Interrupt => {
                {
                    let mut b = self.buffers.lock().unwrap();
                    b.send_buffer = message.as_bytes().to_vec();
                    b.send_buffer.push(0);
                    b.ind_send = 1;
                }
                self.device.set_working_mode(AciaIrq::SEND | AciaIrq::RECEIVE);
                let first = self.buffers.lock().unwrap().send_buffer[0];
                self.device.put_output_char(first);
                self.send_sema.p();
                self.device.set_working_mode(AciaIrq::RECEIVE);
                message.len() as i64
            }
        }
    }

    /// Receive up to `max` payload bytes of the next NUL-terminated
    /// message.
    pub fn tty_receive(&self, max: usize) -> Vec<u8> {
        let message = match self.mode {
            AciaMode::None => unreachable!(),
            AciaMode::BusyWaiting => {
                // Polling is bounded: with nothing in flight only the
                // timer keeps firing, and waiting on it forever would hang
                // a receive on a silent line.
                let mut idle_rounds = 0;
                let mut buffer = Vec::new();
                loop {
                    match self.device.get_input_char() {
                        Some(0) => break,
                        Some(ch) => {
                            idle_rounds = 0;
                            buffer.push(ch);
                        }
                        None => {
                            idle_rounds += 1;
                            if idle_rounds > 10_000 || !self.sched.interrupt().idle() {
                                break;
                            }
                        }
                    }
                }
                buffer
            }
            AciaMode::Interrupt => {
                self.receive_sema.p();
                let mut b = self.buffers.lock().unwrap();
                let end = b
                    .receive_buffer
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(b.receive_buffer.len());
                let message: Vec<u8> = b.receive_buffer.drain(..end).collect();
                if !b.receive_buffer.is_empty() {
                    // Drop the NUL separating this message from the next.
                    b.receive_buffer.remove(0);
                }
                message
            }
        };
        log::debug!(target: "drv", "ACIA received {} bytes", message.len());
        message.into_iter().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn busy_waiting_loopback_round_trips() {
        let mut cfg = testing::test_config();
        cfg.acia = AciaMode::BusyWaiting;
        let kernel = testing::boot_with(cfg, "acia-busy");
        let acia = kernel.acia.as_ref().unwrap();
        assert_eq!(acia.tty_send("ping"), 4);
        assert_eq!(acia.tty_receive(16), b"ping".to_vec());
    }

    #[test]
    fn busy_waiting_receive_on_a_silent_line_returns_empty() {
        let mut cfg = testing::test_config();
        cfg.acia = AciaMode::BusyWaiting;
        let kernel = testing::boot_with(cfg, "acia-silent");
        let acia = kernel.acia.as_ref().unwrap();
        assert_eq!(acia.tty_receive(8), Vec::<u8>::new());
    }

    #[test]
    fn interrupt_mode_sleeps_through_the_transfer() {
        let mut cfg = testing::test_config();
        cfg.acia = AciaMode::Interrupt;
        let kernel = testing::boot_with(cfg, "acia-irq");
        let acia = kernel.acia.as_ref().unwrap().clone();

        let sender = {
            let acia = acia.clone();
            kernel.spawn("sender", move |_| {
                assert_eq!(acia.tty_send("hello line"), 10);
            })
        };
        sender.join();
        assert_eq!(acia.tty_receive(32), b"hello line".to_vec());
    }

    #[test]
    fn interrupt_mode_truncates_to_the_caller_limit() {
        let mut cfg = testing::test_config();
        cfg.acia = AciaMode::Interrupt;
        let kernel = testing::boot_with(cfg, "acia-trunc");
        let acia = kernel.acia.as_ref().unwrap();
        acia.tty_send("abcdef");
        assert_eq!(acia.tty_receive(3), b"abc".to_vec());
    }
}
