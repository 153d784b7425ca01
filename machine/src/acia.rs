//! ACIA (serial line) device emulation.
//!
//! The device has a one-character emission register and a reception queue.
//! The line is wired in loopback: a transmitted character lands in the
//! local reception queue one delay later, which is enough to exercise both
//! driver modes. Interrupt delivery for each direction is gated by the
//! working-mode register, as on the real part.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::interrupt::Interrupt;

/// Ticks for one character to cross the (loopback) line.
pub const ACIA_DELAY: u64 = 20;

bitflags::bitflags! {
    /// Working-mode register: which directions raise interrupts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AciaIrq: u32 {
        const SEND = 1 << 0;
        const RECEIVE = 1 << 1;
    }
}

/// State of the emission register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Empty,
    Busy,
}

/// Interrupt callbacks installed by the ACIA driver.
pub type AciaHandler = Arc<dyn Fn() + Send + Sync>;

struct AciaState {
    output: Option<u8>,
    input: VecDeque<u8>,
    irq: AciaIrq,
}

pub struct Acia {
    interrupt: Arc<Interrupt>,
    state: Arc<Mutex<AciaState>>,
    send_handler: Mutex<Option<AciaHandler>>,
    receive_handler: Mutex<Option<AciaHandler>>,
}

impl Acia {
    pub fn new(interrupt: Arc<Interrupt>) -> Self {
        Self {
            interrupt,
            state: Arc::new(Mutex::new(AciaState {
                output: None,
                input: VecDeque::new(),
                irq: AciaIrq::empty(),
            })),
            send_handler: Mutex::new(None),
            receive_handler: Mutex::new(None),
        }
    }

    pub fn set_send_handler(&self, handler: AciaHandler) {
        *self.send_handler.lock().unwrap() = Some(handler);
    }

    pub fn set_receive_handler(&self, handler: AciaHandler) {
        *self.receive_handler.lock().unwrap() = Some(handler);
    }

    /// Program the working-mode register.
    pub fn set_working_mode(&self, irq: AciaIrq) {
        self.state.lock().unwrap().irq = irq;
    }

    pub fn output_state(&self) -> OutputState {
        match self.state.lock().unwrap().output {
            Some(_) => OutputState::Busy,
            None => OutputState::Empty,
        }
    }

    pub fn input_available(&self) -> bool {
        !self.state.lock().unwrap().input.is_empty()
    }

    /// Load the emission register. The register must be empty. One line
    /// delay later the character lands in the reception queue and the
    /// enabled direction interrupts fire.
    pub fn put_output_char(&self, ch: u8) {
        {
            let mut state = self.state.lock().unwrap();
            assert!(state.output.is_none(), "ACIA emission register busy");
            state.output = Some(ch);
        }
        let send = self.send_handler.lock().unwrap().clone();
        let receive = self.receive_handler.lock().unwrap().clone();
        let state = self.state.clone();
        self.interrupt.schedule(
            ACIA_DELAY,
            Box::new(move || {
                let (fire_send, fire_receive) = {
                    let mut state = state.lock().unwrap();
                    let ch = state.output.take().expect("ACIA transfer without data");
                    state.input.push_back(ch);
                    (
                        state.irq.contains(AciaIrq::SEND),
                        state.irq.contains(AciaIrq::RECEIVE),
                    )
                };
                if fire_send {
                    if let Some(handler) = &send {
                        handler();
                    }
                }
                if fire_receive {
                    if let Some(handler) = &receive {
                        handler();
                    }
                }
            }),
        );
    }

    /// Pop one character from the reception queue.
    pub fn get_input_char(&self) -> Option<u8> {
        self.state.lock().unwrap().input.pop_front()
    }
}
