//! Console device emulation.
//!
//! Character-at-a-time, asynchronous in both directions: writing a
//! character (or requesting one) schedules a completion interrupt a fixed
//! delay later. Output accumulates in a capture buffer the host can drain
//! (and is echoed to the host terminal when enabled); input comes from an
//! in-memory queue the host feeds. An exhausted input queue delivers NUL,
//! which the console driver treats as end of input.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::interrupt::Interrupt;
use crate::stats::Stats;

/// Ticks between a console request and its completion interrupt.
pub const CONSOLE_DELAY: u64 = 10;

/// Completion callback installed by the console driver.
pub type ConsoleDone = Arc<dyn Fn() + Send + Sync>;

pub struct Console {
    interrupt: Arc<Interrupt>,
    stats: Arc<Stats>,
    output: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
    /// Character delivered by the last completed read request.
    incoming: Mutex<Option<u8>>,
    echo: AtomicBool,
    put_done: Mutex<Option<ConsoleDone>>,
    get_done: Mutex<Option<ConsoleDone>>,
}

impl Console {
    pub fn new(interrupt: Arc<Interrupt>, stats: Arc<Stats>) -> Self {
        Self {
            interrupt,
            stats,
            output: Mutex::new(Vec::new()),
            input: Mutex::new(VecDeque::new()),
            incoming: Mutex::new(None),
            echo: AtomicBool::new(false),
            put_done: Mutex::new(None),
            get_done: Mutex::new(None),
        }
    }

    /// Echo console output to the host terminal as it is produced.
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    pub fn set_put_done(&self, handler: ConsoleDone) {
        *self.put_done.lock().unwrap() = Some(handler);
    }

    pub fn set_get_done(&self, handler: ConsoleDone) {
        *self.get_done.lock().unwrap() = Some(handler);
    }

    /// Emit one character; the write-done interrupt fires later.
    pub fn put_char(&self, ch: u8) {
        self.output.lock().unwrap().push(ch);
        if self.echo.load(Ordering::SeqCst) {
            use std::io::Write;
            let mut out = std::io::stdout().lock();
            out.write_all(&[ch]).ok();
            out.flush().ok();
        }
        self.stats.incr_console_chars_written();
        let handler = self.put_done.lock().unwrap().clone();
        self.interrupt.schedule(
            CONSOLE_DELAY,
            Box::new(move || {
                if let Some(handler) = handler {
                    handler();
                }
            }),
        );
    }

    /// Ask for one character; the read-done interrupt fires when it is
    /// available through [`Console::get_char`].
    pub fn request_char(&self) {
        let handler = self.get_done.lock().unwrap().clone();
        let ch = self.input.lock().unwrap().pop_front().unwrap_or(0);
        *self.incoming.lock().unwrap() = Some(ch);
        if ch != 0 {
            self.stats.incr_console_chars_read();
        }
        self.interrupt.schedule(
            CONSOLE_DELAY,
            Box::new(move || {
                if let Some(handler) = handler {
                    handler();
                }
            }),
        );
    }

    /// Character delivered by the last completed request. NUL means the
    /// input queue was empty.
    pub fn get_char(&self) -> u8 {
        self.incoming.lock().unwrap().take().unwrap_or(0)
    }

    /// Feed bytes into the input queue (test harness and host glue).
    pub fn push_input(&self, bytes: &[u8]) {
        self.input.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Drain everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.output.lock().unwrap())
    }
}
