//! Interrupt controller and simulated time.
//!
//! Simulated time only moves when the kernel lets it: one tick batch when
//! interrupts get re-enabled, one batch per executed user instruction, and a
//! jump to the next pending event when the machine idles. Device emulation
//! schedules deferred callbacks ("interrupts") at absolute tick counts;
//! masking postpones their delivery, it never loses them.
//!
//! Because the kernel multiplexes a single simulated CPU, disabling
//! interrupts is the kernel's one and only mutual-exclusion primitive: with
//! delivery off there is no timer, hence no involuntary context switch.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use crate::stats::Stats;

/// Ticks charged for a batch of kernel instructions when interrupts are
/// re-enabled.
pub const SYSTEM_TICK: u64 = 10;

/// Interrupt delivery state of the simulated processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntStatus {
    Off,
    On,
}

/// A deferred device callback.
pub type Handler = Box<dyn FnOnce() + Send>;

struct Pending {
    when: u64,
    seq: u64,
    handler: Handler,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}
impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // BinaryHeap is a max-heap; invert so the earliest event is on top.
    // Ties fire in scheduling order.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.when, other.seq).cmp(&(self.when, self.seq))
    }
}

struct InterruptState {
    level: IntStatus,
    pending: BinaryHeap<Pending>,
    seq: u64,
}

/// The interrupt controller of the simulated machine.
pub struct Interrupt {
    state: Mutex<InterruptState>,
    yield_on_return: AtomicBool,
    stats: Arc<Stats>,
}

impl Interrupt {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            state: Mutex::new(InterruptState {
                level: IntStatus::Off,
                pending: BinaryHeap::new(),
                seq: 0,
            }),
            yield_on_return: AtomicBool::new(false),
            stats,
        }
    }

    pub fn level(&self) -> IntStatus {
        self.state.lock().unwrap().level
    }

    /// Change the delivery level, returning the previous one. Re-enabling
    /// charges [`SYSTEM_TICK`] ticks and delivers every interrupt that came
    /// due while masked.
    pub fn set_level(&self, level: IntStatus) -> IntStatus {
        let old = {
            let mut state = self.state.lock().unwrap();
            let old = state.level;
            state.level = level;
            old
        };
        if old == IntStatus::Off && level == IntStatus::On {
            self.stats.add_system_ticks(SYSTEM_TICK);
            self.fire_due();
        }
        old
    }

    /// Advance simulated time by `cycles` after one user instruction and
    /// deliver whatever came due.
    pub fn one_tick(&self, cycles: u64) {
        self.stats.add_user_ticks(cycles);
        if self.state.lock().unwrap().level == IntStatus::On {
            self.fire_due();
        }
    }

    /// The machine has nothing to run: jump simulated time to the next
    /// pending interrupt and deliver it. Returns `false` when no interrupt
    /// is pending at all, i.e. time can no longer advance.
    pub fn idle(&self) -> bool {
        let next = {
            let state = self.state.lock().unwrap();
            match state.pending.peek() {
                Some(p) => p.when,
                None => return false,
            }
        };
        let now = self.stats.total_ticks();
        if next > now {
            self.stats.add_idle_ticks(next - now);
        }
        self.fire_due();
        true
    }

    /// Schedule `handler` to fire `delay` ticks from now. Delivery happens
    /// at the first point simulated time reaches the deadline with
    /// interrupts enabled (or the machine idle).
    pub fn schedule(&self, delay: u64, handler: Handler) {
        assert!(delay > 0, "interrupt scheduled with no delay");
        let mut state = self.state.lock().unwrap();
        let seq = state.seq;
        state.seq += 1;
        state.pending.push(Pending {
            when: self.stats.total_ticks() + delay,
            seq,
            handler,
        });
    }

    /// Ask for a `Yield` of the running thread once the current instruction
    /// completes. Set by the timer interrupt handler.
    pub fn set_yield_on_return(&self) {
        self.yield_on_return.store(true, AtomicOrdering::SeqCst);
    }

    /// Consume the yield request, if any.
    pub fn take_yield_on_return(&self) -> bool {
        self.yield_on_return.swap(false, AtomicOrdering::SeqCst)
    }

    fn fire_due(&self) {
        loop {
            let handler = {
                let mut state = self.state.lock().unwrap();
                let now = self.stats.total_ticks();
                match state.pending.peek() {
                    Some(p) if p.when <= now => state.pending.pop().unwrap().handler,
                    _ => break,
                }
            };
            // Handlers run with the state lock released; they are free to
            // schedule further interrupts or toggle the level.
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (Arc<Stats>, Interrupt) {
        let stats = Arc::new(Stats::new());
        (stats.clone(), Interrupt::new(stats))
    }

    #[test]
    fn masked_interrupts_fire_on_reenable() {
        let (_stats, interrupt) = controller();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = fired.clone();
        interrupt.schedule(
            5,
            Box::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst)),
        );
        // Time passes but delivery stays off.
        interrupt.one_tick(50);
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
        interrupt.set_level(IntStatus::On);
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn idle_jumps_to_the_next_pending_event() {
        let (stats, interrupt) = controller();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = fired.clone();
        interrupt.schedule(
            1000,
            Box::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst)),
        );
        assert!(interrupt.idle());
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert!(stats.total_ticks() >= 1000);
        // Nothing left: time can no longer advance.
        assert!(!interrupt.idle());
    }

    #[test]
    fn delivery_respects_deadline_order() {
        let (_stats, interrupt) = controller();
        interrupt.set_level(IntStatus::On);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(30u64, 'c'), (10, 'a'), (20, 'b')] {
            let order = order.clone();
            interrupt.schedule(delay, Box::new(move || order.lock().unwrap().push(tag)));
        }
        interrupt.one_tick(100);
        assert_eq!(*order.lock().unwrap(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn yield_request_is_consumed_once() {
        let (_stats, interrupt) = controller();
        interrupt.set_yield_on_return();
        assert!(interrupt.take_yield_on_return());
        assert!(!interrupt.take_yield_on_return());
    }
}
