//! Millisecond timer wheel driven by the LAPIC tick at `TIMER_FREQ` Hz.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use kcore::sync::SpinLock;

use crate::event::{event_trigger, Event};

/// Tick frequency in Hz; each tick advances the clocks by one millisecond.
pub const TIMER_FREQ: u64 = 1000;

struct TimerEntry {
    remaining_ms: u64,
    event: Arc<Event>,
    fired: bool,
}

/// The set of currently armed timers plus the kernel's monotonic and
/// wall-clock millisecond counters.
pub struct TimerSet {
    entries: SpinLock<Vec<TimerEntry>>,
    monotonic_ms: AtomicU64,
    realtime_ms: AtomicU64,
}

/// Handle to an armed timer, used to [`TimerSet::disarm`] it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(usize);

impl TimerSet {
    /// Creates an empty timer set with both clocks at zero.
    pub const fn new() -> Self {
        Self {
            entries: SpinLock::new(Vec::new()),
            monotonic_ms: AtomicU64::new(0),
            realtime_ms: AtomicU64::new(0),
        }
    }

    /// Arms a new timer that will trigger `event` after `delay_ms`
    /// milliseconds.
    pub fn arm(&self, delay_ms: u64, event: Arc<Event>) -> TimerHandle {
        let mut entries = self.entries.lock();
        entries.push(TimerEntry {
            remaining_ms: delay_ms,
            event,
            fired: false,
        });
        TimerHandle(entries.len() - 1)
    }

    /// Disarms a timer in O(1) by swapping the last element into its slot.
    /// `handle` becomes invalid after this call; any other previously
    /// issued handle pointing at the slot that used to be last is also
    /// invalidated (the caller must not have retained it past its own
    /// `disarm`/fire).
    pub fn disarm(&self, handle: TimerHandle) {
        let mut entries = self.entries.lock();
        if handle.0 < entries.len() {
            entries.swap_remove(handle.0);
        }
    }

    /// Returns the monotonic clock in milliseconds since boot.
    pub fn monotonic_ms(&self) -> u64 {
        self.monotonic_ms.load(Ordering::Relaxed)
    }

    /// Returns the wall-clock time in milliseconds (set once from the boot
    /// protocol's reported wall clock, then free-running).
    pub fn realtime_ms(&self) -> u64 {
        self.realtime_ms.load(Ordering::Relaxed)
    }

    /// Seeds the wall clock from the boot protocol; called once during
    /// early boot.
    pub fn set_realtime_ms(&self, value: u64) {
        self.realtime_ms.store(value, Ordering::Relaxed);
    }

    /// Runs one tick: always advances both clocks by one millisecond, then,
    /// only if the timer lock is uncontended, decrements every armed
    /// timer's remaining time and fires any that reach zero. Skipping under
    /// contention (rather than blocking) keeps the interrupt handler
    /// non-blocking; the next tick catches up.
    pub fn tick(&self) {
        self.monotonic_ms.fetch_add(1, Ordering::Relaxed);
        self.realtime_ms.fetch_add(1, Ordering::Relaxed);

        let Some(mut entries) = self.entries.try_lock() else {
            return;
        };
        for entry in entries.iter_mut() {
            if entry.fired {
                continue;
            }
            if entry.remaining_ms == 0 {
                continue;
            }
            entry.remaining_ms -= 1;
            if entry.remaining_ms == 0 {
                entry.fired = true;
                event_trigger(&entry.event, false);
            }
        }
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

/// The single global timer set.
pub static TIMERS: TimerSet = TimerSet::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_advances_clocks() {
        let timers = TimerSet::new();
        timers.tick();
        timers.tick();
        assert_eq!(timers.monotonic_ms(), 2);
        assert_eq!(timers.realtime_ms(), 2);
    }

    #[test]
    fn timer_fires_event_after_delay() {
        let timers = TimerSet::new();
        let ev = Arc::new(Event::new());
        timers.arm(3, ev.clone());
        for _ in 0..3 {
            timers.tick();
        }
        // Firing calls event_trigger(drop=false), which bumps pending since
        // nobody is listening yet.
        assert_eq!(ev.state_pending_for_test(), 1);
    }

    #[test]
    fn disarm_removes_timer_before_it_fires() {
        let timers = TimerSet::new();
        let ev = Arc::new(Event::new());
        let handle = timers.arm(5, ev.clone());
        timers.tick();
        timers.disarm(handle);
        for _ in 0..10 {
            timers.tick();
        }
        assert_eq!(ev.state_pending_for_test(), 0);
    }

    #[test]
    fn disarm_by_swap_remove_keeps_other_timers_correct() {
        let timers = TimerSet::new();
        let ev_a = Arc::new(Event::new());
        let ev_b = Arc::new(Event::new());
        let handle_a = timers.arm(2, ev_a.clone());
        let _handle_b = timers.arm(10, ev_b.clone());
        timers.disarm(handle_a);
        for _ in 0..2 {
            timers.tick();
        }
        assert_eq!(ev_b.state_pending_for_test(), 0);
    }
}
