//! The multi-wait event primitive: the kernel's single blocking primitive.
//! Socket receives, pipe reads, and every other wait are expressed as one
//! or more `Event`s.

use alloc::sync::Arc;

use kcore::sync::SpinLock;

use crate::sched::{self, SCHEDULER};
use crate::thread::{Thread, WakeReason, MAX_ATTACHED_EVENTS};

struct EventState {
    pending: u32,
    listeners: [Option<Arc<Thread>>; MAX_ATTACHED_EVENTS],
}

/// A multi-wait event: either a counting semaphore (when nobody is
/// listening, `trigger` just bumps `pending`) or a wakeup broadcast (when
/// listeners are attached, `trigger` drains and wakes all of them).
pub struct Event {
    state: SpinLock<EventState>,
}

/// Sentinel returned by [`event_await`] when the wait was broken by
/// signal-style preemption rather than a genuine event firing.
pub const WOKEN_BY_SIGNAL: usize = usize::MAX;

impl Event {
    /// Creates a new event with no pending count and no listeners.
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(EventState {
                pending: 0,
                listeners: [const { None }; MAX_ATTACHED_EVENTS],
            }),
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Event {
    pub(crate) fn state_pending_for_test(&self) -> u32 {
        self.state.lock().pending
    }
}

/// Waits on one of several events, returning the index of the one that
/// fired, or [`WOKEN_BY_SIGNAL`] if woken by signal-style preemption instead.
/// Returns `None` immediately if `block` is false and nothing is pending.
///
/// Events are locked in array order (matching the order callers pass them)
/// to give every caller a consistent lock ordering and avoid deadlock
/// between two threads awaiting an overlapping event set.
pub fn event_await(events: &[&Event], block: bool) -> Option<usize> {
    // Step 1/2: lock in order, check for an already-pending event.
    {
        let mut guards = alloc::vec::Vec::with_capacity(events.len());
        for ev in events {
            guards.push(ev.state.lock());
        }
        for (idx, guard) in guards.iter_mut().enumerate() {
            if guard.pending > 0 {
                guard.pending -= 1;
                return Some(idx);
            }
        }
        if !block {
            return None;
        }
        // Step 4: attach the calling thread to every event as a listener.
        let current = SCHEDULER.current(sched::current_cpu());
        for (idx, guard) in guards.iter_mut().enumerate() {
            let slot = guard
                .listeners
                .iter_mut()
                .find(|slot| slot.is_none())
                .expect("event listener slots exhausted (> 32 waiters)");
            *slot = Some(current.clone());
            assert!(current.attach(idx), "thread attached to > 32 events");
        }
        SCHEDULER.dequeue(&current);
        // Guards drop here, releasing every event's lock before yielding.
    }

    // SAFETY: interrupts are expected to be disabled by the caller for the
    // duration of the blocking wait, as documented on `yield_now`.
    unsafe { sched::yield_now() };

    // Step 5: re-lock, detach from every event, report the wake reason.
    let current = SCHEDULER.current(sched::current_cpu());
    let attached = current.take_attached();
    for idx in attached {
        let mut guard = events[idx].state.lock();
        if let Some(slot) = guard
            .listeners
            .iter_mut()
            .find(|slot| matches!(slot, Some(t) if Arc::ptr_eq(t, &current)))
        {
            *slot = None;
        }
    }
    match current.take_wake() {
        (_, Some(WakeReason::Signal)) => Some(WOKEN_BY_SIGNAL),
        (Some(identity), Some(WakeReason::Event)) => events
            .iter()
            .position(|ev| *ev as *const Event as usize == identity),
        _ => Some(WOKEN_BY_SIGNAL),
    }
}

/// Triggers `ev`. If nobody is listening and `drop` is false, bumps the
/// pending count so a future `event_await` sees it immediately; otherwise
/// (or if listeners exist) wakes every attached listener. Returns the
/// number of threads woken.
pub fn event_trigger(ev: &Event, drop: bool) -> usize {
    let mut guard = ev.state.lock();
    let any_listener = guard.listeners.iter().any(Option::is_some);
    if !any_listener {
        if !drop {
            guard.pending += 1;
        }
        return 0;
    }

    let identity = ev as *const Event as usize;
    let mut woken = 0;
    for slot in guard.listeners.iter_mut() {
        if let Some(thread) = slot.take() {
            thread.set_woken(Some(identity), WakeReason::Event);
            SCHEDULER.enqueue(thread, false);
            woken += 1;
        }
    }
    woken
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_without_listeners_sets_pending() {
        let ev = Event::new();
        assert_eq!(event_trigger(&ev, false), 0);
        assert_eq!(ev.state.lock().pending, 1);
    }

    #[test]
    fn trigger_with_drop_does_not_set_pending() {
        let ev = Event::new();
        assert_eq!(event_trigger(&ev, true), 0);
        assert_eq!(ev.state.lock().pending, 0);
    }

    #[test]
    fn await_nonblocking_with_pending_returns_immediately() {
        let ev = Event::new();
        event_trigger(&ev, false);
        let result = event_await(&[&ev], false);
        assert_eq!(result, Some(0));
    }

    #[test]
    fn await_nonblocking_without_pending_returns_none() {
        let ev = Event::new();
        let result = event_await(&[&ev], false);
        assert_eq!(result, None);
    }

    #[test]
    fn pending_is_decremented_on_consume() {
        let ev = Event::new();
        event_trigger(&ev, false);
        event_trigger(&ev, false);
        assert_eq!(ev.state.lock().pending, 2);
        event_await(&[&ev], false);
        assert_eq!(ev.state.lock().pending, 1);
    }
}
