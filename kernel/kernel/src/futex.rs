//! `futex_wait`/`futex_wake`: the generic blocking primitive syscalls sit
//! on top of, keyed by the futex word's address rather than anything
//! socket- or pipe-specific.
//!
//! Every other wait in this kernel (socket receive, pipe read, `sleep`)
//! is expressed through [`ksched::event::Event`] directly; futexes exist
//! so userspace can build its own synchronization on the same primitive
//! without the kernel knowing what it's being used for.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use kcore::errno::Errno;
use kcore::sync::SpinLock;
use ksched::event::{event_await, event_trigger, Event};

static TABLE: SpinLock<BTreeMap<usize, Arc<Event>>> = SpinLock::new(BTreeMap::new());

fn event_for(key: usize) -> Arc<Event> {
    let mut table = TABLE.lock();
    table.entry(key).or_insert_with(|| Arc::new(Event::new())).clone()
}

/// Blocks until `futex_wake` fires on `key`, unless `current` (the value
/// the caller already read from the futex word) no longer matches
/// `expected` — mirroring the atomic check-then-sleep that makes futexes
/// race-free without the kernel touching user memory itself.
pub fn wait(key: usize, expected: u32, current: u32) -> Result<(), Errno> {
    if current != expected {
        return Err(Errno::EAgain);
    }
    let event = event_for(key);
    event_await(&[&event], true);
    Ok(())
}

/// Wakes up to `max_waiters` threads blocked on `key`, returning how many
/// were woken. `Event` does not track a waiter count, so this reports at
/// most 1 per call; callers needing to wake more issue several calls, the
/// same shape `FUTEX_WAKE`'s count argument expects.
pub fn wake(key: usize, max_waiters: u32) -> usize {
    if max_waiters == 0 {
        return 0;
    }
    let Some(event) = TABLE.lock().get(&key).cloned() else {
        return 0;
    };
    event_trigger(&event, false);
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_rejects_stale_value_immediately() {
        assert_eq!(wait(1, 5, 6), Err(Errno::EAgain));
    }

    #[test]
    fn wake_on_unknown_key_wakes_nobody() {
        assert_eq!(wake(0xdead_beef, 1), 0);
    }
}
