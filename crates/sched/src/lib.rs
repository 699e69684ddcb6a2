//! Scheduler, synchronization primitives, events, and timers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod event;
pub mod sched;
pub mod spinlock;
pub mod thread;
pub mod timer;

pub use event::{event_await, event_trigger, Event, WOKEN_BY_SIGNAL};
pub use sched::{current_cpu, register_current_cpu_fn, Scheduler, SCHEDULER};
pub use spinlock::{Spinlock, SpinlockGuard, TestAcqResult};
pub use thread::{Thread, ThreadId, WakeReason, MAX_ATTACHED_EVENTS};
pub use timer::{TimerHandle, TimerSet, TIMER_FREQ, TIMERS};
