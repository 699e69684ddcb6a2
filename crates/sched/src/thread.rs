//! The scheduler's thread object.
//!
//! Architectural context (register file, FPU save area, stacks) is owned by
//! the `kernel` glue crate, which knows the calling convention and stack
//! layout; this crate only tracks the state the scheduler and event/timer
//! subsystems need to make decisions.

use alloc::string::String;
use alloc::sync::Arc;

use kcore::sync::SpinLock;

/// Upper bound on simultaneous `event_await` waits and on listeners per
/// event, matching the bounded slot arrays described for the event
/// subsystem.
pub const MAX_ATTACHED_EVENTS: usize = 32;

/// Numeric thread identifier, unique for the lifetime of the kernel.
pub type ThreadId = u64;

/// Why a thread was most recently placed back on the run queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Woken because an awaited event fired.
    Event,
    /// Woken by signal-style preemption (delivered regardless of any event
    /// the thread was waiting on).
    Signal,
}

struct ThreadState {
    enqueued: bool,
    /// Identity (as a raw pointer value) of the `Event` that woke this
    /// thread, set by `event_trigger` just before enqueue. `event_await`
    /// resolves this back to an index into its own `events[]` array, since
    /// a single `Event` does not know its position in any particular
    /// caller's wait set.
    which_event: Option<usize>,
    wake_reason: Option<WakeReason>,
    /// Events this thread is currently attached to as a listener, so
    /// `event_await` can detach from all of them on wake regardless of
    /// which one fired.
    attached: alloc::vec::Vec<usize>,
}

/// A schedulable unit of execution.
pub struct Thread {
    /// Unique thread id.
    pub id: ThreadId,
    /// Debug/`ps`-shaped name.
    pub name: String,
    /// Affinity hint read by the debug/`uname` syscall path; the round-robin
    /// scheduler does not currently act on it.
    pub cpu_affinity: Option<u32>,
    state: SpinLock<ThreadState>,
}

impl Thread {
    /// Creates a new thread object in the dequeued state.
    pub fn new(id: ThreadId, name: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            cpu_affinity: None,
            state: SpinLock::new(ThreadState {
                enqueued: false,
                which_event: None,
                wake_reason: None,
                attached: alloc::vec::Vec::new(),
            }),
        })
    }

    /// Returns whether this thread is currently on a run queue.
    pub fn is_enqueued(&self) -> bool {
        self.state.lock().enqueued
    }

    pub(crate) fn set_enqueued(&self, value: bool) {
        self.state.lock().enqueued = value;
    }

    /// Records which event (by pointer identity) woke this thread, or that
    /// a signal did, called just before handing the thread to the
    /// scheduler.
    pub(crate) fn set_woken(&self, which_event: Option<usize>, reason: WakeReason) {
        let mut state = self.state.lock();
        state.which_event = which_event;
        state.wake_reason = Some(reason);
    }

    /// Consumes and returns the wake result recorded by `set_woken`.
    pub(crate) fn take_wake(&self) -> (Option<usize>, Option<WakeReason>) {
        let mut state = self.state.lock();
        (state.which_event.take(), state.wake_reason.take())
    }

    /// Attaches this thread as a listener of event index `idx` within the
    /// current `event_await` call. Returns `false` if the bounded attach
    /// list is already full.
    pub(crate) fn attach(&self, idx: usize) -> bool {
        let mut state = self.state.lock();
        if state.attached.len() >= MAX_ATTACHED_EVENTS {
            return false;
        }
        state.attached.push(idx);
        true
    }

    /// Clears the attach list, returning the indices that were attached, so
    /// the caller can detach this thread from each corresponding event.
    pub(crate) fn take_attached(&self) -> alloc::vec::Vec<usize> {
        core::mem::take(&mut self.state.lock().attached)
    }
}
