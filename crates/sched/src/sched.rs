//! Preemptive, priority-less, round-robin scheduler over a single global
//! run queue shared by every CPU.
//!
//! Per-CPU bookkeeping here is limited to what the event/timer subsystems
//! need (the idle thread and the currently running thread); the register
//! file, TSS, and LAPIC oneshot programming are architecture specifics that
//! live in the `kernel` glue crate and call back into this module at the
//! tick boundary.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicPtr, Ordering};

use kcore::sync::SpinLock;

use crate::thread::{Thread, WakeReason};

/// Upper bound on concurrently registered CPUs.
pub const MAX_CPUS: usize = 64;

struct PerCpu {
    lapic_id: u32,
    lapic_freq: u64,
    idle_thread: Arc<Thread>,
    current: Arc<Thread>,
}

/// The global scheduler state: one run queue, and per-CPU idle/current
/// thread tracking.
pub struct Scheduler {
    run_queue: SpinLock<VecDeque<Arc<Thread>>>,
    percpu: SpinLock<[Option<PerCpu>; MAX_CPUS]>,
}

impl Scheduler {
    /// Creates an empty scheduler with no CPUs registered yet.
    pub const fn new() -> Self {
        Self {
            run_queue: SpinLock::new(VecDeque::new()),
            percpu: SpinLock::new([const { None }; MAX_CPUS]),
        }
    }

    /// Registers a CPU's idle thread and LAPIC parameters. Must be called
    /// once per CPU during boot before that CPU's tick handler fires.
    pub fn register_cpu(&self, cpu: usize, idle_thread: Arc<Thread>, lapic_id: u32, lapic_freq: u64) {
        let mut table = self.percpu.lock();
        table[cpu] = Some(PerCpu {
            lapic_id,
            lapic_freq,
            idle_thread: idle_thread.clone(),
            current: idle_thread,
        });
    }

    /// Places `thread` on the tail of the run queue. `by_signal` records why
    /// the enqueue happened (consulted by `event_await`'s sentinel return).
    pub fn enqueue(&self, thread: Arc<Thread>, by_signal: bool) {
        thread.set_enqueued(true);
        if by_signal {
            thread.set_woken(None, WakeReason::Signal);
        }
        self.run_queue.lock().push_back(thread);
    }

    /// Removes `thread` from the run queue bookkeeping (the caller has
    /// already popped it, or is about to block it).
    pub fn dequeue(&self, thread: &Thread) {
        thread.set_enqueued(false);
    }

    /// Pops the next runnable thread, if any.
    pub fn pick_next(&self) -> Option<Arc<Thread>> {
        let thread = self.run_queue.lock().pop_front();
        if let Some(t) = &thread {
            t.set_enqueued(false);
        }
        thread
    }

    /// Returns the thread currently running on `cpu`.
    pub fn current(&self, cpu: usize) -> Arc<Thread> {
        self.percpu.lock()[cpu]
            .as_ref()
            .expect("cpu not registered")
            .current
            .clone()
    }

    /// Runs one scheduler tick for `cpu`: pops the next runnable thread (or
    /// falls back to that CPU's idle thread) and records it as current.
    /// Returns the thread the caller should now context-switch into.
    pub fn tick(&self, cpu: usize) -> Arc<Thread> {
        let next = self.pick_next();
        let mut table = self.percpu.lock();
        let state = table[cpu].as_mut().expect("cpu not registered");
        let next = next.unwrap_or_else(|| state.idle_thread.clone());
        state.current = next.clone();
        next
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// The single global scheduler instance.
pub static SCHEDULER: Scheduler = Scheduler::new();

/// Architecture callback returning the calling CPU's index, installed by
/// the `kernel` glue crate (reads a GS-relative per-CPU field). Falls back
/// to CPU 0 when unregistered, which is sufficient for host-side tests.
static CURRENT_CPU_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Installs the callback used by [`current_cpu`].
pub fn register_current_cpu_fn(f: fn() -> usize) {
    CURRENT_CPU_FN.store(f as *mut (), Ordering::Release);
}

/// Returns the calling CPU's index.
pub fn current_cpu() -> usize {
    let ptr = CURRENT_CPU_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return 0;
    }
    // SAFETY: only a value stored by `register_current_cpu_fn`, which took
    // a `fn() -> usize`, is ever placed here.
    let f: fn() -> usize = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Yields the CPU back to the scheduler. The architecture-specific context
/// save/restore is performed by the `kernel` glue crate around this call;
/// here we only run the queue-management side of a voluntary yield.
///
/// # Safety
///
/// Must be called with interrupts disabled and only from the thread that is
/// yielding.
pub unsafe fn yield_now() {
    let cpu = current_cpu();
    SCHEDULER.tick(cpu);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn enqueue_then_pick_next_returns_same_thread() {
        let sched = Scheduler::new();
        let t = Thread::new(1, "worker".to_string());
        sched.enqueue(t.clone(), false);
        let picked = sched.pick_next().unwrap();
        assert_eq!(picked.id, t.id);
    }

    #[test]
    fn tick_falls_back_to_idle_when_queue_empty() {
        let sched = Scheduler::new();
        let idle = Thread::new(0, "idle".to_string());
        sched.register_cpu(0, idle.clone(), 0, 1000);
        let next = sched.tick(0);
        assert_eq!(next.id, idle.id);
    }

    #[test]
    fn tick_prefers_queued_thread_over_idle() {
        let sched = Scheduler::new();
        let idle = Thread::new(0, "idle".to_string());
        sched.register_cpu(0, idle, 0, 1000);
        let worker = Thread::new(7, "worker".to_string());
        sched.enqueue(worker.clone(), false);
        let next = sched.tick(0);
        assert_eq!(next.id, worker.id);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let sched = Scheduler::new();
        let a = Thread::new(1, "a".to_string());
        let b = Thread::new(2, "b".to_string());
        sched.enqueue(a.clone(), false);
        sched.enqueue(b.clone(), false);
        assert_eq!(sched.pick_next().unwrap().id, a.id);
        assert_eq!(sched.pick_next().unwrap().id, b.id);
    }
}
