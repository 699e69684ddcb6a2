//! Process data model: the process table, and the fd table/mmap
//! space/cwd/thread-group bundle each process owns.
//!
//! Register files, stacks, and the actual context switch are architecture
//! specifics this crate does not implement; [`ksched::thread::Thread`]
//! already carries everything the scheduler needs, so a [`Process`] here
//! only adds the process-wide state threads within it share.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use kcore::sync::SpinLock;
use kfs::stat::Mode;
use kfs::Node;
use kmm::mmap::MmapSpace;
use kmm::Pmm;
use ksched::thread::{Thread, ThreadId};
use ksched::{current_cpu, SCHEDULER};

use crate::fdtable::FdSpace;

/// Numeric process identifier, unique for the lifetime of the kernel.
pub type Pid = u32;

struct ProcessState {
    cwd: Arc<Node>,
    umask: Mode,
    threads: Vec<ThreadId>,
    children: Vec<Pid>,
    exit_status: Option<i32>,
}

/// One process: a thread group sharing an address space, fd table, and
/// current working directory.
pub struct Process {
    /// This process's id.
    pub pid: Pid,
    /// Parent's id, or `None` for the first process.
    pub ppid: Option<Pid>,
    /// Human-readable name, surfaced through `uname`/debug output.
    pub name: String,
    /// Open file descriptors and sockets, shared by every thread in the
    /// group.
    pub fds: FdSpace,
    /// mmap range bookkeeping for this process's address space.
    pub mmap_space: SpinLock<MmapSpace>,
    /// Physical frame allocator shared by every process, needed to
    /// materialize copied frames during a `MAP_PRIVATE` `fork()`.
    pmm: Arc<Pmm>,
    /// HHDM offset, needed to reach physical frames while copying them.
    hhdm_offset: u64,
    state: SpinLock<ProcessState>,
}

static NEXT_PID: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(1);
static TABLE: SpinLock<BTreeMap<Pid, Arc<Process>>> = SpinLock::new(BTreeMap::new());
static THREAD_OWNER: SpinLock<BTreeMap<ThreadId, Pid>> = SpinLock::new(BTreeMap::new());

impl Process {
    /// Creates a new process rooted at `cwd`, with no threads attached yet.
    #[must_use]
    pub fn new(name: String, ppid: Option<Pid>, cwd: Arc<Node>, pmm: Arc<Pmm>, hhdm_offset: u64) -> Arc<Self> {
        let pid = NEXT_PID.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        let process = Arc::new(Self {
            pid,
            ppid,
            name,
            fds: FdSpace::new(),
            mmap_space: SpinLock::new(MmapSpace::new()),
            pmm,
            hhdm_offset,
            state: SpinLock::new(ProcessState {
                cwd,
                umask: Mode::from_bits_truncate(0o022),
                threads: Vec::new(),
                children: Vec::new(),
                exit_status: None,
            }),
        });
        TABLE.lock().insert(pid, process.clone());
        process
    }

    /// Attaches `thread` to this process's thread group, so
    /// [`current`] can map the scheduler's running thread back to it.
    pub fn attach_thread(self: &Arc<Self>, thread: &Arc<Thread>) {
        self.state.lock().threads.push(thread.id);
        THREAD_OWNER.lock().insert(thread.id, self.pid);
    }

    /// Current working directory.
    #[must_use]
    pub fn cwd(&self) -> Arc<Node> {
        self.state.lock().cwd.clone()
    }

    /// Replaces the current working directory (`chdir`).
    pub fn set_cwd(&self, node: Arc<Node>) {
        self.state.lock().cwd = node;
    }

    /// Current `umask`.
    #[must_use]
    pub fn umask(&self) -> Mode {
        self.state.lock().umask
    }

    /// Sets `umask`, returning the previous value.
    pub fn set_umask(&self, mode: Mode) -> Mode {
        core::mem::replace(&mut self.state.lock().umask, mode)
    }

    /// Records the exit status for a later `task_wait`-shaped query.
    pub fn set_exit_status(&self, status: i32) {
        self.state.lock().exit_status = Some(status);
    }

    /// Spawns a child process sharing this process's fd table (`fork`
    /// semantics: every description is shared; `MAP_PRIVATE` mmap ranges get
    /// their own eagerly copied frames, `MAP_SHARED` ones keep pointing at
    /// the parent's). Fails with `ENoMem` if the allocator is exhausted
    /// partway through copying the address space.
    pub fn fork(self: &Arc<Self>, child_name: String) -> Result<Arc<Self>, Errno> {
        let cwd = self.cwd();
        let mmap_space = self.mmap_space.lock().fork(&self.pmm, self.hhdm_offset)?;
        let pid = NEXT_PID.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        let child = Arc::new(Self {
            pid,
            ppid: Some(self.pid),
            name: child_name,
            fds: self.fds.fork(),
            mmap_space: SpinLock::new(mmap_space),
            pmm: Arc::clone(&self.pmm),
            hhdm_offset: self.hhdm_offset,
            state: SpinLock::new(ProcessState {
                cwd,
                umask: self.umask(),
                threads: Vec::new(),
                children: Vec::new(),
                exit_status: None,
            }),
        });
        self.state.lock().children.push(pid);
        TABLE.lock().insert(pid, child.clone());
        Ok(child)
    }
}

/// Looks up the process owning `pid`.
#[must_use]
pub fn find(pid: Pid) -> Option<Arc<Process>> {
    TABLE.lock().get(&pid).cloned()
}

/// Removes `pid` from the process table, releasing its last strong
/// reference from the kernel's own bookkeeping.
pub fn reap(pid: Pid) -> Result<(), Errno> {
    TABLE.lock().remove(&pid).map(|_| ()).ok_or(Errno::ENoEnt)
}

/// Returns the process owning the thread currently running on this CPU.
#[must_use]
pub fn current() -> Option<Arc<Process>> {
    let thread = SCHEDULER.current(current_cpu());
    let pid = *THREAD_OWNER.lock().get(&thread.id)?;
    find(pid)
}
