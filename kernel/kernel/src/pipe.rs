//! Anonymous pipes: an in-kernel ring buffer shared by a read end and a
//! write end, the way [`knet::unix`]'s connected sockets share one.
//!
//! Pipes have no filesystem path, so they need their own placeholder
//! [`FileSystem`] solely to satisfy [`Node`]'s `filesystem` field; `create`/
//! `mount` on it are never actually reachable from a syscall.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;

use kcore::errno::Errno;
use kcore::sync::SpinLock;
use kfs::resource::Resource;
use kfs::stat::{Mode, Stat};
use kfs::vfs::{FileSystem, Node, NodeKind};
use ksched::event::{event_await, event_trigger, Event};

const CAPACITY: usize = 0x10000;

struct PipeFs;

impl FileSystem for PipeFs {
    fn name(&self) -> &str {
        "pipefs"
    }

    fn create(&self, _parent: &Arc<Node>, _name: &str, _kind: NodeKind) -> Result<Arc<Node>, Errno> {
        Err(Errno::ENoSys)
    }

    fn mount(&self, _target_parent: &Arc<Node>, _basename: &str, _source: Option<&Arc<Node>>) -> Result<Arc<Node>, Errno> {
        Err(Errno::ENoSys)
    }
}

struct PipeState {
    buf: VecDeque<u8>,
    writers_open: bool,
    readers_open: bool,
}

/// The shared buffer behind one pipe's read and write ends.
struct PipeResource {
    state: SpinLock<PipeState>,
    event: Event,
}

impl Resource for PipeResource {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.buf.is_empty() {
                    let n = state.buf.len().min(buf.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = state.buf.pop_front().unwrap();
                    }
                    drop(state);
                    event_trigger(&self.event, false);
                    return Ok(n);
                }
                if !state.writers_open {
                    return Ok(0);
                }
            }
            event_await(&[&self.event], true);
        }
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        let mut written = 0;
        while written < buf.len() {
            {
                let mut state = self.state.lock();
                if !state.readers_open {
                    return Err(Errno::EPipe);
                }
                let free = CAPACITY - state.buf.len();
                if free > 0 {
                    let n = free.min(buf.len() - written);
                    state.buf.extend(&buf[written..written + n]);
                    written += n;
                    drop(state);
                    event_trigger(&self.event, false);
                    continue;
                }
            }
            event_await(&[&self.event], true);
        }
        Ok(written)
    }

    fn stat(&self) -> Result<Stat, Errno> {
        Ok(Stat::for_mode(0, Mode::empty()))
    }

    fn unref(&self) {
        let mut state = self.state.lock();
        state.writers_open = false;
        state.readers_open = false;
        event_trigger(&self.event, false);
    }
}

/// Creates a connected `(read_node, write_node)` pair over one shared
/// buffer.
#[must_use]
pub fn create() -> (Arc<Node>, Arc<Node>) {
    let resource: Arc<PipeResource> = Arc::new(PipeResource {
        state: SpinLock::new(PipeState { buf: VecDeque::new(), writers_open: true, readers_open: true }),
        event: Event::new(),
    });
    let fs: Arc<dyn FileSystem> = Arc::new(PipeFs);
    let read_node = Node::new(String::from("pipe:r"), NodeKind::Regular, None, fs.clone(), resource.clone());
    let write_node = Node::new(String::from("pipe:w"), NodeKind::Regular, None, fs, resource);
    (read_node, write_node)
}
