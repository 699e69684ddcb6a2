//! UNIX-domain sockets: connected stream pairs over an in-kernel ring
//! buffer, sharing the [`Socket`] trait with the inet transports.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use kcore::sync::SpinLock;
use ksched::event::{event_await, event_trigger, Event};

use crate::socket::{is_nonblocking, MsgFlags, PollFlags, Socket, SocketFlags};

const BUFFER_CAPACITY: usize = 0x4000;

struct RingBuffer {
    data: VecDeque<u8>,
}

impl RingBuffer {
    fn new() -> Self {
        Self { data: VecDeque::with_capacity(BUFFER_CAPACITY) }
    }

    fn free_space(&self) -> usize {
        BUFFER_CAPACITY - self.data.len()
    }
}

enum Role {
    /// A `LISTEN` socket bound to a path, accumulating a connect backlog.
    Listener { path: String, backlog: VecDeque<Arc<UnixSocket>> },
    /// A connected endpoint with a live peer.
    Connected { peer: Arc<UnixSocket> },
    /// Freshly created, neither bound nor connected.
    Unbound,
}

struct State {
    role: Role,
    recvbuf: RingBuffer,
    flags: SocketFlags,
    poll: PollFlags,
}

/// One endpoint of a UNIX-domain stream socket.
pub struct UnixSocket {
    state: SpinLock<State>,
    /// Fires on data arrival, peer backpressure relief, and connect
    /// completion.
    pub event: Event,
    /// Fires once when a pending `connect` is accepted.
    pub connect_event: Event,
}

static LISTENERS: SpinLock<Vec<(String, Arc<UnixSocket>)>> = SpinLock::new(Vec::new());

impl UnixSocket {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: SpinLock::new(State {
                role: Role::Unbound,
                recvbuf: RingBuffer::new(),
                flags: SocketFlags::empty(),
                poll: PollFlags::POLLOUT,
            }),
            event: Event::new(),
            connect_event: Event::new(),
        })
    }

    /// Creates an unbound socket.
    #[must_use]
    pub fn create() -> Arc<Self> {
        Self::new()
    }

    /// Creates two sockets already connected to each other, with no bound
    /// path — backs `socketpair(2)`, where `bind_listen`/`connect`'s
    /// blocking handshake has no second caller to complete it.
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Self::new();
        let b = Self::new();
        a.state.lock().role = Role::Connected { peer: b.clone() };
        b.state.lock().role = Role::Connected { peer: a.clone() };
        a.state.lock().poll |= PollFlags::POLLOUT;
        b.state.lock().poll |= PollFlags::POLLOUT;
        (a, b)
    }

    /// Binds this socket to `path` as a listener.
    pub fn bind_listen(self: &Arc<Self>, path: &str) -> Result<(), Errno> {
        let mut listeners = LISTENERS.lock();
        if listeners.iter().any(|(p, _)| p == path) {
            return Err(Errno::EExist);
        }
        self.state.lock().role = Role::Listener {
            path: String::from(path),
            backlog: VecDeque::new(),
        };
        listeners.push((String::from(path), self.clone()));
        Ok(())
    }

    /// Sets `O_NONBLOCK` on this socket's description.
    pub fn set_nonblocking(&self, enabled: bool) {
        self.state.lock().flags.set(SocketFlags::NONBLOCK, enabled);
    }

    /// Connects to the listener bound at `path`, blocking until accepted.
    pub fn connect(self: &Arc<Self>, path: &str) -> Result<(), Errno> {
        let listener = LISTENERS
            .lock()
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, s)| s.clone())
            .ok_or(Errno::EConnRefused)?;

        {
            let mut listener_state = listener.state.lock();
            let Role::Listener { backlog, .. } = &mut listener_state.role else {
                return Err(Errno::EConnRefused);
            };
            backlog.push_back(self.clone());
            listener_state.poll |= PollFlags::POLLIN;
        }
        event_trigger(&listener.event, false);

        event_await(&[&self.connect_event], true);

        let mut state = self.state.lock();
        state.poll |= PollFlags::POLLOUT;
        Ok(())
    }

    /// Accepts one pending connection from this listener's backlog, blocking
    /// if empty.
    pub fn accept(self: &Arc<Self>) -> Result<Arc<Self>, Errno> {
        loop {
            {
                let mut state = self.state.lock();
                let Role::Listener { backlog, .. } = &mut state.role else {
                    return Err(Errno::EInval);
                };
                if let Some(pending) = backlog.pop_front() {
                    let accepted = Self::new();
                    accepted.state.lock().role = Role::Connected { peer: pending.clone() };
                    pending.state.lock().role = Role::Connected { peer: accepted.clone() };
                    drop(state);
                    event_trigger(&pending.connect_event, false);
                    return Ok(accepted);
                }
            }
            event_await(&[&self.event], true);
        }
    }

    fn peer(&self) -> Result<Arc<Self>, Errno> {
        match &self.state.lock().role {
            Role::Connected { peer } => Ok(peer.clone()),
            _ => Err(Errno::ENotConn),
        }
    }

    /// Writes `data` into the peer's receive buffer, blocking while it is
    /// full.
    pub fn sendmsg(self: &Arc<Self>, data: &[u8], msg_flags: MsgFlags) -> Result<usize, Errno> {
        let peer = self.peer()?;
        let mut offset = 0;
        while offset < data.len() {
            let nonblocking = is_nonblocking(self.state.lock().flags, msg_flags);
            let mut peer_state = peer.state.lock();
            if peer_state.recvbuf.free_space() == 0 {
                if nonblocking {
                    return Err(Errno::EAgain);
                }
                drop(peer_state);
                event_await(&[&peer.event], true);
                continue;
            }
            let take = (data.len() - offset).min(peer_state.recvbuf.free_space());
            peer_state.recvbuf.data.extend(data[offset..offset + take].iter().copied());
            peer_state.poll |= PollFlags::POLLIN;
            drop(peer_state);
            event_trigger(&peer.event, false);
            offset += take;
        }
        Ok(data.len())
    }

    /// Reads up to `buf.len()` bytes, blocking while empty unless
    /// non-blocking.
    pub fn recvmsg(&self, buf: &mut [u8], msg_flags: MsgFlags) -> Result<usize, Errno> {
        loop {
            let mut state = self.state.lock();
            if !state.recvbuf.data.is_empty() {
                let n = buf.len().min(state.recvbuf.data.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.recvbuf.data.pop_front().unwrap();
                }
                if state.recvbuf.data.is_empty() {
                    state.poll.remove(PollFlags::POLLIN);
                }
                let peer = match &state.role {
                    Role::Connected { peer } => Some(peer.clone()),
                    _ => None,
                };
                drop(state);
                if let Some(peer) = peer {
                    peer.state.lock().poll |= PollFlags::POLLOUT;
                    event_trigger(&peer.event, false);
                }
                return Ok(n);
            }
            if is_nonblocking(state.flags, msg_flags) {
                return Err(Errno::EAgain);
            }
            drop(state);
            event_await(&[&self.event], true);
        }
    }

    /// Current poll readiness.
    #[must_use]
    pub fn poll_flags(&self) -> PollFlags {
        self.state.lock().poll
    }
}

impl Socket for UnixSocket {
    fn poll(&self) -> PollFlags {
        self.poll_flags()
    }
}

impl Drop for UnixSocket {
    fn drop(&mut self) {
        if let Role::Listener { path, .. } = &self.state.lock().role {
            LISTENERS.lock().retain(|(p, _)| p != path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_accept_then_data_round_trips() {
        let listener = UnixSocket::create();
        listener.bind_listen("/tmp/test.sock").unwrap();

        // A real connect() blocks for accept(); exercise the non-blocking
        // backlog/ring-buffer mechanics directly instead.
        let client = UnixSocket::create();
        {
            let mut listener_state = listener.state.lock();
            let Role::Listener { backlog, .. } = &mut listener_state.role else {
                unreachable!()
            };
            backlog.push_back(client.clone());
        }

        let server_side = listener.accept().unwrap();
        server_side.sendmsg(b"hello", MsgFlags::empty()).unwrap();

        let mut buf = [0u8; 16];
        let n = client.recvmsg(&mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn recv_on_empty_nonblocking_returns_eagain() {
        let a = UnixSocket::create();
        let b = UnixSocket::create();
        a.state.lock().role = Role::Connected { peer: b.clone() };
        a.set_nonblocking(true);
        let mut buf = [0u8; 4];
        assert_eq!(a.recvmsg(&mut buf, MsgFlags::empty()), Err(Errno::EAgain));
    }
}
