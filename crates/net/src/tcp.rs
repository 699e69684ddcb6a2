//! TCP: the full RFC 793 state machine, one [`TcpSocket`] per
//! `{local, lport, remote, rport}` tuple, server sockets using
//! [`Ipv4Addr::ANY`]/`0` for the remote fields.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use kcore::sync::SpinLock;
use ksched::event::{event_await, event_trigger, Event};
use ksched::timer::TIMERS;

use crate::adapter::Adapter;
use crate::checksum::pseudo_header_checksum;
use crate::ipv4::{Ipv4Packet, PROTO_TCP};
use crate::socket::{is_nonblocking, MsgFlags, PollFlags, Socket, SocketFlags};
use crate::types::Ipv4Addr;

const FIN: u8 = 0x01;
const SYN: u8 = 0x02;
const RST: u8 = 0x04;
const PSH: u8 = 0x08;
const ACK: u8 = 0x10;

const HEADER_LEN: usize = 20;
const RCVBUF_SIZE: usize = 65536;
const DEFAULT_MSS: u16 = 536;

const OPT_KIND_MSS: u8 = 2;
const OPT_KIND_TIMESTAMPS: u8 = 8;

const INITIAL_RTO_MS: u64 = 200;
const RETRANSMIT_GIVEUP_MS: u64 = 5_000;
const TIME_WAIT_MS: u64 = 12_000;

/// TCP connection states per RFC 793.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    /// No connection state at all.
    Closed,
    /// Passive open, awaiting a connection request.
    Listen,
    /// Active open sent, awaiting matching connection request.
    SynSent,
    /// Connection request received and acknowledged, awaiting confirmation.
    SynReceived,
    /// Open connection, data may flow in both directions.
    Established,
    /// Waiting for a connection termination request, or an acknowledgment
    /// of one previously sent.
    FinWait1,
    /// Waiting for a connection termination request from the remote.
    FinWait2,
    /// Waiting for a connection termination request from the local user.
    CloseWait,
    /// Waiting for an acknowledgment of the connection termination request
    /// previously sent.
    Closing,
    /// Waiting for an acknowledgment of the connection termination request
    /// previously sent to the remote (which is CLOSE_WAIT-shaped locally).
    LastAck,
    /// Waiting for enough time to pass to be sure the remote received the
    /// acknowledgment of its connection termination request.
    TimeWait,
}

/// Derived event-state surfaced to `read`/`recvmsg`, distinguishing a
/// normal data-bearing close from a reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventState {
    /// Ordinary operation, or a clean close with data still to drain.
    Data,
    /// The connection was reset; further reads report `ECONNRESET`.
    Reset,
    /// The connection is fully closed.
    Closed,
}

struct RetransmitEntry {
    first_ms: u64,
    last_ms: u64,
    rto_ms: u64,
    seq: u32,
    flags: u8,
    data: Vec<u8>,
}

struct Tcb {
    state: TcpState,
    eventstate: EventState,

    snd_is: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u32,
    snd_wl1: u32,
    snd_wl2: u32,

    rcv_is: u32,
    rcv_nxt: u32,
    rcv_wnd: u32,

    maxseg: u16,
    ts_negotiated: bool,

    retransmit_queue: VecDeque<RetransmitEntry>,
    rcvbuf: VecDeque<u8>,

    poll: PollFlags,
    parent: Option<Arc<TcpSocket>>,
    backlog: VecDeque<Arc<TcpSocket>>,
    backlog_cap: usize,

    time_wait_since_ms: Option<u64>,
    fin_acked: bool,

    flags: SocketFlags,
}

/// One TCP connection (or, for a `LISTEN` socket, one listener awaiting
/// connections).
pub struct TcpSocket {
    adapter: Arc<Adapter>,
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    inner: SpinLock<Tcb>,
    /// Fires on state transitions, data arrival, and backlog completion.
    pub event: Event,
}

static TABLE: SpinLock<Vec<Arc<TcpSocket>>> = SpinLock::new(Vec::new());

fn register(socket: Arc<TcpSocket>) {
    TABLE.lock().push(socket);
}

fn unregister(socket: &Arc<TcpSocket>) {
    let mut table = TABLE.lock();
    if let Some(idx) = table.iter().position(|s| Arc::ptr_eq(s, socket)) {
        table.swap_remove(idx);
    }
}

/// Three-pass lookup: exact tuple; local-exact/remote-`ANY` (bound
/// listener); both-`ANY` (any-interface listener).
fn find_for_segment(local_ip: Ipv4Addr, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16) -> Option<Arc<TcpSocket>> {
    let table = TABLE.lock();
    table
        .iter()
        .find(|s| s.local_ip == local_ip && s.local_port == local_port && s.remote_ip == remote_ip && s.remote_port == remote_port)
        .or_else(|| {
            table
                .iter()
                .find(|s| s.local_ip == local_ip && s.local_port == local_port && s.remote_ip == Ipv4Addr::ANY && s.remote_port == 0)
        })
        .or_else(|| {
            table
                .iter()
                .find(|s| s.local_ip == Ipv4Addr::ANY && s.local_port == local_port && s.remote_ip == Ipv4Addr::ANY && s.remote_port == 0)
        })
        .cloned()
}

fn random_iss() -> u32 {
    TIMERS.monotonic_ms().wrapping_mul(0x9E37_79B9) as u32
}

fn effective_mss(adapter: &Adapter) -> u16 {
    let _ = adapter;
    DEFAULT_MSS
}

struct TcpSegment<'a> {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    mss: Option<u16>,
    timestamps: bool,
    payload: &'a [u8],
}

fn parse_segment(data: &[u8]) -> Option<TcpSegment<'_>> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ack = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let data_offset = ((data[12] >> 4) as usize) * 4;
    let flags = data[13];
    let window = u16::from_be_bytes([data[14], data[15]]);
    if data_offset < HEADER_LEN || data_offset > data.len() {
        return None;
    }

    let mut mss = None;
    let mut timestamps = false;
    let mut opt = &data[HEADER_LEN..data_offset];
    while !opt.is_empty() {
        match opt[0] {
            0 => break,
            1 => opt = &opt[1..],
            OPT_KIND_MSS if opt.len() >= 4 => {
                mss = Some(u16::from_be_bytes([opt[2], opt[3]]));
                opt = &opt[opt[1] as usize..];
            }
            OPT_KIND_TIMESTAMPS if opt.len() >= 2 => {
                timestamps = true;
                opt = &opt[opt[1] as usize..];
            }
            _ if opt.len() >= 2 && opt[1] > 0 => opt = &opt[opt[1] as usize..],
            _ => break,
        }
    }

    Some(TcpSegment {
        src_port,
        dst_port,
        seq,
        ack,
        flags,
        window,
        mss,
        timestamps,
        payload: &data[data_offset..],
    })
}

#[allow(clippy::too_many_arguments)]
fn send_segment(adapter: &Arc<Adapter>, local_ip: Ipv4Addr, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16, seq: u32, ack: u32, flags: u8, window: u16, include_mss: Option<u16>, include_ts: bool, data: &[u8]) {
    let mut options = Vec::new();
    if let Some(mss) = include_mss {
        options.push(OPT_KIND_MSS);
        options.push(4);
        options.extend_from_slice(&mss.to_be_bytes());
    }
    if include_ts {
        options.push(OPT_KIND_TIMESTAMPS);
        options.push(10);
        options.extend_from_slice(&(TIMERS.monotonic_ms() as u32).to_be_bytes());
        options.extend_from_slice(&0u32.to_be_bytes());
    }
    while options.len() % 4 != 0 {
        options.push(1);
    }

    let header_len = HEADER_LEN + options.len();
    let mut segment = alloc::vec![0u8; header_len + data.len()];
    segment[0..2].copy_from_slice(&local_port.to_be_bytes());
    segment[2..4].copy_from_slice(&remote_port.to_be_bytes());
    segment[4..8].copy_from_slice(&seq.to_be_bytes());
    segment[8..12].copy_from_slice(&ack.to_be_bytes());
    segment[12] = ((header_len / 4) as u8) << 4;
    segment[13] = flags;
    segment[14..16].copy_from_slice(&window.to_be_bytes());
    segment[20..header_len].copy_from_slice(&options);
    segment[header_len..].copy_from_slice(data);

    let csum = pseudo_header_checksum(local_ip, remote_ip, PROTO_TCP, &segment);
    segment[16..18].copy_from_slice(&csum.to_be_bytes());

    let _ = crate::ipv4::send_inet(adapter, local_ip, remote_ip, PROTO_TCP, &segment);
}

fn is_seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

fn is_seq_gte(a: u32, b: u32) -> bool {
    a == b || is_seq_gt(a, b)
}

/// The RFC 793 inclusive-window acceptability test.
fn acceptable(seg_seq: u32, seg_len: u32, rcv_nxt: u32, rcv_wnd: u32) -> bool {
    if seg_len == 0 && rcv_wnd == 0 {
        return seg_seq == rcv_nxt;
    }
    if rcv_wnd == 0 {
        return false;
    }
    let in_window = |s: u32| is_seq_gte(s, rcv_nxt) && is_seq_gt(rcv_nxt.wrapping_add(rcv_wnd), s);
    if seg_len == 0 {
        return in_window(seg_seq);
    }
    in_window(seg_seq) || in_window(seg_seq.wrapping_add(seg_len - 1))
}

impl TcpSocket {
    fn new(adapter: Arc<Adapter>, local_ip: Ipv4Addr, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16, state: TcpState) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            inner: SpinLock::new(Tcb {
                state,
                eventstate: EventState::Data,
                snd_is: 0,
                snd_una: 0,
                snd_nxt: 0,
                snd_wnd: 0,
                snd_wl1: 0,
                snd_wl2: 0,
                rcv_is: 0,
                rcv_nxt: 0,
                rcv_wnd: RCVBUF_SIZE as u32,
                maxseg: DEFAULT_MSS,
                ts_negotiated: false,
                retransmit_queue: VecDeque::new(),
                rcvbuf: VecDeque::new(),
                poll: PollFlags::empty(),
                parent: None,
                backlog: VecDeque::new(),
                backlog_cap: 0,
                time_wait_since_ms: None,
                fin_acked: false,
                flags: SocketFlags::empty(),
            }),
            event: Event::new(),
        })
    }

    /// Passive open: a `LISTEN` socket bound to `local_port` (optionally a
    /// specific `local_ip`), accepting up to `backlog` pending connections
    /// (clamped to at least 1).
    pub fn listen(adapter: Arc<Adapter>, local_ip: Ipv4Addr, local_port: u16, backlog: usize) -> Arc<Self> {
        let socket = Self::new(adapter, local_ip, local_port, Ipv4Addr::ANY, 0, TcpState::Listen);
        socket.inner.lock().backlog_cap = backlog.max(1);
        register(socket.clone());
        socket
    }

    /// Active open: connects to `remote_ip:remote_port`, blocking until the
    /// handshake completes or `ETIMEDOUT`/`ECONNREFUSED`.
    pub fn connect(adapter: Arc<Adapter>, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16) -> Result<Arc<Self>, Errno> {
        let local_ip = adapter.config().ip;
        let socket = Self::new(adapter.clone(), local_ip, local_port, remote_ip, remote_port, TcpState::SynSent);
        let iss = random_iss();
        {
            let mut tcb = socket.inner.lock();
            tcb.snd_is = iss;
            tcb.snd_una = iss;
            tcb.snd_nxt = iss.wrapping_add(1);
        }
        register(socket.clone());
        send_segment(&adapter, local_ip, local_port, remote_ip, remote_port, iss, 0, SYN, RCVBUF_SIZE as u16, Some(effective_mss(&adapter)), false, &[]);

        loop {
            event_await(&[&socket.event], true);
            let tcb = socket.inner.lock();
            match tcb.state {
                TcpState::Established => return Ok(socket.clone()),
                TcpState::Closed => return Err(Errno::EConnRefused),
                _ => {}
            }
        }
    }

    /// Blocks until a connection completes the handshake and is ready to be
    /// handed to the caller; returns the accepted socket.
    pub fn accept(self: &Arc<Self>) -> Result<Arc<Self>, Errno> {
        loop {
            {
                let mut tcb = self.inner.lock();
                if tcb.state != TcpState::Listen {
                    return Err(Errno::EInval);
                }
                if let Some(child) = tcb.backlog.pop_front() {
                    return Ok(child);
                }
            }
            event_await(&[&self.event], true);
        }
    }

    /// The bound local `(address, port)`.
    #[must_use]
    pub fn local_addr(&self) -> (Ipv4Addr, u16) {
        (self.local_ip, self.local_port)
    }

    /// The remote `(address, port)`, `ANY:0` for an unconnected listener.
    #[must_use]
    pub fn remote_addr(&self) -> (Ipv4Addr, u16) {
        (self.remote_ip, self.remote_port)
    }

    /// Current poll readiness.
    #[must_use]
    pub fn poll(&self) -> PollFlags {
        self.inner.lock().poll
    }

    /// `TCP_MAXSEG`: reads the negotiated MSS.
    #[must_use]
    pub fn maxseg(&self) -> u16 {
        self.inner.lock().maxseg
    }

    /// `TCP_MAXSEG`: overrides the MSS used for future sends.
    pub fn set_maxseg(&self, mss: u16) {
        self.inner.lock().maxseg = mss;
    }

    /// Sets `O_NONBLOCK` on this socket's description.
    pub fn set_nonblocking(&self, enabled: bool) {
        self.inner.lock().flags.set(SocketFlags::NONBLOCK, enabled);
    }

    /// Walks `data` in MSS-sized chunks, blocking on the send window; each
    /// chunk is sent with `PSH|ACK` and queued for retransmission.
    pub fn sendmsg(self: &Arc<Self>, data: &[u8], msg_flags: MsgFlags) -> Result<usize, Errno> {
        let mut offset = 0;
        while offset < data.len() {
            let (mss, snd_nxt, snd_una, snd_wnd, can_send, nonblocking) = {
                let tcb = self.inner.lock();
                if !matches!(tcb.state, TcpState::Established | TcpState::CloseWait) {
                    return Err(Errno::ENotConn);
                }
                let in_flight = tcb.snd_nxt.wrapping_sub(tcb.snd_una);
                let window = tcb.snd_wnd.saturating_sub(in_flight);
                (tcb.maxseg, tcb.snd_nxt, tcb.snd_una, tcb.snd_wnd, window > 0, is_nonblocking(tcb.flags, msg_flags))
            };
            let _ = (snd_una, snd_wnd);
            if !can_send {
                if offset > 0 {
                    return Ok(offset);
                }
                if nonblocking {
                    return Err(Errno::EAgain);
                }
                event_await(&[&self.event], true);
                continue;
            }

            let chunk_len = (data.len() - offset).min(mss as usize);
            let chunk = &data[offset..offset + chunk_len];

            let mut tcb = self.inner.lock();
            tcb.retransmit_queue.push_back(RetransmitEntry {
                first_ms: TIMERS.monotonic_ms(),
                last_ms: TIMERS.monotonic_ms(),
                rto_ms: INITIAL_RTO_MS,
                seq: snd_nxt,
                flags: PSH | ACK,
                data: chunk.to_vec(),
            });
            let rcv_nxt = tcb.rcv_nxt;
            let rcv_wnd = tcb.rcv_wnd as u16;
            tcb.snd_nxt = tcb.snd_nxt.wrapping_add(chunk_len as u32);
            drop(tcb);

            send_segment(&self.adapter, self.local_ip, self.local_port, self.remote_ip, self.remote_port, snd_nxt, rcv_nxt, PSH | ACK, rcv_wnd, None, false, chunk);
            offset += chunk_len;
        }
        Ok(data.len())
    }

    /// Drains up to `buf.len()` bytes from the receive buffer, blocking per
    /// spec's per-state semantics when empty.
    pub fn recvmsg(&self, buf: &mut [u8], msg_flags: MsgFlags) -> Result<usize, Errno> {
        loop {
            let mut tcb = self.inner.lock();
            if !tcb.rcvbuf.is_empty() {
                let n = buf.len().min(tcb.rcvbuf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = tcb.rcvbuf.pop_front().unwrap();
                }
                tcb.rcv_wnd += n as u32;
                return Ok(n);
            }
            if tcb.eventstate == EventState::Reset {
                return Err(Errno::EConnReset);
            }
            match tcb.state {
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
                    if is_nonblocking(tcb.flags, msg_flags) {
                        return Err(Errno::EAgain);
                    }
                    drop(tcb);
                    event_await(&[&self.event], true);
                }
                TcpState::CloseWait | TcpState::LastAck | TcpState::Closing | TcpState::TimeWait => return Ok(0),
                TcpState::Closed => return Err(Errno::ENotConn),
                _ => return Err(Errno::ENoBufs),
            }
        }
    }

    /// Initiates (or completes) the close sequence for this socket's
    /// current state.
    pub fn close(self: &Arc<Self>) {
        let mut tcb = self.inner.lock();
        match tcb.state {
            TcpState::Listen | TcpState::SynSent => {
                tcb.state = TcpState::Closed;
            }
            TcpState::SynReceived | TcpState::Established => {
                let (seq, ack) = (tcb.snd_nxt, tcb.rcv_nxt);
                let wnd = tcb.rcv_wnd as u16;
                tcb.state = TcpState::FinWait1;
                tcb.snd_nxt = tcb.snd_nxt.wrapping_add(1);
                tcb.retransmit_queue.push_back(RetransmitEntry {
                    first_ms: TIMERS.monotonic_ms(),
                    last_ms: TIMERS.monotonic_ms(),
                    rto_ms: INITIAL_RTO_MS,
                    seq,
                    flags: FIN | ACK,
                    data: Vec::new(),
                });
                drop(tcb);
                send_segment(&self.adapter, self.local_ip, self.local_port, self.remote_ip, self.remote_port, seq, ack, FIN | ACK, wnd, None, false, &[]);
                return;
            }
            TcpState::CloseWait => {
                let (seq, ack) = (tcb.snd_nxt, tcb.rcv_nxt);
                let wnd = tcb.rcv_wnd as u16;
                tcb.state = TcpState::LastAck;
                tcb.snd_nxt = tcb.snd_nxt.wrapping_add(1);
                tcb.retransmit_queue.push_back(RetransmitEntry {
                    first_ms: TIMERS.monotonic_ms(),
                    last_ms: TIMERS.monotonic_ms(),
                    rto_ms: INITIAL_RTO_MS,
                    seq,
                    flags: FIN | ACK,
                    data: Vec::new(),
                });
                drop(tcb);
                send_segment(&self.adapter, self.local_ip, self.local_port, self.remote_ip, self.remote_port, seq, ack, FIN | ACK, wnd, None, false, &[]);
                return;
            }
            _ => {}
        }
        let reached_closed = tcb.state == TcpState::Closed;
        drop(tcb);
        if reached_closed {
            self.finalize_closed();
        }
    }

    fn finalize_closed(self: &Arc<Self>) {
        unregister(self);
        if (self.local_ip, self.local_port) != (Ipv4Addr::ANY, 0) {
            crate::port::release(self.local_port);
        }
    }
}

impl Socket for TcpSocket {
    fn poll(&self) -> PollFlags {
        TcpSocket::poll(self)
    }
}

/// Looks up a socket by its segment-determined tuple and replies per RFC
/// 793 §3.10.7 on no match; on a hit, runs the full RFC 793 §3.10 state
/// table against the segment.
pub fn tcp_on_tcp(adapter: &Arc<Adapter>, pkt: &Ipv4Packet<'_>) {
    let Some(seg) = parse_segment(pkt.payload) else {
        return;
    };
    let csum = pseudo_header_checksum(pkt.src, pkt.dst, PROTO_TCP, pkt.payload);
    if csum != 0 {
        return;
    }

    match find_for_segment(pkt.dst, seg.dst_port, pkt.src, seg.src_port) {
        Some(socket) => process_segment(adapter, &socket, pkt.src, &seg),
        None => reply_no_match(adapter, pkt, &seg),
    }
}

fn reply_no_match(adapter: &Arc<Adapter>, pkt: &Ipv4Packet<'_>, seg: &TcpSegment<'_>) {
    if seg.flags & RST != 0 {
        return;
    }
    if seg.flags & ACK == 0 {
        let ack = seg
            .seq
            .wrapping_add(seg.payload.len() as u32)
            .wrapping_add(u32::from(seg.flags & SYN != 0))
            .wrapping_add(u32::from(seg.flags & FIN != 0));
        send_segment(adapter, pkt.dst, seg.dst_port, pkt.src, seg.src_port, 0, ack, RST | ACK, 0, None, false, &[]);
    } else {
        send_segment(adapter, pkt.dst, seg.dst_port, pkt.src, seg.src_port, seg.ack, 0, RST, 0, None, false, &[]);
    }
}

fn process_segment(adapter: &Arc<Adapter>, socket: &Arc<TcpSocket>, remote_ip: Ipv4Addr, seg: &TcpSegment<'_>) {
    let mut tcb = socket.inner.lock();

    if seg.flags & RST != 0 {
        if !matches!(tcb.state, TcpState::Listen | TcpState::SynSent) {
            tcb.state = TcpState::Closed;
            tcb.eventstate = EventState::Reset;
            event_trigger(&socket.event, false);
        }
        return;
    }

    match tcb.state {
        TcpState::Listen => {
            if seg.flags & SYN == 0 {
                return;
            }
            if tcb.backlog.len() >= tcb.backlog_cap.max(1) {
                return;
            }
            let iss = random_iss();
            let child = TcpSocket::new(adapter.clone(), socket.local_ip, socket.local_port, remote_ip, seg.src_port, TcpState::SynReceived);
            {
                let mut child_tcb = child.inner.lock();
                child_tcb.snd_is = iss;
                child_tcb.snd_una = iss;
                child_tcb.snd_nxt = iss.wrapping_add(1);
                child_tcb.rcv_is = seg.seq;
                child_tcb.rcv_nxt = seg.seq.wrapping_add(1);
                child_tcb.snd_wnd = seg.window as u32;
                child_tcb.maxseg = seg.mss.unwrap_or(DEFAULT_MSS);
                child_tcb.ts_negotiated = seg.timestamps;
                child_tcb.parent = Some(socket.clone());
            }
            register(child.clone());
            send_segment(adapter, socket.local_ip, socket.local_port, remote_ip, seg.src_port, iss, seg.seq.wrapping_add(1), SYN | ACK, RCVBUF_SIZE as u16, Some(effective_mss(adapter)), seg.timestamps, &[]);
        }

        TcpState::SynSent => {
            if seg.flags & SYN != 0 && seg.flags & ACK != 0 && seg.ack == tcb.snd_nxt {
                tcb.rcv_is = seg.seq;
                tcb.rcv_nxt = seg.seq.wrapping_add(1);
                tcb.snd_una = seg.ack;
                tcb.snd_wnd = seg.window as u32;
                tcb.snd_wl1 = seg.seq;
                tcb.snd_wl2 = seg.ack;
                tcb.maxseg = seg.mss.unwrap_or(DEFAULT_MSS);
                tcb.ts_negotiated = seg.timestamps;
                tcb.state = TcpState::Established;
                tcb.poll |= PollFlags::POLLOUT;
                let wnd = tcb.rcv_wnd as u16;
                drop(tcb);
                send_segment(adapter, socket.local_ip, socket.local_port, remote_ip, seg.src_port, seg.ack, socket.inner.lock().rcv_nxt, ACK, wnd, None, false, &[]);
                event_trigger(&socket.event, false);
            }
        }

        TcpState::SynReceived => {
            if seg.flags & ACK != 0 && acceptable(seg.seq, seg.payload.len() as u32, tcb.rcv_nxt, tcb.rcv_wnd) && seg.ack == tcb.snd_nxt {
                tcb.snd_una = seg.ack;
                tcb.state = TcpState::Established;
                tcb.poll |= PollFlags::POLLOUT;
                if let Some(parent) = tcb.parent.clone() {
                    drop(tcb);
                    let mut parent_tcb = parent.inner.lock();
                    parent_tcb.backlog.push_back(socket.clone());
                    drop(parent_tcb);
                    event_trigger(&parent.event, false);
                    return;
                }
            }
        }

        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
            if seg.flags & ACK != 0 && is_seq_gt(seg.ack, tcb.snd_una) {
                tcb.retransmit_queue.retain(|e| is_seq_gt(e.seq.wrapping_add(e.data.len() as u32), seg.ack));
                tcb.snd_una = seg.ack;
                if is_seq_gt(seg.seq, tcb.snd_wl1) || (seg.seq == tcb.snd_wl1 && is_seq_gte(seg.ack, tcb.snd_wl2)) {
                    tcb.snd_wnd = seg.window as u32;
                    tcb.snd_wl1 = seg.seq;
                    tcb.snd_wl2 = seg.ack;
                }
            }

            if !seg.payload.is_empty() && acceptable(seg.seq, seg.payload.len() as u32, tcb.rcv_nxt, tcb.rcv_wnd) && seg.seq == tcb.rcv_nxt {
                let take = seg.payload.len().min(RCVBUF_SIZE.saturating_sub(tcb.rcvbuf.len()));
                tcb.rcvbuf.extend(seg.payload[..take].iter().copied());
                tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(take as u32);
                tcb.rcv_wnd = tcb.rcv_wnd.saturating_sub(take as u32);
                tcb.poll |= PollFlags::POLLIN;
                let (seq, ack, wnd) = (tcb.snd_nxt, tcb.rcv_nxt, tcb.rcv_wnd as u16);
                drop(tcb);
                send_segment(adapter, socket.local_ip, socket.local_port, remote_ip, seg.src_port, seq, ack, ACK, wnd, None, false, &[]);
                event_trigger(&socket.event, false);
                return;
            }

            if seg.flags & FIN != 0 {
                tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
                tcb.state = match tcb.state {
                    TcpState::Established => TcpState::CloseWait,
                    TcpState::FinWait1 if seg.ack == tcb.snd_nxt => TcpState::TimeWait,
                    TcpState::FinWait1 => TcpState::Closing,
                    TcpState::FinWait2 => TcpState::TimeWait,
                    other => other,
                };
                if tcb.state == TcpState::TimeWait {
                    tcb.time_wait_since_ms = Some(TIMERS.monotonic_ms());
                }
                let (seq, ack, wnd) = (tcb.snd_nxt, tcb.rcv_nxt, tcb.rcv_wnd as u16);
                drop(tcb);
                send_segment(adapter, socket.local_ip, socket.local_port, remote_ip, seg.src_port, seq, ack, ACK, wnd, None, false, &[]);
                event_trigger(&socket.event, false);
                return;
            }
        }

        TcpState::CloseWait | TcpState::Closing | TcpState::LastAck => {
            if seg.flags & ACK != 0 && is_seq_gt(seg.ack, tcb.snd_una) {
                tcb.snd_una = seg.ack;
                if tcb.state == TcpState::LastAck && seg.ack == tcb.snd_nxt {
                    tcb.state = TcpState::Closed;
                }
                if tcb.state == TcpState::Closing && seg.ack == tcb.snd_nxt {
                    tcb.state = TcpState::TimeWait;
                    tcb.time_wait_since_ms = Some(TIMERS.monotonic_ms());
                }
            }
        }

        TcpState::TimeWait | TcpState::Closed => {}
    }

    let reached_closed = tcb.state == TcpState::Closed;
    drop(tcb);
    if reached_closed {
        socket.finalize_closed();
    }
}

/// Runs one pass of the global retransmission/TIME_WAIT timer: resends due
/// segments doubling their RTO, gives up (forcing `CLOSED`) after 5s, and
/// reaps sockets that have spent 12s in `TIME_WAIT`. Intended to be called
/// every 100ms by a dedicated kernel thread.
pub fn retransmission_tick() {
    let now = TIMERS.monotonic_ms();
    let sockets = TABLE.lock().clone();
    for socket in sockets {
        let mut tcb = socket.inner.lock();

        if let Some(since) = tcb.time_wait_since_ms {
            if now.saturating_sub(since) >= TIME_WAIT_MS {
                tcb.state = TcpState::Closed;
                drop(tcb);
                socket.finalize_closed();
                continue;
            }
        }

        let mut gave_up = false;
        for entry in tcb.retransmit_queue.iter_mut() {
            if now.saturating_sub(entry.first_ms) >= RETRANSMIT_GIVEUP_MS {
                gave_up = true;
                break;
            }
            if now.saturating_sub(entry.last_ms) >= entry.rto_ms {
                send_segment(&socket.adapter, socket.local_ip, socket.local_port, socket.remote_ip, socket.remote_port, entry.seq, tcb.rcv_nxt, entry.flags, tcb.rcv_wnd as u16, None, false, &entry.data);
                entry.last_ms = now;
                entry.rto_ms *= 2;
            }
        }

        if gave_up {
            tcb.state = TcpState::Closed;
            tcb.eventstate = EventState::Reset;
            drop(tcb);
            event_trigger(&socket.event, false);
            socket.finalize_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptability_zero_window_zero_length() {
        assert!(acceptable(100, 0, 100, 0));
        assert!(!acceptable(101, 0, 100, 0));
    }

    #[test]
    fn acceptability_inside_window() {
        assert!(acceptable(100, 10, 100, 100));
        assert!(!acceptable(300, 10, 100, 100));
    }

    #[test]
    fn seq_comparison_wraps() {
        assert!(is_seq_gt(5, u32::MAX - 1));
        assert!(!is_seq_gt(u32::MAX - 1, 5));
    }

    #[test]
    fn listen_honors_requested_backlog() {
        let adapter = crate::adapter::register_loopback();
        let socket = TcpSocket::listen(adapter, Ipv4Addr::ANY, 0, 4);
        assert_eq!(socket.inner.lock().backlog_cap, 4);
    }

    #[test]
    fn listen_clamps_zero_backlog_to_one() {
        let adapter = crate::adapter::register_loopback();
        let socket = TcpSocket::listen(adapter, Ipv4Addr::ANY, 0, 0);
        assert_eq!(socket.inner.lock().backlog_cap, 1);
    }

    #[test]
    fn maxseg_accessors_round_trip() {
        let adapter = crate::adapter::register_loopback();
        let socket = TcpSocket::listen(adapter, Ipv4Addr::ANY, 0, 1);
        socket.set_maxseg(536);
        assert_eq!(socket.maxseg(), 536);
    }
}
