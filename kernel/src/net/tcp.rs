//! TCP engine.
//!
//! Per-connection state machines keyed by the full 4-tuple, with listening
//! sockets keyed by local port.  Receive reordering is sequence-number
//! driven: out-of-order segments buffer until the gap closes, then drain
//! into a fixed-capacity in-order ring.  Unacknowledged send entries are
//! retransmitted on a fixed timeout; a connection that retransmits past
//! the limit is aborted with RST.
//!
//! All sequence arithmetic is modulo 2^32 (`seq_lt`/`seq_le`); never
//! compare raw sequence numbers.
//!
//! Sockets queue outgoing segments on themselves; the queues are drained
//! to the IP layer outside the table lock so ingress processing can
//! transmit without re-entering the stack.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use super::ipv4::{self, Ipv4Packet, PROTO_TCP};
use super::{Ipv4Addr, NetError, SocketAddr};
use crate::kernel_singleton;

/// TCP header size without options.
pub const HEADER_SIZE: usize = 20;

// TCP flags.
pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;
pub const URG: u8 = 0x20;

/// Maximum segment size (payload only).
const MSS: usize = 1460;
/// In-order receive ring capacity; the advertised window is whatever part
/// of it is free.
const RECV_CAPACITY: usize = 8192;
/// Fixed retransmission timeout (no RTT estimator).
const RTO: u64 = crate::time::ms_to_ticks(1000);
/// Retransmissions past this limit abort the connection.
const MAX_RETRANSMITS: u32 = 10;
/// TimeWait lingers for two RTOs before the slot is reclaimed.
const TIME_WAIT_TIMEOUT: u64 = 2 * RTO;
/// Ephemeral port range.
const EPHEMERAL_MIN: u16 = 1024;
const EPHEMERAL_MAX: u16 = 65535;

// ── Sequence arithmetic ─────────────────────────────────────

/// `a < b` in sequence space (wrapping).
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space (wrapping).
fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// A segment is in-window iff it carries no payload, or its whole span
/// falls inside [rcv_nxt, rcv_nxt + window).
fn in_window(seq: u32, len: usize, rcv_nxt: u32, window: u32) -> bool {
    if len == 0 {
        return true;
    }
    let end = seq.wrapping_add(len as u32);
    seq_le(rcv_nxt, seq) && seq_le(end, rcv_nxt.wrapping_add(window))
}

// ── State machine ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        }
    }
}

// ── Wire format ─────────────────────────────────────────────

/// A parsed TCP segment borrowed from an IP payload.
#[derive(Debug)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }

        let data_offset = ((data[12] >> 4) as usize) * 4;
        if data_offset < HEADER_SIZE || data_offset > data.len() {
            return None;
        }

        Some(TcpSegment {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            payload: &data[data_offset..],
        })
    }
}

/// Build one segment (header + payload) with the pseudo-header checksum
/// filled in.  Pure construction; sequence bookkeeping is the caller's.
fn encode_segment(
    local: SocketAddr,
    remote: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let tcp_len = HEADER_SIZE + payload.len();
    let mut seg = Vec::with_capacity(tcp_len);

    seg.extend_from_slice(&local.port.to_be_bytes());
    seg.extend_from_slice(&remote.port.to_be_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&ack.to_be_bytes());
    seg.push(0x50); // data offset 5, no options
    seg.push(flags);
    seg.extend_from_slice(&window.to_be_bytes());
    seg.extend_from_slice(&[0x00, 0x00]); // checksum placeholder
    seg.extend_from_slice(&[0x00, 0x00]); // urgent pointer
    seg.extend_from_slice(payload);

    let pseudo = ipv4::pseudo_header_checksum(local.ip, remote.ip, PROTO_TCP, tcp_len as u16);
    let cksum = tcp_checksum(&seg, pseudo);
    seg[16] = (cksum >> 8) as u8;
    seg[17] = cksum as u8;

    seg
}

/// One's-complement sum over the segment, seeded with the pseudo-header
/// contribution, with the final carry fold.
fn tcp_checksum(data: &[u8], pseudo: u32) -> u16 {
    let mut sum = pseudo;
    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

// ── Connection ──────────────────────────────────────────────

/// Socket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SocketId(pub u64);

/// Connection 4-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ConnKey {
    local: SocketAddr,
    remote: SocketAddr,
}

/// Sent-but-possibly-unacknowledged byte range.
struct SendEntry {
    seq_start: u32,
    seq_end: u32,
    data: Vec<u8>,
    /// First-transmit (or last-retransmit) time.
    timestamp: u64,
    acknowledged: bool,
}

/// Out-of-order arrival awaiting its gap.
struct RecvEntry {
    seq_start: u32,
    seq_end: u32,
    data: Vec<u8>,
    consumed: bool,
}

struct SegmentOutcome {
    /// The segment moved this connection into Established.
    established: bool,
}

/// A single TCP connection (or listener).
pub struct TcpSocket {
    state: TcpState,
    local: SocketAddr,
    remote: SocketAddr,

    /// Initial send sequence number.
    iss: u32,
    /// Next sequence number to send.
    snd_nxt: u32,
    /// Oldest unacknowledged sequence number.
    snd_una: u32,
    /// Peer's advertised window.
    snd_wnd: u32,
    /// Peer's initial sequence number.
    irs: u32,
    /// Next expected receive sequence number.
    rcv_nxt: u32,

    mss: usize,
    send_buffers: Vec<SendEntry>,
    receive_buffers: Vec<RecvEntry>,
    /// In-order byte stream awaiting the application.
    ring: VecDeque<u8>,

    /// Outgoing segments awaiting the flush pass.
    tx_queue: VecDeque<Vec<u8>>,
    /// Established children awaiting accept() (listeners only).
    accept_queue: VecDeque<SocketId>,
    backlog: usize,
    /// For passive children: the listener port to notify on establish.
    listener_port: Option<u16>,

    last_activity: u64,
    retransmit_count: u32,
    time_wait_since: u64,
}

static ISN_SALT: AtomicU32 = AtomicU32::new(0);

/// Initial sequence numbers derive from the monotonic clock, salted so
/// sockets created in the same cycle do not collide.
fn generate_isn() -> u32 {
    let salt = ISN_SALT.fetch_add(0x6_4000, Ordering::Relaxed);
    (crate::time::now() as u32).wrapping_add(salt)
}

impl TcpSocket {
    fn new(now: u64) -> TcpSocket {
        TcpSocket {
            state: TcpState::Closed,
            local: SocketAddr::new(Ipv4Addr::ANY, 0),
            remote: SocketAddr::new(Ipv4Addr::ANY, 0),
            iss: 0,
            snd_nxt: 0,
            snd_una: 0,
            snd_wnd: 65535,
            irs: 0,
            rcv_nxt: 0,
            mss: MSS,
            send_buffers: Vec::new(),
            receive_buffers: Vec::new(),
            ring: VecDeque::new(),
            tx_queue: VecDeque::new(),
            accept_queue: VecDeque::new(),
            backlog: 0,
            listener_port: None,
            last_activity: now,
            retransmit_count: 0,
            time_wait_since: 0,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Bytes the peer may send beyond `rcv_nxt`.
    fn recv_window(&self) -> u32 {
        (RECV_CAPACITY - self.ring.len()) as u32
    }

    fn advertised_window(&self) -> u16 {
        self.recv_window().min(u16::MAX as u32) as u16
    }

    /// Queue a control/data segment at an explicit sequence number.
    fn queue_segment(&mut self, seq: u32, flags: u8, payload: &[u8]) {
        let seg = encode_segment(
            self.local,
            self.remote,
            seq,
            self.rcv_nxt,
            flags,
            self.advertised_window(),
            payload,
        );
        self.tx_queue.push_back(seg);
    }

    fn queue_ack(&mut self) {
        self.queue_segment(self.snd_nxt, ACK, &[]);
    }

    fn drop_buffers(&mut self) {
        self.send_buffers.clear();
        self.receive_buffers.clear();
        self.ring.clear();
    }

    /// Whether `ack` acknowledges everything sent, including a FIN in
    /// flight.
    fn acks_everything(&self, ack: u32) -> bool {
        ack == self.snd_nxt
    }

    /// Process one incoming segment.  The sequence-window check precedes
    /// all state changes; out-of-window segments are dropped whole.
    fn process_segment(&mut self, seg: &TcpSegment<'_>, now: u64) -> SegmentOutcome {
        let mut outcome = SegmentOutcome { established: false };
        self.last_activity = now;

        // RST tears the connection down from any state.
        if seg.flags & RST != 0 {
            self.state = TcpState::Closed;
            self.drop_buffers();
            return outcome;
        }

        if !in_window(seg.seq, seg.payload.len(), self.rcv_nxt, self.recv_window()) {
            return outcome;
        }

        match self.state {
            TcpState::SynSent => {
                if seg.flags & (SYN | ACK) == (SYN | ACK) {
                    self.irs = seg.seq;
                    self.rcv_nxt = seg.seq.wrapping_add(1);
                    self.snd_una = seg.ack;
                    self.snd_wnd = seg.window as u32;
                    self.state = TcpState::Established;
                    self.queue_ack();
                    outcome.established = true;
                }
            }

            TcpState::SynReceived => {
                if seg.flags & ACK != 0 && self.acks_everything(seg.ack) {
                    self.snd_una = seg.ack;
                    self.snd_wnd = seg.window as u32;
                    self.state = TcpState::Established;
                    outcome.established = true;
                    if !seg.payload.is_empty() {
                        self.deliver_data(seg, now);
                    }
                }
            }

            TcpState::Established => {
                if seg.flags & ACK != 0 {
                    self.acknowledge(seg.ack, seg.window);
                }
                if !seg.payload.is_empty() {
                    self.deliver_data(seg, now);
                }
                if seg.flags & FIN != 0 {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                    self.state = TcpState::CloseWait;
                    self.queue_ack();
                }
            }

            TcpState::FinWait1 => {
                let mut fin_acked = false;
                if seg.flags & ACK != 0 {
                    fin_acked = self.acks_everything(seg.ack);
                    self.acknowledge(seg.ack, seg.window);
                }
                if !seg.payload.is_empty() {
                    self.deliver_data(seg, now);
                }
                if seg.flags & FIN != 0 {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                    self.queue_ack();
                    if fin_acked {
                        self.enter_time_wait(now);
                    } else {
                        self.state = TcpState::Closing;
                    }
                } else if fin_acked {
                    self.state = TcpState::FinWait2;
                }
            }

            TcpState::FinWait2 => {
                if seg.flags & ACK != 0 {
                    self.acknowledge(seg.ack, seg.window);
                }
                if !seg.payload.is_empty() {
                    self.deliver_data(seg, now);
                }
                if seg.flags & FIN != 0 {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                    self.queue_ack();
                    self.enter_time_wait(now);
                }
            }

            TcpState::Closing => {
                if seg.flags & ACK != 0 && self.acks_everything(seg.ack) {
                    self.enter_time_wait(now);
                }
            }

            TcpState::CloseWait => {
                if seg.flags & ACK != 0 {
                    self.acknowledge(seg.ack, seg.window);
                }
            }

            TcpState::LastAck => {
                if seg.flags & ACK != 0 && self.acks_everything(seg.ack) {
                    self.state = TcpState::Closed;
                }
            }

            TcpState::TimeWait => {
                // A retransmitted FIN gets its ACK again.
                if seg.flags & FIN != 0 {
                    self.queue_ack();
                }
            }

            TcpState::Closed | TcpState::Listen => {}
        }

        outcome
    }

    fn enter_time_wait(&mut self, now: u64) {
        self.state = TcpState::TimeWait;
        self.time_wait_since = now;
    }

    /// Buffer an arriving payload, run the reorder pass, and ACK the new
    /// `rcv_nxt` with the current window.
    fn deliver_data(&mut self, seg: &TcpSegment<'_>, _now: u64) {
        self.receive_buffers.push(RecvEntry {
            seq_start: seg.seq,
            seq_end: seg.seq.wrapping_add(seg.payload.len() as u32),
            data: seg.payload.to_vec(),
            consumed: false,
        });
        self.reorder();
        self.queue_ack();
    }

    /// Reorder pass: sort pending entries by their distance from
    /// `rcv_nxt`, then drain every entry that is now in order into the
    /// ring.  Entries fully below `rcv_nxt` are duplicates and are reaped;
    /// partially-overlapping entries contribute their tail.
    fn reorder(&mut self) {
        let base = self.rcv_nxt;
        self.receive_buffers
            .sort_by_key(|e| e.seq_start.wrapping_sub(base));

        for entry in self.receive_buffers.iter_mut() {
            if entry.consumed {
                continue;
            }
            if seq_le(entry.seq_end, self.rcv_nxt) {
                // Fully covered by what we already consumed.
                entry.consumed = true;
                continue;
            }
            if !seq_le(entry.seq_start, self.rcv_nxt) {
                // Gap: nothing further can be in order.
                break;
            }

            let skip = self.rcv_nxt.wrapping_sub(entry.seq_start) as usize;
            let bytes = &entry.data[skip..];
            if self.ring.len() + bytes.len() > RECV_CAPACITY {
                // No ring space; leave the entry for a later pass.
                break;
            }
            self.ring.extend(bytes.iter().copied());
            self.rcv_nxt = entry.seq_end;
            entry.consumed = true;
        }

        self.receive_buffers.retain(|e| !e.consumed);
    }

    /// Apply an acknowledgment: mark covered send entries, advance
    /// `snd_una`, adopt the advertised window, and reap the acknowledged
    /// prefix.
    fn acknowledge(&mut self, ack: u32, window: u16) {
        if seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt) {
            self.snd_una = ack;
        }
        for entry in self.send_buffers.iter_mut() {
            if seq_le(entry.seq_end, ack) {
                entry.acknowledged = true;
            }
        }
        // An entry is dropped once acknowledged and older than all
        // unacknowledged entries.
        while self
            .send_buffers
            .first()
            .is_some_and(|e| e.acknowledged)
        {
            self.send_buffers.remove(0);
        }
        if self.snd_wnd != window as u32 {
            self.snd_wnd = window as u32;
        }
    }

    /// Cut `data` into MSS-sized segments while the send window allows,
    /// recording each for retransmission.  Returns the number of bytes
    /// queued.
    fn send_data(&mut self, data: &[u8], now: u64) -> usize {
        let mut sent = 0;
        while sent < data.len() {
            if self.snd_nxt.wrapping_sub(self.snd_una) >= self.snd_wnd {
                break;
            }
            let chunk = (data.len() - sent).min(self.mss);
            let last = sent + chunk == data.len();
            let seq = self.snd_nxt;
            let payload = &data[sent..sent + chunk];

            self.send_buffers.push(SendEntry {
                seq_start: seq,
                seq_end: seq.wrapping_add(chunk as u32),
                data: payload.to_vec(),
                timestamp: now,
                acknowledged: false,
            });
            let flags = if last { ACK | PSH } else { ACK };
            self.queue_segment(seq, flags, payload);

            self.snd_nxt = self.snd_nxt.wrapping_add(chunk as u32);
            sent += chunk;
        }
        sent
    }

    /// Retransmission pass.  Returns `true` when the retransmit limit was
    /// exceeded and the connection must be aborted.
    fn poll_retransmit(&mut self, now: u64) -> bool {
        if self.state == TcpState::Closed || self.state == TcpState::Listen {
            return false;
        }
        for i in 0..self.send_buffers.len() {
            if self.send_buffers[i].acknowledged {
                continue;
            }
            if now.saturating_sub(self.send_buffers[i].timestamp) <= RTO {
                continue;
            }
            if self.retransmit_count >= MAX_RETRANSMITS {
                return true;
            }
            let seq = self.send_buffers[i].seq_start;
            let data = self.send_buffers[i].data.clone();
            self.queue_segment(seq, ACK | PSH, &data);
            self.send_buffers[i].timestamp = now;
            self.retransmit_count += 1;
            crate::trace!("TCP", "retransmit seq {} ({} bytes)", seq, data.len());
        }
        false
    }

    /// Queue an RST and drop to Closed.
    fn send_rst(&mut self) {
        self.queue_segment(self.snd_nxt, RST, &[]);
        self.state = TcpState::Closed;
        self.drop_buffers();
    }
}

// ── Connection table ────────────────────────────────────────

pub struct TcpTable {
    connections: BTreeMap<SocketId, TcpSocket>,
    by_tuple: BTreeMap<ConnKey, SocketId>,
    listeners: BTreeMap<u16, SocketId>,
    next_id: u64,
    next_ephemeral: u16,
}

impl TcpTable {
    pub const fn new() -> Self {
        TcpTable {
            connections: BTreeMap::new(),
            by_tuple: BTreeMap::new(),
            listeners: BTreeMap::new(),
            next_id: 1,
            next_ephemeral: EPHEMERAL_MIN,
        }
    }

    fn alloc_id(&mut self) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        id
    }

    /// A port is in use if any connected or listening socket holds it.
    fn port_in_use(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
            || self.by_tuple.keys().any(|key| key.local.port == port)
    }

    /// Ephemeral allocation from [1024, 65535].
    fn allocate_ephemeral(&mut self) -> u16 {
        loop {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == EPHEMERAL_MAX {
                EPHEMERAL_MIN
            } else {
                port + 1
            };
            if !self.port_in_use(port) {
                return port;
            }
        }
    }

    fn deregister(&mut self, id: SocketId) {
        let (key, port) = match self.connections.get(&id) {
            Some(sock) => (
                ConnKey {
                    local: sock.local,
                    remote: sock.remote,
                },
                sock.local.port,
            ),
            None => return,
        };
        if self.by_tuple.get(&key) == Some(&id) {
            self.by_tuple.remove(&key);
        }
        if self.listeners.get(&port) == Some(&id) {
            self.listeners.remove(&port);
        }
    }
}

kernel_singleton!(TCP_TABLE, Mutex, TcpTable, TcpTable::new(), with_table);

/// Register the TCP ingress handler with the IP layer.
pub fn init() {
    ipv4::register_protocol_handler(PROTO_TCP, handle_ip_packet);
    crate::info!("TCP", "tcp layer initialized");
}

/// Drain every socket's pending segments to the IP layer, outside the
/// table lock.
fn flush_tx() {
    let frames: Vec<(Ipv4Addr, Vec<u8>)> = with_table(|t| {
        let mut frames = Vec::new();
        for sock in t.connections.values_mut() {
            while let Some(seg) = sock.tx_queue.pop_front() {
                frames.push((sock.remote.ip, seg));
            }
        }
        frames
    });

    for (dst, seg) in frames {
        if let Err(e) = ipv4::send_packet(dst, PROTO_TCP, &seg) {
            crate::warning!("TCP", "transmit failed: {}", e);
        }
    }
}

/// IP-layer ingress: dispatch by 4-tuple, fall back to a listener for
/// SYNs, otherwise drop.
fn handle_ip_packet(packet: &Ipv4Packet) {
    let Some(seg) = TcpSegment::parse(&packet.payload) else {
        return;
    };
    let now = crate::time::now();

    with_table(|t| {
        let local = SocketAddr::new(packet.dst, seg.dst_port);
        let remote = SocketAddr::new(packet.src, seg.src_port);
        let key = ConnKey { local, remote };

        if let Some(&id) = t.by_tuple.get(&key) {
            let (established, listener_port, closed) = match t.connections.get_mut(&id) {
                Some(sock) => {
                    let outcome = sock.process_segment(&seg, now);
                    (
                        outcome.established,
                        sock.listener_port,
                        sock.state == TcpState::Closed,
                    )
                }
                None => return,
            };

            if established {
                if let Some(port) = listener_port {
                    if let Some(&listener_id) = t.listeners.get(&port) {
                        if let Some(listener) = t.connections.get_mut(&listener_id) {
                            listener.accept_queue.push_back(id);
                        }
                    }
                }
            }
            if closed {
                t.by_tuple.remove(&key);
            }
            return;
        }

        // No connection: a SYN may land on a listener.
        if seg.flags & SYN != 0 && seg.flags & ACK == 0 {
            let Some(&listener_id) = t.listeners.get(&seg.dst_port) else {
                return;
            };
            let backlog_ok = t
                .connections
                .get(&listener_id)
                .is_some_and(|l| l.accept_queue.len() < l.backlog.max(1));
            if !backlog_ok {
                return;
            }

            let id = t.alloc_id();
            let mut child = TcpSocket::new(now);
            child.local = local;
            child.remote = remote;
            child.listener_port = Some(seg.dst_port);
            child.state = TcpState::SynReceived;
            child.irs = seg.seq;
            child.rcv_nxt = seg.seq.wrapping_add(1);
            child.iss = generate_isn();
            child.snd_una = child.iss;
            child.snd_nxt = child.iss.wrapping_add(1);
            child.snd_wnd = seg.window as u32;
            child.queue_segment(child.iss, SYN | ACK, &[]);

            t.by_tuple.insert(key, id);
            t.connections.insert(id, child);
        }
        // Anything else is dropped.
    });

    flush_tx();
}

// ── Socket API ──────────────────────────────────────────────

/// Create a socket in Closed state.
pub fn open() -> SocketId {
    let now = crate::time::now();
    with_table(|t| {
        let id = t.alloc_id();
        t.connections.insert(id, TcpSocket::new(now));
        id
    })
}

/// Bind to a local address and port; port 0 selects an ephemeral port.
pub fn bind(id: SocketId, address: Ipv4Addr, port: u16) -> Result<u16, NetError> {
    with_table(|t| {
        if port != 0 && t.listeners.contains_key(&port) {
            return Err(NetError::AddressInUse);
        }
        let port = if port == 0 {
            t.allocate_ephemeral()
        } else {
            port
        };
        let sock = t
            .connections
            .get_mut(&id)
            .ok_or(NetError::ConnectionNotFound)?;
        if sock.state != TcpState::Closed {
            return Err(NetError::InvalidArgument);
        }
        sock.local = SocketAddr::new(address, port);
        Ok(port)
    })
}

/// Move a bound socket into Listen with the given accept backlog.
pub fn listen(id: SocketId, backlog: usize) -> Result<(), NetError> {
    with_table(|t| {
        let sock = t
            .connections
            .get_mut(&id)
            .ok_or(NetError::ConnectionNotFound)?;
        if sock.state != TcpState::Closed || sock.local.port == 0 {
            return Err(NetError::InvalidArgument);
        }
        let port = sock.local.port;
        sock.state = TcpState::Listen;
        sock.backlog = backlog;
        t.listeners.insert(port, id);
        Ok(())
    })
}

/// Dequeue one established child connection, waiting up to `timeout_ms`
/// (0 waits forever).  `None` on timeout.
pub fn accept(id: SocketId, timeout_ms: u64) -> Option<SocketId> {
    let deadline = crate::time::now() + crate::time::ms_to_ticks(timeout_ms);
    loop {
        let child = with_table(|t| {
            t.connections
                .get_mut(&id)
                .and_then(|sock| sock.accept_queue.pop_front())
        });
        if child.is_some() {
            return child;
        }
        if timeout_ms != 0 && crate::time::now() > deadline {
            return None;
        }
        super::poll_rx();
        crate::scheduler::yield_now();
    }
}

/// Active open: emit SYN and block until Established or timeout.
pub fn connect(id: SocketId, remote: SocketAddr, timeout_ms: u64) -> Result<(), NetError> {
    let now = crate::time::now();

    with_table(|t| {
        let local_ip = ipv4::primary_address().ok_or(NetError::NetworkUnreachable)?;
        let bound_port = {
            let sock = t
                .connections
                .get(&id)
                .ok_or(NetError::ConnectionNotFound)?;
            if sock.state != TcpState::Closed {
                return Err(NetError::AlreadyConnected);
            }
            sock.local.port
        };
        let port = if bound_port != 0 {
            bound_port
        } else {
            t.allocate_ephemeral()
        };

        let sock = t
            .connections
            .get_mut(&id)
            .ok_or(NetError::ConnectionNotFound)?;
        sock.local = SocketAddr::new(local_ip, port);
        sock.remote = remote;
        sock.iss = generate_isn();
        sock.snd_una = sock.iss;
        sock.snd_nxt = sock.iss.wrapping_add(1);
        sock.state = TcpState::SynSent;
        sock.queue_segment(sock.iss, SYN, &[]);

        let key = ConnKey {
            local: sock.local,
            remote,
        };
        t.by_tuple.insert(key, id);
        Ok(())
    })?;

    flush_tx();

    let deadline = now + crate::time::ms_to_ticks(timeout_ms.max(1));
    loop {
        super::poll_rx();
        match state(id) {
            Some(TcpState::Established) => return Ok(()),
            Some(TcpState::Closed) => return Err(NetError::ConnectionRefused),
            None => return Err(NetError::ConnectionNotFound),
            _ => {}
        }
        if crate::time::now() > deadline {
            with_table(|t| {
                t.deregister(id);
                if let Some(sock) = t.connections.get_mut(&id) {
                    sock.state = TcpState::Closed;
                }
            });
            return Err(NetError::TimedOut);
        }
        crate::scheduler::yield_now();
    }
}

/// Queue data for transmission.  Returns the number of bytes accepted;
/// zero when the socket is not Established.
pub fn send(id: SocketId, data: &[u8]) -> usize {
    let now = crate::time::now();
    let sent = with_table(|t| {
        let Some(sock) = t.connections.get_mut(&id) else {
            return 0;
        };
        if sock.state != TcpState::Established {
            return 0;
        }
        sock.send_data(data, now)
    });
    flush_tx();
    sent
}

/// Copy received in-order bytes into `buf`, waiting up to `timeout_ms`
/// (0 waits forever).  Returns 0 on timeout or end of stream.
pub fn receive(id: SocketId, buf: &mut [u8], timeout_ms: u64) -> usize {
    let deadline = crate::time::now() + crate::time::ms_to_ticks(timeout_ms);
    loop {
        let result = with_table(|t| {
            let Some(sock) = t.connections.get_mut(&id) else {
                return Some(0);
            };
            if !sock.ring.is_empty() {
                let n = buf.len().min(sock.ring.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = sock.ring.pop_front().unwrap();
                }
                // Tell the peer about the reopened window.
                sock.queue_ack();
                return Some(n);
            }
            match sock.state {
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => None,
                // Peer finished sending (or the connection died): report
                // end of stream.
                _ => Some(0),
            }
        });

        if let Some(n) = result {
            flush_tx();
            return n;
        }
        if timeout_ms != 0 && crate::time::now() > deadline {
            return 0;
        }
        super::poll_rx();
        crate::scheduler::yield_now();
    }
}

/// Bytes available for immediate `receive`.
pub fn available(id: SocketId) -> usize {
    with_table(|t| t.connections.get(&id).map_or(0, |sock| sock.ring.len()))
}

/// Orderly shutdown: emit FIN per the current state.
pub fn close(id: SocketId) -> Result<(), NetError> {
    with_table(|t| {
        let sock = t
            .connections
            .get_mut(&id)
            .ok_or(NetError::ConnectionNotFound)?;
        match sock.state {
            TcpState::Established => {
                let seq = sock.snd_nxt;
                sock.queue_segment(seq, FIN | ACK, &[]);
                sock.snd_nxt = sock.snd_nxt.wrapping_add(1);
                sock.state = TcpState::FinWait1;
            }
            TcpState::CloseWait => {
                let seq = sock.snd_nxt;
                sock.queue_segment(seq, FIN | ACK, &[]);
                sock.snd_nxt = sock.snd_nxt.wrapping_add(1);
                sock.state = TcpState::LastAck;
            }
            _ => {
                sock.state = TcpState::Closed;
                t.deregister(id);
            }
        }
        Ok(())
    })?;
    flush_tx();
    Ok(())
}

/// Hard abort: RST out, straight to Closed, tuple released.
pub fn abort(id: SocketId) -> Result<(), NetError> {
    with_table(|t| {
        let sock = t
            .connections
            .get_mut(&id)
            .ok_or(NetError::ConnectionNotFound)?;
        if sock.state != TcpState::Closed && sock.state != TcpState::Listen {
            sock.send_rst();
        } else {
            sock.state = TcpState::Closed;
        }
        t.deregister(id);
        Ok(())
    })?;
    flush_tx();
    Ok(())
}

/// Drop a socket from the table entirely.  The handle becomes invalid.
pub fn release(id: SocketId) {
    with_table(|t| {
        t.deregister(id);
        t.connections.remove(&id);
    });
}

/// Current state of a socket, `None` for unknown handles.
pub fn state(id: SocketId) -> Option<TcpState> {
    with_table(|t| t.connections.get(&id).map(|sock| sock.state))
}

/// Test-only introspection of sequence variables.
#[cfg(test)]
pub fn sequence_vars(id: SocketId) -> Option<(u32, u32, u32)> {
    with_table(|t| {
        t.connections
            .get(&id)
            .map(|sock| (sock.iss, sock.snd_nxt, sock.rcv_nxt))
    })
}

/// Scheduler-driven per-connection maintenance: retransmission and
/// TimeWait expiry.  Connections past the retransmit limit are aborted.
pub fn poll_sockets() {
    let now = crate::time::now();
    with_table(|t| {
        let mut to_deregister = Vec::new();
        for (&id, sock) in t.connections.iter_mut() {
            if sock.state == TcpState::TimeWait
                && now.saturating_sub(sock.time_wait_since) > TIME_WAIT_TIMEOUT
            {
                sock.state = TcpState::Closed;
                to_deregister.push(id);
                continue;
            }
            if sock.poll_retransmit(now) {
                crate::warning!(
                    "TCP",
                    "connection {} -> {} exceeded retransmit limit, aborting",
                    sock.local,
                    sock.remote
                );
                sock.send_rst();
                to_deregister.push(id);
            }
        }
        for id in to_deregister {
            t.deregister(id);
        }
    });
    flush_tx();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(seq: u32, ack: u32, flags: u8, payload: &[u8]) -> TcpSegment<'_> {
        TcpSegment {
            src_port: 40000,
            dst_port: 80,
            seq,
            ack,
            flags,
            window: 8192,
            payload,
        }
    }

    /// An Established socket expecting sequence 100 from the peer.
    fn established_socket() -> TcpSocket {
        let mut sock = TcpSocket::new(0);
        sock.state = TcpState::Established;
        sock.local = SocketAddr::new(Ipv4Addr::new(10, 0, 2, 15), 80);
        sock.remote = SocketAddr::new(Ipv4Addr::new(10, 0, 2, 2), 40000);
        sock.iss = 1000;
        sock.snd_una = 1001;
        sock.snd_nxt = 1001;
        sock.snd_wnd = 8192;
        sock.irs = 99;
        sock.rcv_nxt = 100;
        sock
    }

    fn ring_bytes(sock: &TcpSocket) -> Vec<u8> {
        sock.ring.iter().copied().collect()
    }

    #[test]
    fn segment_encode_parse_roundtrip() {
        let local = SocketAddr::new(Ipv4Addr::new(10, 0, 2, 15), 80);
        let remote = SocketAddr::new(Ipv4Addr::new(10, 0, 2, 2), 40000);
        let raw = encode_segment(local, remote, 12345, 67890, ACK | PSH, 4096, b"data!");

        let seg = TcpSegment::parse(&raw).unwrap();
        assert_eq!(seg.src_port, 80);
        assert_eq!(seg.dst_port, 40000);
        assert_eq!(seg.seq, 12345);
        assert_eq!(seg.ack, 67890);
        assert_eq!(seg.flags, ACK | PSH);
        assert_eq!(seg.window, 4096);
        assert_eq!(seg.payload, b"data!");
    }

    #[test]
    fn checksum_verifies_over_pseudo_header() {
        let local = SocketAddr::new(Ipv4Addr::new(192, 168, 1, 5), 1234);
        let remote = SocketAddr::new(Ipv4Addr::new(192, 168, 1, 9), 5678);
        let raw = encode_segment(local, remote, 1, 2, SYN, 1000, b"abc");

        // Recomputing over the segment with its checksum in place yields
        // zero.
        let pseudo =
            ipv4::pseudo_header_checksum(local.ip, remote.ip, PROTO_TCP, raw.len() as u16);
        assert_eq!(tcp_checksum(&raw, pseudo), 0);
    }

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_lt(0xFFFF_FFF0, 0x10));
        assert!(!seq_lt(0x10, 0xFFFF_FFF0));
        assert!(seq_le(5, 5));
        assert!(in_window(100, 10, 100, 1000));
        assert!(!in_window(99, 10, 100, 1000));
        assert!(!in_window(100, 2000, 100, 1000));
        // Empty payloads are always in-window.
        assert!(in_window(0, 0, 100, 0));
        // Window spanning the wrap point.
        assert!(in_window(0xFFFF_FFFE, 4, 0xFFFF_FFFE, 100));
    }

    #[test]
    fn in_order_data_lands_in_ring() {
        let mut sock = established_socket();
        sock.process_segment(&segment(100, 1001, ACK | PSH, b"hello"), 1);

        assert_eq!(sock.rcv_nxt, 105);
        assert_eq!(ring_bytes(&sock), b"hello");
        // The arrival was ACKed.
        assert_eq!(sock.tx_queue.len(), 1);
        let ack_seg = TcpSegment::parse(&sock.tx_queue[0]).unwrap();
        assert_eq!(ack_seg.ack, 105);
    }

    #[test]
    fn out_of_order_segments_reassemble() {
        // Segments [100,110), [120,130), [110,120) arrive in that order;
        // afterwards rcv_nxt is 130 and the ring holds all 30 bytes in
        // sequence order.
        let mut sock = established_socket();

        sock.process_segment(&segment(100, 1001, ACK, &[1u8; 10]), 1);
        assert_eq!(sock.rcv_nxt, 110);

        sock.process_segment(&segment(120, 1001, ACK, &[3u8; 10]), 2);
        // Gap: 110..120 missing, rcv_nxt holds.
        assert_eq!(sock.rcv_nxt, 110);
        assert_eq!(sock.receive_buffers.len(), 1);

        sock.process_segment(&segment(110, 1001, ACK, &[2u8; 10]), 3);
        assert_eq!(sock.rcv_nxt, 130);
        assert!(sock.receive_buffers.is_empty());

        let mut expected = alloc::vec![1u8; 10];
        expected.extend_from_slice(&[2u8; 10]);
        expected.extend_from_slice(&[3u8; 10]);
        assert_eq!(ring_bytes(&sock), expected);
    }

    #[test]
    fn stale_duplicates_are_dropped_by_the_window() {
        let mut sock = established_socket();
        sock.process_segment(&segment(100, 1001, ACK, &[1u8; 10]), 1);
        assert_eq!(sock.rcv_nxt, 110);

        // A retransmission of already-consumed data falls below the
        // window and changes nothing.
        sock.process_segment(&segment(100, 1001, ACK, &[1u8; 10]), 2);
        assert_eq!(sock.rcv_nxt, 110);
        assert_eq!(ring_bytes(&sock).len(), 10);
        assert!(sock.receive_buffers.is_empty());
    }

    #[test]
    fn overlapping_buffered_entry_contributes_its_tail() {
        let mut sock = established_socket();
        sock.process_segment(&segment(100, 1001, ACK, &[6u8; 10]), 1);
        assert_eq!(sock.rcv_nxt, 110);

        // [115,125) waits on the gap at 110.
        let mut tail_data = alloc::vec![8u8; 5];
        tail_data.extend_from_slice(&[9u8; 5]);
        sock.process_segment(&segment(115, 1001, ACK, &tail_data), 2);
        assert_eq!(sock.rcv_nxt, 110);

        // [110,120) closes the gap and overlaps the buffered entry; the
        // entry contributes only its [120,125) tail.
        sock.process_segment(&segment(110, 1001, ACK, &[7u8; 10]), 3);
        assert_eq!(sock.rcv_nxt, 125);
        assert!(sock.receive_buffers.is_empty());

        let ring = ring_bytes(&sock);
        assert_eq!(ring.len(), 25);
        assert_eq!(ring[10..20], [7u8; 10]);
        assert_eq!(ring[20..], [9u8; 5]);
    }

    #[test]
    fn out_of_window_segment_changes_nothing() {
        let mut sock = established_socket();
        // Below the window.
        sock.process_segment(&segment(50, 1001, ACK, &[7u8; 10]), 1);
        // Beyond the window.
        let far = 100 + RECV_CAPACITY as u32;
        sock.process_segment(&segment(far, 1001, ACK, &[7u8; 10]), 2);

        assert_eq!(sock.rcv_nxt, 100);
        assert!(sock.ring.is_empty());
        assert!(sock.receive_buffers.is_empty());
        assert!(sock.tx_queue.is_empty());
    }

    #[test]
    fn ack_reaps_send_entries() {
        let mut sock = established_socket();
        // Two full MSS segments: [1001,2461) and [2461,3921).
        sock.send_data(&[0xAA; 2 * MSS], 10);
        assert_eq!(sock.send_buffers.len(), 2);
        assert_eq!(sock.snd_nxt, 3921);

        // ACK for byte 2461 covers exactly the first entry; the second
        // stays intact.
        sock.process_segment(&segment(100, 2461, ACK, &[]), 20);
        assert_eq!(sock.send_buffers.len(), 1);
        assert_eq!(sock.send_buffers[0].seq_start, 2461);
        assert_eq!(sock.snd_una, 2461);

        sock.process_segment(&segment(100, 3921, ACK, &[]), 30);
        assert!(sock.send_buffers.is_empty());
        assert_eq!(sock.snd_una, 3921);
    }

    #[test]
    fn send_respects_peer_window() {
        let mut sock = established_socket();
        sock.snd_wnd = 2000;
        let queued = sock.send_data(&[0u8; 5000], 1);
        // Segments are cut while in-flight bytes stay under the window:
        // the second segment starts at 1460 in-flight, the third would
        // start at 2920 and is held back.
        assert_eq!(queued, 2 * MSS);
        assert_eq!(sock.send_buffers.len(), 2);

        // Once everything is acknowledged the remainder can go out.
        sock.process_segment(&segment(100, sock.snd_nxt, ACK, &[]), 2);
        let more = sock.send_data(&[0u8; 5000 - 2 * MSS], 3);
        assert!(more > 0);
    }

    #[test]
    fn last_segment_of_burst_carries_psh() {
        let mut sock = established_socket();
        sock.send_data(&[0u8; 2000], 1);
        assert_eq!(sock.tx_queue.len(), 2);

        let first = TcpSegment::parse(&sock.tx_queue[0]).unwrap();
        let second = TcpSegment::parse(&sock.tx_queue[1]).unwrap();
        assert_eq!(first.flags & PSH, 0);
        assert_ne!(second.flags & PSH, 0);
    }

    #[test]
    fn retransmit_after_rto_refreshes_timestamp() {
        let mut sock = established_socket();
        sock.send_data(b"ping", 100);
        sock.tx_queue.clear();

        // Before the RTO nothing happens.
        assert!(!sock.poll_retransmit(100 + RTO / 2));
        assert!(sock.tx_queue.is_empty());

        // Past the RTO the segment goes out again with the same sequence.
        assert!(!sock.poll_retransmit(100 + RTO + 1));
        assert_eq!(sock.tx_queue.len(), 1);
        let seg = TcpSegment::parse(&sock.tx_queue[0]).unwrap();
        assert_eq!(seg.seq, 1001);
        assert_eq!(seg.payload, b"ping");
        assert_eq!(sock.send_buffers[0].timestamp, 100 + RTO + 1);
        assert_eq!(sock.retransmit_count, 1);
    }

    #[test]
    fn retransmit_limit_requests_abort() {
        let mut sock = established_socket();
        sock.send_data(b"doomed", 0);
        sock.retransmit_count = MAX_RETRANSMITS;
        assert!(sock.poll_retransmit(10 * RTO));
    }

    #[test]
    fn rst_closes_and_drops_buffers() {
        let mut sock = established_socket();
        sock.process_segment(&segment(100, 1001, ACK, &[1u8; 10]), 1);
        sock.send_data(b"queued", 2);

        sock.process_segment(&segment(110, 1001, RST, &[]), 3);
        assert_eq!(sock.state, TcpState::Closed);
        assert!(sock.ring.is_empty());
        assert!(sock.send_buffers.is_empty());
        assert!(sock.receive_buffers.is_empty());
    }

    #[test]
    fn fin_moves_to_close_wait_and_acks() {
        let mut sock = established_socket();
        sock.tx_queue.clear();
        sock.process_segment(&segment(100, 1001, FIN | ACK, &[]), 1);

        assert_eq!(sock.state, TcpState::CloseWait);
        assert_eq!(sock.rcv_nxt, 101);
        let ack_seg = TcpSegment::parse(sock.tx_queue.back().unwrap()).unwrap();
        assert_eq!(ack_seg.ack, 101);
    }

    #[test]
    fn active_close_fin_exchange() {
        // FinWait1 -> FinWait2 on the ACK of our FIN, TimeWait on the
        // peer's FIN.
        let mut sock = established_socket();
        let fin_seq = sock.snd_nxt;
        sock.queue_segment(fin_seq, FIN | ACK, &[]);
        sock.snd_nxt = sock.snd_nxt.wrapping_add(1);
        sock.state = TcpState::FinWait1;

        sock.process_segment(&segment(100, sock.snd_nxt, ACK, &[]), 1);
        assert_eq!(sock.state, TcpState::FinWait2);

        sock.process_segment(&segment(100, sock.snd_nxt, FIN | ACK, &[]), 2);
        assert_eq!(sock.state, TcpState::TimeWait);
        assert_eq!(sock.rcv_nxt, 101);
    }

    #[test]
    fn simultaneous_close_goes_through_closing() {
        let mut sock = established_socket();
        let fin_seq = sock.snd_nxt;
        sock.queue_segment(fin_seq, FIN | ACK, &[]);
        sock.snd_nxt = sock.snd_nxt.wrapping_add(1);
        sock.state = TcpState::FinWait1;

        // Peer's FIN arrives acking only old data, not our FIN.
        sock.process_segment(&segment(100, fin_seq, FIN | ACK, &[]), 1);
        assert_eq!(sock.state, TcpState::Closing);

        // The ACK of our FIN completes the close.
        sock.process_segment(&segment(101, sock.snd_nxt, ACK, &[]), 2);
        assert_eq!(sock.state, TcpState::TimeWait);
    }

    #[test]
    fn ring_capacity_bounds_the_window() {
        let mut sock = established_socket();
        assert_eq!(sock.recv_window() as usize, RECV_CAPACITY);
        sock.process_segment(&segment(100, 1001, ACK, &[0u8; 1000]), 1);
        assert_eq!(sock.recv_window() as usize, RECV_CAPACITY - 1000);
    }
}
