//! UDP datagram layer.
//!
//! Connectionless sockets keyed by (local address, local port).  A socket
//! may "connect" to a peer, which only filters which datagrams reach its
//! queue.  Checksums are not computed (legal over IPv4).

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use super::ipv4::{self, Ipv4Packet, PROTO_UDP};
use super::{Ipv4Addr, NetError, SocketAddr};
use crate::kernel_singleton;

/// UDP header size.
pub const HEADER_SIZE: usize = 8;

/// Largest payload that fits an IPv4 datagram.
pub const MAX_PAYLOAD: usize = 65507;

/// Ephemeral port range, shared discipline with TCP.
const EPHEMERAL_MIN: u16 = 1024;
const EPHEMERAL_MAX: u16 = 65535;

/// Socket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UdpSocketId(pub u64);

/// One received datagram awaiting the application.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub data: Vec<u8>,
    pub timestamp: u64,
}

struct UdpSocket {
    local: SocketAddr,
    remote: Option<SocketAddr>,
    bound: bool,
    queue: VecDeque<UdpDatagram>,
}

pub struct UdpTable {
    sockets: BTreeMap<UdpSocketId, UdpSocket>,
    by_binding: BTreeMap<(Ipv4Addr, u16), UdpSocketId>,
    next_id: u64,
    next_ephemeral: u16,
}

impl UdpTable {
    pub const fn new() -> Self {
        UdpTable {
            sockets: BTreeMap::new(),
            by_binding: BTreeMap::new(),
            next_id: 1,
            next_ephemeral: EPHEMERAL_MIN,
        }
    }

    fn allocate_ephemeral(&mut self) -> u16 {
        loop {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == EPHEMERAL_MAX {
                EPHEMERAL_MIN
            } else {
                port + 1
            };
            if !self.by_binding.keys().any(|&(_, p)| p == port) {
                return port;
            }
        }
    }
}

kernel_singleton!(UDP_TABLE, Mutex, UdpTable, UdpTable::new(), with_table);

/// Register the UDP ingress handler with the IP layer.
pub fn init() {
    ipv4::register_protocol_handler(PROTO_UDP, handle_ip_packet);
    crate::info!("UDP", "udp layer initialized");
}

fn handle_ip_packet(packet: &Ipv4Packet) {
    if packet.payload.len() < HEADER_SIZE {
        return;
    }

    let src_port = u16::from_be_bytes([packet.payload[0], packet.payload[1]]);
    let dst_port = u16::from_be_bytes([packet.payload[2], packet.payload[3]]);
    let length = u16::from_be_bytes([packet.payload[4], packet.payload[5]]) as usize;

    if length < HEADER_SIZE || length > packet.payload.len() {
        return;
    }

    let datagram = UdpDatagram {
        source: SocketAddr::new(packet.src, src_port),
        destination: SocketAddr::new(packet.dst, dst_port),
        data: packet.payload[HEADER_SIZE..length].to_vec(),
        timestamp: crate::time::now(),
    };

    with_table(|t| {
        // Exact binding first, then the wildcard address.
        let id = t
            .by_binding
            .get(&(packet.dst, dst_port))
            .or_else(|| t.by_binding.get(&(Ipv4Addr::ANY, dst_port)))
            .copied();
        let Some(id) = id else {
            return;
        };
        let Some(sock) = t.sockets.get_mut(&id) else {
            return;
        };

        // A connected socket only accepts its peer.
        if let Some(remote) = sock.remote {
            if remote != datagram.source {
                return;
            }
        }
        sock.queue.push_back(datagram);
    });
}

// ── Socket API ──────────────────────────────────────────────

/// Create an unbound socket.
pub fn open() -> UdpSocketId {
    with_table(|t| {
        let id = UdpSocketId(t.next_id);
        t.next_id += 1;
        t.sockets.insert(
            id,
            UdpSocket {
                local: SocketAddr::new(Ipv4Addr::ANY, 0),
                remote: None,
                bound: false,
                queue: VecDeque::new(),
            },
        );
        id
    })
}

/// Bind to an address and port; port 0 selects an ephemeral port.
pub fn bind(id: UdpSocketId, address: Ipv4Addr, port: u16) -> Result<u16, NetError> {
    with_table(|t| {
        let port = if port == 0 {
            t.allocate_ephemeral()
        } else {
            port
        };
        if t.by_binding.contains_key(&(address, port)) {
            return Err(NetError::AddressInUse);
        }
        let sock = t
            .sockets
            .get_mut(&id)
            .ok_or(NetError::ConnectionNotFound)?;
        if sock.bound {
            return Err(NetError::InvalidArgument);
        }
        sock.local = SocketAddr::new(address, port);
        sock.bound = true;
        t.by_binding.insert((address, port), id);
        Ok(port)
    })
}

/// Fix the peer; `send` uses it and ingress filters on it.
pub fn connect(id: UdpSocketId, address: Ipv4Addr, port: u16) -> Result<(), NetError> {
    with_table(|t| {
        let sock = t
            .sockets
            .get_mut(&id)
            .ok_or(NetError::ConnectionNotFound)?;
        if !sock.bound {
            return Err(NetError::InvalidArgument);
        }
        sock.remote = Some(SocketAddr::new(address, port));
        Ok(())
    })
}

/// Send one datagram to an explicit destination.
pub fn send_to(id: UdpSocketId, dst: Ipv4Addr, port: u16, data: &[u8]) -> Result<usize, NetError> {
    if data.len() > MAX_PAYLOAD {
        return Err(NetError::InvalidArgument);
    }

    let local_port = with_table(|t| {
        let sock = t.sockets.get(&id).ok_or(NetError::ConnectionNotFound)?;
        if !sock.bound {
            return Err(NetError::NotConnected);
        }
        Ok(sock.local.port)
    })?;

    let length = (HEADER_SIZE + data.len()) as u16;
    let mut packet = Vec::with_capacity(length as usize);
    packet.extend_from_slice(&local_port.to_be_bytes());
    packet.extend_from_slice(&port.to_be_bytes());
    packet.extend_from_slice(&length.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]); // checksum not computed
    packet.extend_from_slice(data);

    ipv4::send_packet(dst, PROTO_UDP, &packet)?;
    Ok(data.len())
}

/// Send to the connected peer.
pub fn send(id: UdpSocketId, data: &[u8]) -> Result<usize, NetError> {
    let remote = with_table(|t| {
        t.sockets
            .get(&id)
            .ok_or(NetError::ConnectionNotFound)?
            .remote
            .ok_or(NetError::NotConnected)
    })?;
    send_to(id, remote.ip, remote.port, data)
}

/// Receive one datagram, waiting up to `timeout_ms` (0 waits forever).
/// Returns the byte count and the source address; `(0, None)` on timeout.
pub fn receive_from(
    id: UdpSocketId,
    buf: &mut [u8],
    timeout_ms: u64,
) -> (usize, Option<SocketAddr>) {
    let deadline = crate::time::now() + crate::time::ms_to_ticks(timeout_ms);
    loop {
        let taken = with_table(|t| {
            t.sockets
                .get_mut(&id)
                .and_then(|sock| sock.queue.pop_front())
        });

        if let Some(datagram) = taken {
            let n = buf.len().min(datagram.data.len());
            buf[..n].copy_from_slice(&datagram.data[..n]);
            return (n, Some(datagram.source));
        }
        if timeout_ms != 0 && crate::time::now() > deadline {
            return (0, None);
        }
        super::poll_rx();
        crate::scheduler::yield_now();
    }
}

/// Close and unbind.
pub fn close(id: UdpSocketId) {
    with_table(|t| {
        if let Some(sock) = t.sockets.remove(&id) {
            if sock.bound {
                t.by_binding.remove(&(sock.local.ip, sock.local.port));
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ipv4::tests::build_raw;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);

    fn deliver(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16, data: &[u8]) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&src_port.to_be_bytes());
        payload.extend_from_slice(&dst_port.to_be_bytes());
        payload.extend_from_slice(&((HEADER_SIZE + data.len()) as u16).to_be_bytes());
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(data);

        let raw = build_raw(src, dst, PROTO_UDP, 1, 0, false, &payload);
        ipv4::process_packet(&raw);
    }

    #[test]
    fn bound_socket_receives_datagram() {
        init();
        let id = open();
        bind(id, LOCAL, 5000).unwrap();

        deliver(PEER, 6000, LOCAL, 5000, b"ping");

        let mut buf = [0u8; 16];
        let (n, from) = receive_from(id, &mut buf, 1);
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(from, Some(SocketAddr::new(PEER, 6000)));
    }

    #[test]
    fn wildcard_binding_catches_any_destination() {
        init();
        let id = open();
        bind(id, Ipv4Addr::ANY, 5001).unwrap();

        deliver(PEER, 6000, LOCAL, 5001, b"to-any");
        let mut buf = [0u8; 16];
        let (n, _) = receive_from(id, &mut buf, 1);
        assert_eq!(n, 6);
    }

    #[test]
    fn connected_socket_filters_other_peers() {
        init();
        let id = open();
        bind(id, LOCAL, 5002).unwrap();
        connect(id, PEER, 6000).unwrap();

        deliver(Ipv4Addr::new(10, 0, 2, 3), 6000, LOCAL, 5002, b"stranger");
        deliver(PEER, 6001, LOCAL, 5002, b"wrong-port");
        deliver(PEER, 6000, LOCAL, 5002, b"friend");

        let mut buf = [0u8; 16];
        let (n, from) = receive_from(id, &mut buf, 1);
        assert_eq!(&buf[..n], b"friend");
        assert_eq!(from.unwrap().port, 6000);
    }

    #[test]
    fn double_bind_same_port_fails() {
        init();
        let a = open();
        let b = open();
        bind(a, LOCAL, 5003).unwrap();
        assert_eq!(bind(b, LOCAL, 5003), Err(NetError::AddressInUse));
    }

    #[test]
    fn ephemeral_bind_allocates_unique_ports() {
        init();
        let a = open();
        let b = open();
        let pa = bind(a, LOCAL, 0).unwrap();
        let pb = bind(b, LOCAL, 0).unwrap();
        assert!(pa >= 1024);
        assert!(pb >= 1024);
        assert_ne!(pa, pb);
    }

    #[test]
    fn truncated_datagrams_are_dropped() {
        init();
        let id = open();
        bind(id, LOCAL, 5004).unwrap();

        // Length field claims more than the packet carries.
        let mut payload = Vec::new();
        payload.extend_from_slice(&6000u16.to_be_bytes());
        payload.extend_from_slice(&5004u16.to_be_bytes());
        payload.extend_from_slice(&100u16.to_be_bytes());
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(b"short");
        let raw = build_raw(PEER, LOCAL, PROTO_UDP, 2, 0, false, &payload);
        ipv4::process_packet(&raw);

        let mut buf = [0u8; 16];
        let (n, _) = receive_from(id, &mut buf, 1);
        assert_eq!(n, 0);
    }

    #[test]
    fn close_releases_the_binding() {
        init();
        let a = open();
        bind(a, LOCAL, 5005).unwrap();
        close(a);

        let b = open();
        assert!(bind(b, LOCAL, 5005).is_ok());
    }
}
