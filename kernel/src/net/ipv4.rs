//! IPv4 layer.
//!
//! Validates incoming packets, reassembles fragments, routes outgoing
//! packets by longest-prefix match, and dispatches payloads to registered
//! protocol handlers.  Headers are parsed and built byte by byte in
//! network order; nothing is overlaid on wire memory.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::ethernet::{self, MacAddress, ETHERTYPE_IPV4};
use super::{Ipv4Addr, NetError};
use crate::kernel_singleton;

/// IPv4 header size without options.
pub const HEADER_SIZE: usize = 20;

/// Protocol numbers.
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Default TTL for outgoing packets.
pub const DEFAULT_TTL: u8 = 64;

/// Fragment buffers older than this (monotonic) are evicted: 30 seconds.
const FRAGMENT_TIMEOUT: u64 = crate::time::ms_to_ticks(30_000);

// ── Parsed packet ───────────────────────────────────────────

/// A validated IPv4 packet handed to protocol handlers.  For reassembled
/// packets `payload` is the concatenation of the fragments in offset
/// order.
#[derive(Debug, Clone)]
pub struct Ipv4Packet {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub identification: u16,
    pub ttl: u8,
    pub payload: Vec<u8>,
}

/// Header fields of one on-wire packet.
struct ParsedHeader {
    header_len: usize,
    total_len: usize,
    identification: u16,
    more_fragments: bool,
    fragment_offset: u16,
    ttl: u8,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

/// Parse and validate a header.  Any violation means the packet is
/// silently dropped: version, IHL, length consistency, and the header
/// checksum recomputed with the checksum field zeroed.
fn parse_header(raw: &[u8]) -> Option<ParsedHeader> {
    if raw.len() < HEADER_SIZE {
        return None;
    }

    let version = raw[0] >> 4;
    if version != 4 {
        return None;
    }

    let ihl = (raw[0] & 0x0F) as usize;
    if ihl < 5 {
        return None;
    }
    let header_len = ihl * 4;
    if header_len > raw.len() {
        return None;
    }

    let total_len = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    if total_len > raw.len() || total_len < header_len {
        return None;
    }

    if checksum(&raw[..header_len]) != 0 {
        return None;
    }

    let identification = u16::from_be_bytes([raw[4], raw[5]]);
    let flags_offset = u16::from_be_bytes([raw[6], raw[7]]);

    Some(ParsedHeader {
        header_len,
        total_len,
        identification,
        more_fragments: flags_offset & 0x2000 != 0,
        fragment_offset: flags_offset & 0x1FFF,
        ttl: raw[8],
        protocol: raw[9],
        src: Ipv4Addr([raw[12], raw[13], raw[14], raw[15]]),
        dst: Ipv4Addr([raw[16], raw[17], raw[18], raw[19]]),
    })
}

/// Internet checksum (RFC 1071).  Over a header whose checksum field holds
/// the on-wire value, a correct header sums to zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
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

/// TCP/UDP pseudo-header checksum contribution.
pub fn pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> u32 {
    let mut sum: u32 = 0;
    sum += u16::from_be_bytes([src.0[0], src.0[1]]) as u32;
    sum += u16::from_be_bytes([src.0[2], src.0[3]]) as u32;
    sum += u16::from_be_bytes([dst.0[0], dst.0[1]]) as u32;
    sum += u16::from_be_bytes([dst.0[2], dst.0[3]]) as u32;
    sum += protocol as u32;
    sum += length as u32;
    sum
}

// ── Layer state ─────────────────────────────────────────────

/// One configured interface over an ethernet device.
#[derive(Debug, Clone, Copy)]
pub struct Interface {
    pub index: usize,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mac: MacAddress,
    pub is_up: bool,
    pub mtu: u16,
    pub device_index: usize,
}

/// Routing table entry.
#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub interface_index: usize,
    pub metric: u32,
}

/// Reassembly key: one buffer per (src, dst, identification, protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FragmentKey {
    src: u32,
    dst: u32,
    identification: u16,
    protocol: u8,
}

/// In-progress reassembly.  `total_length` is tentative until the
/// fragment with MF clear arrives.
struct FragmentBuffer {
    fragments: BTreeMap<u16, Vec<u8>>,
    total_length: Option<usize>,
    received_length: usize,
    last_accessed: u64,
}

/// Protocol handler: invoked synchronously for every fully-assembled
/// packet of its protocol.
pub type PacketHandler = fn(&Ipv4Packet);

pub struct IpLayer {
    interfaces: Vec<Interface>,
    routing_table: Vec<RouteEntry>,
    fragment_buffers: BTreeMap<FragmentKey, FragmentBuffer>,
    handlers: Vec<(u8, PacketHandler)>,
    identification_counter: u16,
}

impl IpLayer {
    pub const fn new() -> Self {
        IpLayer {
            interfaces: Vec::new(),
            routing_table: Vec::new(),
            fragment_buffers: BTreeMap::new(),
            handlers: Vec::new(),
            identification_counter: 1,
        }
    }

    /// Longest-prefix match; ties broken by smaller metric.
    fn find_route(&self, dst: Ipv4Addr) -> Option<RouteEntry> {
        let dst = dst.to_u32();
        let mut best: Option<(u32, RouteEntry)> = None;

        for route in &self.routing_table {
            let mask = route.netmask.to_u32();
            if dst & mask != route.network.to_u32() & mask {
                continue;
            }
            let prefix = mask.count_ones();
            let better = match best {
                None => true,
                Some((best_prefix, best_route)) => {
                    prefix > best_prefix
                        || (prefix == best_prefix && route.metric < best_route.metric)
                }
            };
            if better {
                best = Some((prefix, *route));
            }
        }

        best.map(|(_, route)| route)
    }

    fn handlers_for(&self, protocol: u8) -> Vec<PacketHandler> {
        self.handlers
            .iter()
            .filter(|(proto, _)| *proto == protocol)
            .map(|&(_, handler)| handler)
            .collect()
    }

    /// Store one fragment; returns the reassembled packet when this
    /// fragment completed it.
    fn process_fragment(
        &mut self,
        header: &ParsedHeader,
        payload: &[u8],
        now: u64,
    ) -> Option<Ipv4Packet> {
        let key = FragmentKey {
            src: header.src.to_u32(),
            dst: header.dst.to_u32(),
            identification: header.identification,
            protocol: header.protocol,
        };

        let buffer = self
            .fragment_buffers
            .entry(key)
            .or_insert_with(|| FragmentBuffer {
                fragments: BTreeMap::new(),
                total_length: None,
                received_length: 0,
                last_accessed: now,
            });
        buffer.last_accessed = now;

        let offset = header.fragment_offset * 8;
        buffer.received_length += payload.len();
        buffer.fragments.insert(offset, payload.to_vec());

        if !header.more_fragments {
            // The last fragment fixes the total payload length.
            buffer.total_length = Some(offset as usize + payload.len());
        }

        let total = buffer.total_length?;

        // Complete iff the fragments tile [0, total) without gaps.
        let mut expected = 0usize;
        for (&frag_offset, data) in &buffer.fragments {
            if frag_offset as usize != expected {
                return None;
            }
            expected += data.len();
        }
        if expected != total {
            return None;
        }

        let mut reassembled = Vec::with_capacity(total);
        for data in buffer.fragments.values() {
            reassembled.extend_from_slice(data);
        }

        let packet = Ipv4Packet {
            src: header.src,
            dst: header.dst,
            protocol: header.protocol,
            identification: header.identification,
            ttl: header.ttl,
            payload: reassembled,
        };
        self.fragment_buffers.remove(&key);
        Some(packet)
    }

    /// Drop reassembly buffers idle past the timeout.  Incomplete data is
    /// discarded silently.
    fn evict_stale_fragments(&mut self, now: u64) {
        self.fragment_buffers
            .retain(|_, buffer| now.saturating_sub(buffer.last_accessed) <= FRAGMENT_TIMEOUT);
    }
}

kernel_singleton!(IP, Mutex, IpLayer, IpLayer::new(), with_ip);

// ── Public interface ────────────────────────────────────────

/// Subscribe the IP layer to ethernet ingress.
pub fn init() {
    ethernet::register_handler(ETHERTYPE_IPV4, |frame| process_packet(frame.payload));
    crate::info!("IP", "ip layer initialized");
}

/// Configure an interface over a registered ethernet device.  Installs
/// the connected route, plus the default route when a gateway is given.
pub fn add_interface(
    device_index: usize,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Ipv4Addr,
) -> Option<usize> {
    let mac = ethernet::device_mac(device_index)?;

    with_ip(|ip| {
        let index = ip.interfaces.len();
        ip.interfaces.push(Interface {
            index,
            address,
            netmask,
            gateway,
            mac,
            is_up: true,
            mtu: 1500,
            device_index,
        });

        let network = Ipv4Addr::from_u32(address.to_u32() & netmask.to_u32());
        ip.routing_table.push(RouteEntry {
            network,
            netmask,
            gateway: Ipv4Addr::ANY,
            interface_index: index,
            metric: 0,
        });

        if !gateway.is_unspecified() {
            ip.routing_table.push(RouteEntry {
                network: Ipv4Addr::ANY,
                netmask: Ipv4Addr::ANY,
                gateway,
                interface_index: index,
                metric: 1,
            });
        }

        crate::info!("IP", "interface {}: {}/{} via {}", index, address, netmask, gateway);
        Some(index)
    })
}

/// Add a manual route.
pub fn add_route(
    network: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Ipv4Addr,
    interface_index: usize,
    metric: u32,
) -> bool {
    with_ip(|ip| {
        if interface_index >= ip.interfaces.len() {
            return false;
        }
        ip.routing_table.push(RouteEntry {
            network,
            netmask,
            gateway,
            interface_index,
            metric,
        });
        true
    })
}

/// The address of the first configured interface, if any.
pub fn primary_address() -> Option<Ipv4Addr> {
    with_ip(|ip| ip.interfaces.first().map(|iface| iface.address))
}

/// Register a protocol handler (e.g. TCP = 6, UDP = 17).
pub fn register_protocol_handler(protocol: u8, handler: PacketHandler) {
    with_ip(|ip| ip.handlers.push((protocol, handler)));
}

/// Ingress entry: validate, reassemble if fragmented, dispatch.
pub fn process_packet(raw: &[u8]) {
    let Some(header) = parse_header(raw) else {
        return; // silent drop
    };
    let payload = &raw[header.header_len..header.total_len];

    if header.fragment_offset > 0 || header.more_fragments {
        let now = crate::time::now();
        let completed = with_ip(|ip| ip.process_fragment(&header, payload, now));
        if let Some(packet) = completed {
            dispatch(&packet);
        }
        return;
    }

    let packet = Ipv4Packet {
        src: header.src,
        dst: header.dst,
        protocol: header.protocol,
        identification: header.identification,
        ttl: header.ttl,
        payload: payload.to_vec(),
    };
    dispatch(&packet);
}

/// Invoke every matching protocol handler.  The handler list is copied
/// out first so handlers can take the layer lock themselves (to send).
fn dispatch(packet: &Ipv4Packet) {
    let handlers = with_ip(|ip| ip.handlers_for(packet.protocol));
    for handler in handlers {
        handler(packet);
    }
}

/// Periodic maintenance: evict stale fragment buffers.
pub fn poll() {
    let now = crate::time::now();
    with_ip(|ip| ip.evict_stale_fragments(now));
}

/// Build and transmit one IPv4 packet: route lookup, header construction,
/// link-layer emit through the chosen interface.
pub fn send_packet(dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Result<(), NetError> {
    let (device_index, dst_mac, packet) = with_ip(|ip| {
        let route = ip.find_route(dst).ok_or(NetError::NetworkUnreachable)?;
        let iface = ip.interfaces[route.interface_index];

        let id = ip.identification_counter;
        ip.identification_counter = ip.identification_counter.wrapping_add(1);

        let total_len = (HEADER_SIZE + payload.len()) as u16;
        let mut packet = Vec::with_capacity(total_len as usize);
        packet.push(0x45); // version 4, IHL 5
        packet.push(0x00); // DSCP/ECN
        packet.extend_from_slice(&total_len.to_be_bytes());
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(&[0x00, 0x00]); // DF=0, MF=0, offset 0
        packet.push(DEFAULT_TTL);
        packet.push(protocol);
        packet.extend_from_slice(&[0x00, 0x00]); // checksum placeholder
        packet.extend_from_slice(&iface.address.0);
        packet.extend_from_slice(&dst.0);

        let cksum = checksum(&packet[..HEADER_SIZE]);
        packet[10] = (cksum >> 8) as u8;
        packet[11] = cksum as u8;

        packet.extend_from_slice(payload);

        // Next hop: the gateway, or the destination itself when on-link.
        // Without a neighbor cache the link layer falls back to the
        // broadcast MAC.
        let _next_hop = if route.gateway.is_unspecified() {
            dst
        } else {
            route.gateway
        };
        let dst_mac = MacAddress::BROADCAST;

        Ok::<_, NetError>((iface.device_index, dst_mac, packet))
    })?;

    ethernet::send_frame(device_index, dst_mac, ETHERTYPE_IPV4, &packet)
}
