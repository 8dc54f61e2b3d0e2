//! Ethernet frame layer.
//!
//! Parses and constructs Ethernet II frames and owns the device registry.
//! Upper layers subscribe by ethertype; drivers deliver received frames
//! through `poll_receive` and the dispatch happens outside the registry
//! lock so handlers can transmit.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use super::NetError;
use crate::kernel_singleton;

/// EtherType: IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType: ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Minimum Ethernet frame size (without FCS).
pub const MIN_FRAME_SIZE: usize = 60;
/// Maximum Ethernet payload (MTU).
pub const MAX_PAYLOAD: usize = 1500;
/// Ethernet header size.
pub const HEADER_SIZE: usize = 14;

/// MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// A parsed Ethernet frame (header + payload reference).
#[derive(Debug)]
pub struct EthernetFrame<'a> {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    /// Parse raw bytes; `None` if the frame is too short.
    pub fn parse(raw: &'a [u8]) -> Option<Self> {
        if raw.len() < HEADER_SIZE {
            return None;
        }

        let dst = MacAddress::new([raw[0], raw[1], raw[2], raw[3], raw[4], raw[5]]);
        let src = MacAddress::new([raw[6], raw[7], raw[8], raw[9], raw[10], raw[11]]);
        let ethertype = u16::from_be_bytes([raw[12], raw[13]]);

        Some(EthernetFrame {
            dst,
            src,
            ethertype,
            payload: &raw[HEADER_SIZE..],
        })
    }

    pub fn is_for_us(&self, our_mac: &MacAddress) -> bool {
        self.dst == *our_mac || self.dst.is_broadcast()
    }
}

/// Build a raw frame, padded to the 60-byte minimum.
pub fn build_frame(dst: MacAddress, src: MacAddress, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let total = HEADER_SIZE + payload.len();
    let mut frame = Vec::with_capacity(total.max(MIN_FRAME_SIZE));

    frame.extend_from_slice(dst.as_bytes());
    frame.extend_from_slice(src.as_bytes());
    frame.push((ethertype >> 8) as u8);
    frame.push(ethertype as u8);
    frame.extend_from_slice(payload);
    while frame.len() < MIN_FRAME_SIZE {
        frame.push(0);
    }

    frame
}

/// An Ethernet device as the stack sees it.  Hardware drivers implement
/// this over their descriptor rings.
pub trait EthernetDevice: Send {
    fn mac_address(&self) -> MacAddress;

    fn mtu(&self) -> u16 {
        MAX_PAYLOAD as u16
    }

    /// Transmit one complete frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), NetError>;

    /// Pop one received frame, if the device has any pending.
    fn poll_receive(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// Handler invoked for every received frame of a subscribed ethertype.
pub type FrameHandler = fn(&EthernetFrame<'_>);

/// Device registry plus ethertype subscriptions.
pub struct EthernetManager {
    devices: Vec<Box<dyn EthernetDevice>>,
    handlers: Vec<(u16, FrameHandler)>,
}

impl EthernetManager {
    pub const fn new() -> Self {
        EthernetManager {
            devices: Vec::new(),
            handlers: Vec::new(),
        }
    }
}

kernel_singleton!(
    ETHERNET,
    Mutex,
    EthernetManager,
    EthernetManager::new(),
    with_ethernet
);

/// Register a device; returns its index.
pub fn register_device(device: Box<dyn EthernetDevice>) -> usize {
    let mac = device.mac_address();
    let index = with_ethernet(|eth| {
        eth.devices.push(device);
        eth.devices.len() - 1
    });
    crate::info!("NET", "registered ethernet device {} ({})", index, mac);
    index
}

pub fn device_count() -> usize {
    with_ethernet(|eth| eth.devices.len())
}

pub fn device_mac(index: usize) -> Option<MacAddress> {
    with_ethernet(|eth| eth.devices.get(index).map(|d| d.mac_address()))
}

/// Subscribe to an ethertype.  Registration order is not observable.
pub fn register_handler(ethertype: u16, handler: FrameHandler) {
    with_ethernet(|eth| eth.handlers.push((ethertype, handler)));
}

/// Dispatch one raw frame to every matching subscriber.  The handler list
/// is copied out first so handlers are free to transmit.
pub fn handle_frame(raw: &[u8]) {
    let Some(frame) = EthernetFrame::parse(raw) else {
        return;
    };

    let handlers: Vec<FrameHandler> = with_ethernet(|eth| {
        eth.handlers
            .iter()
            .filter(|(ethertype, _)| *ethertype == frame.ethertype)
            .map(|&(_, handler)| handler)
            .collect()
    });

    for handler in handlers {
        handler(&frame);
    }
}

/// Transmit a payload through a device, wrapping it in a frame.
pub fn send_frame(
    device_index: usize,
    dst: MacAddress,
    ethertype: u16,
    payload: &[u8],
) -> Result<(), NetError> {
    with_ethernet(|eth| {
        let device = eth
            .devices
            .get_mut(device_index)
            .ok_or(NetError::InvalidArgument)?;
        let frame = build_frame(dst, device.mac_address(), ethertype, payload);
        device.send(&frame)
    })
}

/// Drain every device's pending receive frames and dispatch them.
pub fn poll_rx() {
    loop {
        let frames: Vec<Vec<u8>> = with_ethernet(|eth| {
            let mut frames = Vec::new();
            for device in eth.devices.iter_mut() {
                while let Some(frame) = device.poll_receive() {
                    frames.push(frame);
                }
            }
            frames
        });
        if frames.is_empty() {
            break;
        }
        for frame in frames {
            handle_frame(&frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_short_frames() {
        assert!(EthernetFrame::parse(&[0u8; 13]).is_none());
        assert!(EthernetFrame::parse(&[0u8; 14]).is_some());
    }

    #[test]
    fn build_and_parse_roundtrip() {
        let dst = MacAddress::new([1, 2, 3, 4, 5, 6]);
        let src = MacAddress::new([7, 8, 9, 10, 11, 12]);
        let frame = build_frame(dst, src, ETHERTYPE_IPV4, b"hello");

        assert_eq!(frame.len(), MIN_FRAME_SIZE);
        let parsed = EthernetFrame::parse(&frame).unwrap();
        assert_eq!(parsed.dst, dst);
        assert_eq!(parsed.src, src);
        assert_eq!(parsed.ethertype, ETHERTYPE_IPV4);
        assert_eq!(&parsed.payload[..5], b"hello");
    }

    #[test]
    fn broadcast_frames_are_for_everyone() {
        let frame = build_frame(
            MacAddress::BROADCAST,
            MacAddress::new([1, 1, 1, 1, 1, 1]),
            ETHERTYPE_ARP,
            &[],
        );
        let parsed = EthernetFrame::parse(&frame).unwrap();
        assert!(parsed.is_for_us(&MacAddress::new([9, 9, 9, 9, 9, 9])));
    }

    #[test]
    fn long_payloads_are_not_padded() {
        let payload = [0xAB; 100];
        let frame = build_frame(MacAddress::ZERO, MacAddress::ZERO, 0x0800, &payload);
        assert_eq!(frame.len(), HEADER_SIZE + 100);
    }
}
