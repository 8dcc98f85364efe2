//! Core USB protocol types shared by all host controller personalities.
//!
//! # References
//! - USB Specification Revision 2.0, chapter 8 (protocol) and 9 (device
//!   framework)

use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of the SETUP stage payload of a control transfer.
pub const SETUP_PACKET_SIZE: usize = 8;

/// Transfer direction, seen from the host.
///
/// `Both` is the sentinel used for the SETUP stage of control transfers:
/// the packet itself is host-to-device, but the transfer may continue in
/// either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    Both,
}

impl Direction {
    /// Direction of the status stage that concludes a control transfer
    /// going in `self` direction.
    pub fn reverse(self) -> Direction {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
            Direction::Both => Direction::Both,
        }
    }
}

/// USB transfer types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Device speeds understood by the USB 2.0 controller generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
}

impl UsbSpeed {
    /// Default max packet size of the default control endpoint.
    pub fn default_max_packet_size(self) -> u16 {
        match self {
            UsbSpeed::Low => 8,
            UsbSpeed::Full => 8,
            UsbSpeed::High => 64,
        }
    }

    /// True for the USB 1.1 speeds that need a transaction translator
    /// when operated behind a high-speed hub.
    pub fn is_11(self) -> bool {
        self < UsbSpeed::High
    }
}

/// Address of one endpoint on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Device address, 0-127.
    pub address: u8,
    /// Endpoint number, 0-15.
    pub endpoint: u8,
}

/// USB packet identifiers used in token packets.
///
/// UHCI wants the raw PID byte in its transfer descriptors; the other
/// controllers encode the PID in two bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketId {
    In = 0x69,
    Out = 0xe1,
    Setup = 0x2d,
}

impl From<Direction> for PacketId {
    fn from(dir: Direction) -> Self {
        match dir {
            Direction::In => PacketId::In,
            Direction::Out => PacketId::Out,
            Direction::Both => PacketId::Setup,
        }
    }
}

/// The 8-byte packet sent in the SETUP stage of every control transfer.
///
/// Byte order on the bus is little-endian; the typed accessors convert.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: U16,
    pub index: U16,
    pub length: U16,
}

impl SetupPacket {
    pub fn from_bytes(bytes: &[u8; SETUP_PACKET_SIZE]) -> SetupPacket {
        SetupPacket::read_from_bytes(&bytes[..]).unwrap()
    }

    pub fn value(&self) -> u16 {
        self.value.get()
    }

    pub fn index(&self) -> u16 {
        self.index.get()
    }

    pub fn length(&self) -> u16 {
        self.length.get()
    }

    /// Direction of the data stage, from the request-type bit 7.
    pub fn direction(&self) -> Direction {
        if self.request_type & request_type::DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Request-type field bits (USB 2.0, table 9-2).
pub mod request_type {
    pub const DIR_IN: u8 = 0x80;
    pub const DIR_OUT: u8 = 0x00;

    pub const TYPE_MASK: u8 = 0x60;
    pub const TYPE_STANDARD: u8 = 0x00;
    pub const TYPE_CLASS: u8 = 0x20;
    pub const TYPE_VENDOR: u8 = 0x40;

    pub const RECIPIENT_MASK: u8 = 0x1f;
    pub const RECIPIENT_DEVICE: u8 = 0x00;
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
    pub const RECIPIENT_ENDPOINT: u8 = 0x02;
    pub const RECIPIENT_OTHER: u8 = 0x03;
}

/// Standard request codes (USB 2.0, table 9-4).
pub mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
}

/// Standard descriptor type codes (USB 2.0, table 9-5).
pub mod desc_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const HUB: u8 = 0x29;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_layout() {
        let raw = [0x80u8, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = SetupPacket::from_bytes(&raw);
        assert_eq!(setup.request_type, 0x80);
        assert_eq!(setup.request, request::GET_DESCRIPTOR);
        assert_eq!(setup.value(), 0x0100);
        assert_eq!(setup.index(), 0);
        assert_eq!(setup.length(), 18);
        assert_eq!(setup.direction(), Direction::In);
    }

    #[test]
    fn control_stage_directions() {
        assert_eq!(Direction::In.reverse(), Direction::Out);
        assert_eq!(Direction::Out.reverse(), Direction::In);
        assert_eq!(PacketId::from(Direction::Both), PacketId::Setup);
    }

    #[test]
    fn speed_defaults() {
        assert_eq!(UsbSpeed::High.default_max_packet_size(), 64);
        assert!(UsbSpeed::Full.is_11());
        assert!(!UsbSpeed::High.is_11());
    }
}
