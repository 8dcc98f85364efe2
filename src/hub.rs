//! Virtual hub base.
//!
//! Every personality presents its root ports as an ordinary USB 2.0 hub.
//! The per-controller code only knows how to read and poke its port
//! registers; the hub-class protocol itself (descriptor synthesis, request
//! decoding, the status-change pipe format) is shared and lives here.
//!
//! # References
//! - USB Specification Revision 2.0, chapter 11.24 (hub class requests)

use bitflags::bitflags;

use crate::error::{Result, UsbError};
use crate::usb::{desc_type, request, request_type, SetupPacket, UsbSpeed};

/// Feature selectors for hub and port requests (USB 2.0, table 11-17).
pub mod feature {
    pub const C_HUB_LOCAL_POWER: u16 = 0;
    pub const C_HUB_OVER_CURRENT: u16 = 1;

    pub const PORT_CONNECTION: u16 = 0;
    pub const PORT_ENABLE: u16 = 1;
    pub const PORT_SUSPEND: u16 = 2;
    pub const PORT_OVER_CURRENT: u16 = 3;
    pub const PORT_RESET: u16 = 4;
    pub const PORT_POWER: u16 = 8;
    pub const PORT_LOW_SPEED: u16 = 9;
    pub const C_PORT_CONNECTION: u16 = 16;
    pub const C_PORT_ENABLE: u16 = 17;
    pub const C_PORT_SUSPEND: u16 = 18;
    pub const C_PORT_OVER_CURRENT: u16 = 19;
    pub const C_PORT_RESET: u16 = 20;
    pub const PORT_TEST: u16 = 21;
    pub const PORT_INDICATOR: u16 = 22;
}

bitflags! {
    /// The combined wPortStatus | wPortChange << 16 word returned by
    /// GetPortStatus (USB 2.0, tables 11-21 and 11-22).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatus: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        const TEST = 1 << 11;
        const INDICATOR = 1 << 12;

        const C_CONNECTION = 1 << 16;
        const C_ENABLE = 1 << 17;
        const C_SUSPEND = 1 << 18;
        const C_OVER_CURRENT = 1 << 19;
        const C_RESET = 1 << 20;
    }
}

/// wHubCharacteristics pieces (USB 2.0, table 11-13).
pub mod characteristics {
    pub const POWER_GANGED: u16 = 0x00;
    pub const POWER_PER_PORT: u16 = 0x01;
    pub const POWER_NONE: u16 = 0x02;
    pub const COMPOUND_DEVICE: u16 = 1 << 2;
    pub const OC_GLOBAL: u16 = 0x00;
    pub const OC_PER_PORT: u16 = 0x08;
    pub const OC_NONE: u16 = 0x10;
    /// Port indicator LEDs are present (bit 7).
    pub const PORT_INDICATORS: u16 = 1 << 7;
    /// TT think time, 32 FS bit times. Meaningless for a root hub but the
    /// field must hold something.
    pub const TT_THINK_TIME_32: u16 = 0x3 << 5;
}

/// Bytes in the status-change bitmap for `ports` ports (hub bit + one bit
/// per port, rounded up).
pub const fn status_bytes(ports: usize) -> usize {
    (ports + 1 + 7) / 8
}

/// Ingredients of the synthesized hub class descriptor.
#[derive(Debug, Clone, Copy)]
pub struct HubDescriptor {
    pub port_count: u8,
    pub characteristics: u16,
    /// Time from power-on to power-good, in 2 ms units.
    pub power_good_time: u8,
    /// Maximum controller current, mA. Root hubs draw nothing.
    pub max_current: u8,
}

impl HubDescriptor {
    /// Serialize into `buf`, returning the descriptor length.
    ///
    /// The DeviceRemovable bitmap is all zero (nothing about a root port is
    /// permanently attached) and the legacy PortPwrCtrlMask is all ones.
    pub fn write_to(&self, buf: &mut [u8]) -> usize {
        let bitmap = status_bytes(self.port_count as usize);
        let len = 7 + 2 * bitmap;
        let mut desc = [0u8; 7 + 2 * status_bytes(MAX_PORTS)];
        desc[0] = len as u8;
        desc[1] = desc_type::HUB;
        desc[2] = self.port_count;
        desc[3] = self.characteristics as u8;
        desc[4] = (self.characteristics >> 8) as u8;
        desc[5] = self.power_good_time;
        desc[6] = self.max_current;
        for byte in &mut desc[7 + bitmap..len] {
            *byte = 0xff;
        }
        let n = len.min(buf.len());
        buf[..n].copy_from_slice(&desc[..n]);
        n
    }
}

/// Upper bound on root ports across the personalities (EHCI HCSPARAMS
/// N_PORTS is 4 bits).
pub const MAX_PORTS: usize = 15;

/// What a personality root hub provides to the shared protocol engine.
pub trait HubOps {
    fn port_count(&self) -> usize;

    fn hub_descriptor(&self) -> HubDescriptor;

    /// Hub status + change word. Root hubs have no local power source and
    /// usually no global over-current reporting, so this is typically 0.
    fn hub_status(&self) -> u32;

    /// Translated port status word for a 0-based port.
    fn port_status(&self, port: usize) -> PortStatus;

    fn clear_hub_feature(&self, feature: u16) -> Result<()>;

    fn set_hub_feature(&self, _feature: u16) -> Result<()> {
        Ok(())
    }

    fn clear_port_feature(&self, port: usize, feature: u16) -> Result<()>;

    fn set_port_feature(&self, port: usize, feature: u16) -> Result<()>;

    /// Status-change bitmask: bit 0 = hub, bit n = port n (1-based).
    /// Zero means nothing to report.
    fn status_change(&self) -> u16;
}

/// State of the emulated hub device itself: assigned bus address and the
/// selected configuration.
pub struct VirtHub {
    speed: UsbSpeed,
    address: spin::Mutex<u8>,
    configuration: spin::Mutex<u8>,
}

impl VirtHub {
    pub fn new(speed: UsbSpeed) -> VirtHub {
        VirtHub {
            speed,
            address: spin::Mutex::new(crate::bus::DEFAULT_ADDRESS),
            configuration: spin::Mutex::new(0),
        }
    }

    pub fn address(&self) -> u8 {
        *self.address.lock()
    }

    pub fn set_address(&self, address: u8) {
        *self.address.lock() = address;
    }

    /// Execute one control request against the hub.
    ///
    /// IN data is written to `data` and its length returned. Requests the
    /// hub does not implement fail with `Stall`, which the controller
    /// reports as the transfer outcome.
    pub fn control_request(
        &self,
        ops: &dyn HubOps,
        setup: &SetupPacket,
        data: &mut [u8],
    ) -> Result<usize> {
        let recipient = setup.request_type & request_type::RECIPIENT_MASK;
        let class = setup.request_type & request_type::TYPE_MASK;

        match (class, recipient, setup.request) {
            (request_type::TYPE_STANDARD, request_type::RECIPIENT_DEVICE, r) => {
                self.standard_request(ops, setup, r, data)
            }
            (request_type::TYPE_CLASS, request_type::RECIPIENT_DEVICE, request::GET_DESCRIPTOR) => {
                Ok(ops.hub_descriptor().write_to(clamp(data, setup.length())))
            }
            (request_type::TYPE_CLASS, request_type::RECIPIENT_DEVICE, request::GET_STATUS) => {
                if setup.length() != 4 || data.len() < 4 {
                    return Err(UsbError::Stall);
                }
                data[..4].copy_from_slice(&ops.hub_status().to_le_bytes());
                Ok(4)
            }
            (request_type::TYPE_CLASS, request_type::RECIPIENT_DEVICE, request::CLEAR_FEATURE) => {
                ops.clear_hub_feature(setup.value()).map(|_| 0)
            }
            (request_type::TYPE_CLASS, request_type::RECIPIENT_DEVICE, request::SET_FEATURE) => {
                ops.set_hub_feature(setup.value()).map(|_| 0)
            }
            (request_type::TYPE_CLASS, request_type::RECIPIENT_OTHER, request::GET_STATUS) => {
                if setup.length() != 4 || data.len() < 4 {
                    return Err(UsbError::Stall);
                }
                let port = port_index(ops, setup)?;
                let status = ops.port_status(port).bits();
                data[..4].copy_from_slice(&status.to_le_bytes());
                Ok(4)
            }
            (request_type::TYPE_CLASS, request_type::RECIPIENT_OTHER, request::CLEAR_FEATURE) => {
                let port = port_index(ops, setup)?;
                ops.clear_port_feature(port, setup.value()).map(|_| 0)
            }
            (request_type::TYPE_CLASS, request_type::RECIPIENT_OTHER, request::SET_FEATURE) => {
                let port = port_index(ops, setup)?;
                ops.set_port_feature(port, setup.value()).map(|_| 0)
            }
            _ => Err(UsbError::Stall),
        }
    }

    /// Answer the status-change interrupt pipe from the current port state.
    ///
    /// Returns `Again` when there is nothing to report; the controller
    /// parks the batch until its next root-hub interrupt.
    pub fn status_change_request(&self, ops: &dyn HubOps, data: &mut [u8]) -> Result<usize> {
        let bytes = status_bytes(ops.port_count());
        if data.len() < bytes {
            return Err(UsbError::Stall);
        }
        let mask = ops.status_change();
        if mask == 0 {
            return Err(UsbError::Again);
        }
        let le = mask.to_le_bytes();
        data[..bytes].copy_from_slice(&le[..bytes]);
        Ok(bytes)
    }

    fn standard_request(
        &self,
        ops: &dyn HubOps,
        setup: &SetupPacket,
        req: u8,
        data: &mut [u8],
    ) -> Result<usize> {
        match req {
            request::GET_DESCRIPTOR => match (setup.value() >> 8) as u8 {
                desc_type::DEVICE => Ok(fill(
                    clamp(data, setup.length()),
                    &self.device_descriptor(),
                )),
                desc_type::CONFIGURATION => {
                    Ok(fill(clamp(data, setup.length()), &config_bundle(ops)))
                }
                desc_type::HUB => Ok(ops.hub_descriptor().write_to(clamp(data, setup.length()))),
                _ => Err(UsbError::Stall),
            },
            request::SET_ADDRESS => {
                if setup.value() >= 128 {
                    return Err(UsbError::Stall);
                }
                self.set_address(setup.value() as u8);
                Ok(0)
            }
            request::GET_CONFIGURATION => {
                if data.is_empty() {
                    return Err(UsbError::Stall);
                }
                data[0] = *self.configuration.lock();
                Ok(1)
            }
            request::SET_CONFIGURATION => {
                if setup.value() > 1 {
                    return Err(UsbError::Stall);
                }
                *self.configuration.lock() = setup.value() as u8;
                Ok(0)
            }
            request::GET_STATUS => {
                if data.len() < 2 {
                    return Err(UsbError::Stall);
                }
                // Self-powered, no remote wakeup.
                data[..2].copy_from_slice(&1u16.to_le_bytes());
                Ok(2)
            }
            _ => Err(UsbError::Stall),
        }
    }

    fn device_descriptor(&self) -> [u8; 18] {
        let max_packet0 = self.speed.default_max_packet_size().max(8) as u8;
        [
            18,                // bLength
            desc_type::DEVICE, // bDescriptorType
            0x00,
            0x02, // bcdUSB 2.0
            0x09, // bDeviceClass: hub
            0x00, // bDeviceSubClass
            0x00, // bDeviceProtocol
            max_packet0,
            0x00,
            0x00, // idVendor
            0x00,
            0x00, // idProduct
            0x00,
            0x01, // bcdDevice
            0x00, // iManufacturer
            0x00, // iProduct
            0x00, // iSerialNumber
            0x01, // bNumConfigurations
        ]
    }
}

/// Configuration + interface + status-change endpoint descriptors in one
/// GET_DESCRIPTOR(CONFIGURATION) response.
fn config_bundle(ops: &dyn HubOps) -> [u8; 25] {
    let pipe_bytes = status_bytes(ops.port_count()) as u8;
    [
        // Configuration descriptor
        9,
        desc_type::CONFIGURATION,
        25,
        0, // wTotalLength
        1, // bNumInterfaces
        1, // bConfigurationValue
        0, // iConfiguration
        0xc0, // bmAttributes: self-powered
        0, // bMaxPower
        // Interface descriptor
        9,
        desc_type::INTERFACE,
        0, // bInterfaceNumber
        0, // bAlternateSetting
        1, // bNumEndpoints
        0x09, // bInterfaceClass: hub
        0,
        0,
        0, // iInterface
        // Status change endpoint descriptor
        7,
        desc_type::ENDPOINT,
        0x81, // IN, endpoint 1
        0x03, // interrupt
        pipe_bytes,
        0,    // wMaxPacketSize
        0xff, // bInterval
    ]
}

fn port_index(ops: &dyn HubOps, setup: &SetupPacket) -> Result<usize> {
    let port = (setup.index() as usize)
        .checked_sub(1)
        .ok_or(UsbError::BadArgument)?;
    if port >= ops.port_count() {
        return Err(UsbError::BadArgument);
    }
    Ok(port)
}

fn clamp(data: &mut [u8], requested: u16) -> &mut [u8] {
    let n = (requested as usize).min(data.len());
    &mut data[..n]
}

fn fill(buf: &mut [u8], desc: &[u8]) -> usize {
    let n = desc.len().min(buf.len());
    buf[..n].copy_from_slice(&desc[..n]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::SETUP_PACKET_SIZE;
    use std::sync::Mutex;

    struct FakeHub {
        ports: usize,
        change: u16,
        log: Mutex<Vec<(usize, u16, bool)>>,
    }

    impl FakeHub {
        fn new(ports: usize, change: u16) -> FakeHub {
            FakeHub {
                ports,
                change,
                log: Mutex::new(Vec::new()),
            }
        }
    }

    impl HubOps for FakeHub {
        fn port_count(&self) -> usize {
            self.ports
        }
        fn hub_descriptor(&self) -> HubDescriptor {
            HubDescriptor {
                port_count: self.ports as u8,
                characteristics: characteristics::POWER_PER_PORT | characteristics::OC_NONE,
                power_good_time: 50,
                max_current: 0,
            }
        }
        fn hub_status(&self) -> u32 {
            0
        }
        fn port_status(&self, port: usize) -> PortStatus {
            if port == 0 {
                PortStatus::CONNECTION | PortStatus::POWER | PortStatus::C_CONNECTION
            } else {
                PortStatus::POWER
            }
        }
        fn clear_hub_feature(&self, feature: u16) -> Result<()> {
            if feature == feature::C_HUB_OVER_CURRENT {
                Ok(())
            } else {
                Err(UsbError::Stall)
            }
        }
        fn clear_port_feature(&self, port: usize, feature: u16) -> Result<()> {
            self.log.lock().unwrap().push((port, feature, false));
            Ok(())
        }
        fn set_port_feature(&self, port: usize, feature: u16) -> Result<()> {
            self.log.lock().unwrap().push((port, feature, true));
            Ok(())
        }
        fn status_change(&self) -> u16 {
            self.change
        }
    }

    fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
        let mut raw = [0u8; SETUP_PACKET_SIZE];
        raw[0] = request_type;
        raw[1] = request;
        raw[2..4].copy_from_slice(&value.to_le_bytes());
        raw[4..6].copy_from_slice(&index.to_le_bytes());
        raw[6..8].copy_from_slice(&length.to_le_bytes());
        SetupPacket::from_bytes(&raw)
    }

    #[test]
    fn hub_descriptor_layout() {
        let hub = FakeHub::new(4, 0);
        let mut buf = [0u8; 32];
        let len = hub.hub_descriptor().write_to(&mut buf);
        assert_eq!(len, 7 + 2);
        assert_eq!(buf[0], len as u8);
        assert_eq!(buf[1], desc_type::HUB);
        assert_eq!(buf[2], 4);
        assert_eq!(
            u16::from_le_bytes([buf[3], buf[4]]),
            characteristics::POWER_PER_PORT | characteristics::OC_NONE
        );
        assert_eq!(buf[5], 50);
        // DeviceRemovable all zero, PortPwrCtrlMask all ones.
        assert_eq!(buf[7], 0x00);
        assert_eq!(buf[8], 0xff);
    }

    #[test]
    fn get_port_status_returns_translated_word() {
        let hub = FakeHub::new(2, 0);
        let vh = VirtHub::new(UsbSpeed::High);
        let mut data = [0u8; 4];
        let s = setup(0xa3, request::GET_STATUS, 0, 1, 4);
        let n = vh.control_request(&hub, &s, &mut data).unwrap();
        assert_eq!(n, 4);
        let word = u32::from_le_bytes(data);
        assert_eq!(
            PortStatus::from_bits_truncate(word),
            PortStatus::CONNECTION | PortStatus::POWER | PortStatus::C_CONNECTION
        );
    }

    #[test]
    fn port_requests_reject_bad_index() {
        let hub = FakeHub::new(2, 0);
        let vh = VirtHub::new(UsbSpeed::High);
        let mut data = [0u8; 4];
        let s = setup(0xa3, request::GET_STATUS, 0, 0, 4);
        assert_eq!(
            vh.control_request(&hub, &s, &mut data),
            Err(UsbError::BadArgument)
        );
        let s = setup(0xa3, request::GET_STATUS, 0, 3, 4);
        assert_eq!(
            vh.control_request(&hub, &s, &mut data),
            Err(UsbError::BadArgument)
        );
    }

    #[test]
    fn set_port_feature_reaches_ops() {
        let hub = FakeHub::new(2, 0);
        let vh = VirtHub::new(UsbSpeed::High);
        let mut data = [0u8; 0];
        let s = setup(0x23, request::SET_FEATURE, feature::PORT_RESET, 2, 0);
        vh.control_request(&hub, &s, &mut data).unwrap();
        assert_eq!(*hub.log.lock().unwrap(), vec![(1, feature::PORT_RESET, true)]);
    }

    #[test]
    fn unknown_requests_stall() {
        let hub = FakeHub::new(2, 0);
        let vh = VirtHub::new(UsbSpeed::High);
        let mut data = [0u8; 8];
        let s = setup(0xa0, 0x42, 0, 0, 8);
        assert_eq!(vh.control_request(&hub, &s, &mut data), Err(UsbError::Stall));
    }

    #[test]
    fn status_change_naks_when_quiet() {
        let quiet = FakeHub::new(2, 0);
        let vh = VirtHub::new(UsbSpeed::High);
        let mut data = [0u8; 1];
        assert_eq!(
            vh.status_change_request(&quiet, &mut data),
            Err(UsbError::Again)
        );
        // NAK consumed nothing; the same request against a changed port
        // reports the bitmask.
        let changed = FakeHub::new(2, 0b0000_0010);
        let n = vh.status_change_request(&changed, &mut data).unwrap();
        assert_eq!(n, 1);
        assert_eq!(data[0], 0b10);
    }

    #[test]
    fn enumeration_requests_answered() {
        let hub = FakeHub::new(2, 0);
        let vh = VirtHub::new(UsbSpeed::Full);
        let mut data = [0u8; 64];

        let s = setup(0x80, request::GET_DESCRIPTOR, 0x0100, 0, 18);
        assert_eq!(vh.control_request(&hub, &s, &mut data).unwrap(), 18);
        assert_eq!(data[1], desc_type::DEVICE);
        assert_eq!(data[4], 0x09);

        let s = setup(0x00, request::SET_ADDRESS, 5, 0, 0);
        vh.control_request(&hub, &s, &mut data).unwrap();
        assert_eq!(vh.address(), 5);

        let s = setup(0x80, request::GET_DESCRIPTOR, 0x0200, 0, 64);
        assert_eq!(vh.control_request(&hub, &s, &mut data).unwrap(), 25);
        assert_eq!(data[1], desc_type::CONFIGURATION);
        // Interrupt IN endpoint with one bitmap byte for 2 ports.
        assert_eq!(data[20], 0x81);
        assert_eq!(data[22], 1);
    }
}
