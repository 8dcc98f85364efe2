//! EHCI register blocks: read-only capability registers and the
//! operational block that starts `caplength` bytes after them.
//!
//! # References
//! - Enhanced Host Controller Interface Specification, revision 1.0,
//!   chapter 2

use tock_registers::interfaces::Readable;
use tock_registers::registers::{ReadOnly, ReadWrite};

use crate::hub::MAX_PORTS;

/// Capability registers at the start of the MMIO range.
#[repr(C)]
pub struct EhciCapRegs {
    pub caplength: ReadOnly<u8>,
    _reserved: u8,
    pub hciversion: ReadOnly<u16>,
    pub hcsparams: ReadOnly<u32>,
    pub hccparams: ReadOnly<u32>,
    pub hcsp_portroute: [ReadOnly<u8>; 8],
}

/// HCSPARAMS bits.
pub mod hcsparams {
    pub const N_PORTS_MASK: u32 = 0xf;
    /// Ports have power switches.
    pub const PPC: u32 = 1 << 4;
    pub const ROUTING: u32 = 1 << 7;
    pub const N_PCC_SHIFT: u32 = 8;
    pub const N_PCC_MASK: u32 = 0xf;
    pub const N_CC_SHIFT: u32 = 12;
    pub const N_CC_MASK: u32 = 0xf;
    /// Port indicator LEDs present.
    pub const INDICATORS: u32 = 1 << 16;
}

/// HCCPARAMS bits.
pub mod hccparams {
    pub const ADDR64: u32 = 1 << 0;
    pub const PROG_FRAME_LIST: u32 = 1 << 1;
    pub const ASYNC_PARK: u32 = 1 << 2;
    pub const EECP_SHIFT: u32 = 8;
    pub const EECP_MASK: u32 = 0xff;
}

/// Operational registers.
#[repr(C)]
pub struct EhciOpRegs {
    pub usbcmd: ReadWrite<u32>,
    pub usbsts: ReadWrite<u32>,
    pub usbintr: ReadWrite<u32>,
    pub frindex: ReadWrite<u32>,
    pub ctrldssegment: ReadWrite<u32>,
    pub periodiclistbase: ReadWrite<u32>,
    pub asynclistaddr: ReadWrite<u32>,
    _reserved: [u32; 9],
    pub configflag: ReadWrite<u32>,
    pub portsc: [ReadWrite<u32>; MAX_PORTS],
}

pub use crate::mem::{clr_bits, rd, set_bits, wr};

/// Read an 8-bit capability register.
pub fn rd8(reg: &ReadOnly<u8>) -> u8 {
    reg.get()
}

/// Read a 16-bit capability register.
pub fn rd16(reg: &ReadOnly<u16>) -> u16 {
    u16::from_le(reg.get())
}

/// Read a 32-bit capability register.
pub fn rd32(reg: &ReadOnly<u32>) -> u32 {
    u32::from_le(reg.get())
}

/// USBCMD bits.
pub mod cmd {
    pub const RUN: u32 = 1 << 0;
    pub const HCRESET: u32 = 1 << 1;
    pub const FRAME_LIST_SIZE_SHIFT: u32 = 2;
    pub const FRAME_LIST_SIZE_MASK: u32 = 0x3;
    pub const FRAME_LIST_SIZE_1024: u32 = 0x0;
    pub const PERIODIC_ENABLE: u32 = 1 << 4;
    pub const ASYNC_ENABLE: u32 = 1 << 5;
    pub const ASYNC_DOORBELL: u32 = 1 << 6;
    pub const LIGHT_RESET: u32 = 1 << 7;
    pub const PARK_COUNT_SHIFT: u32 = 8;
    pub const PARK_COUNT_MASK: u32 = 0x3;
    pub const PARK_ENABLE: u32 = 1 << 11;
    pub const ITC_SHIFT: u32 = 16;
    pub const ITC_MASK: u32 = 0xff;
}

/// USBSTS bits; the low six are write-1-to-clear.
pub mod sts {
    pub const IRQ: u32 = 1 << 0;
    pub const ERR_IRQ: u32 = 1 << 1;
    pub const PORT_CHANGE: u32 = 1 << 2;
    pub const FRAME_ROLLOVER: u32 = 1 << 3;
    pub const HOST_ERROR: u32 = 1 << 4;
    pub const ASYNC_ADVANCE: u32 = 1 << 5;
    pub const HC_HALTED: u32 = 1 << 12;
    pub const RECLAMATION: u32 = 1 << 13;
    pub const PERIODIC_STATUS: u32 = 1 << 14;
    pub const ASYNC_STATUS: u32 = 1 << 15;

    pub const ALL_IRQS: u32 =
        IRQ | ERR_IRQ | PORT_CHANGE | FRAME_ROLLOVER | HOST_ERROR | ASYNC_ADVANCE;
}

/// USBINTR enable bits mirror the low status bits.
pub mod intr {
    pub const IRQ: u32 = 1 << 0;
    pub const ERR_IRQ: u32 = 1 << 1;
    pub const PORT_CHANGE: u32 = 1 << 2;
    pub const FRAME_ROLLOVER: u32 = 1 << 3;
    pub const HOST_ERROR: u32 = 1 << 4;
    pub const ASYNC_ADVANCE: u32 = 1 << 5;
}

/// PORTSC bits.
pub mod portsc {
    pub const CONNECT: u32 = 1 << 0;
    pub const CONNECT_CHANGE: u32 = 1 << 1;
    pub const ENABLED: u32 = 1 << 2;
    pub const ENABLE_CHANGE: u32 = 1 << 3;
    pub const OC_ACTIVE: u32 = 1 << 4;
    pub const OC_CHANGE: u32 = 1 << 5;
    pub const RESUME: u32 = 1 << 6;
    pub const SUSPEND: u32 = 1 << 7;
    pub const RESET: u32 = 1 << 8;
    pub const LINE_STATUS_SHIFT: u32 = 10;
    pub const LINE_STATUS_MASK: u32 = 0x3 << LINE_STATUS_SHIFT;
    pub const LINE_STATUS_SE0: u32 = 0x0 << LINE_STATUS_SHIFT;
    /// K-state: a low-speed device is attached.
    pub const LINE_STATUS_K: u32 = 0x1 << LINE_STATUS_SHIFT;
    pub const LINE_STATUS_J: u32 = 0x2 << LINE_STATUS_SHIFT;
    pub const PORT_POWER: u32 = 1 << 12;
    /// Companion controller owns the port.
    pub const PORT_OWNER: u32 = 1 << 13;
    pub const INDICATOR_SHIFT: u32 = 14;
    pub const INDICATOR_MASK: u32 = 0x3 << INDICATOR_SHIFT;
    pub const TEST_SHIFT: u32 = 16;
    pub const TEST_MASK: u32 = 0xf << TEST_SHIFT;
    pub const WAKE_CONNECT: u32 = 1 << 20;
    pub const WAKE_DISCONNECT: u32 = 1 << 21;
    pub const WAKE_OC: u32 = 1 << 22;

    /// Write-1-to-clear change bits, masked out of read-modify-writes.
    pub const WC_MASK: u32 = CONNECT_CHANGE | ENABLE_CHANGE | OC_CHANGE;
}

/// PERIODICLISTBASE must be page aligned, ASYNCLISTADDR 32-byte aligned.
pub const PERIODIC_LIST_BASE_MASK: u32 = 0xffff_f000;
pub const ASYNC_LIST_MASK: u32 = 0xffff_ffe0;

/// EHCI Legacy Support extended capability, reached through PCI config
/// space at the EECP offset.
pub mod legacy {
    /// Capability ID of Legacy Support.
    pub const CAP_ID_LEGSUP: u8 = 0x01;
    pub const USBLEGSUP_OFFSET: u16 = 0;
    pub const USBLEGSUP_BIOS_OWNED: u32 = 1 << 16;
    pub const USBLEGSUP_OS_OWNED: u32 = 1 << 24;
    /// Byte offsets of the two ownership semaphores within USBLEGSUP.
    pub const BIOS_OWNED_BYTE: u16 = 2;
    pub const OS_OWNED_BYTE: u16 = 3;
    pub const USBLEGCTLSTS_OFFSET: u16 = 4;
    /// The SMI enables are zeroed; the top three bits are write-1-to-clear
    /// status.
    pub const USBLEGCTLSTS_CLEAR: u32 = 0xe000_0000;
}
