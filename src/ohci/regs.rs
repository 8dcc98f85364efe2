//! OHCI memory-mapped register block.
//!
//! # References
//! - OpenHCI Specification for USB, release 1.0a, chapter 7

use tock_registers::registers::{ReadOnly, ReadWrite};

use crate::hub::MAX_PORTS;

/// Memory-mapped operational registers. All 32-bit, little-endian.
#[repr(C)]
pub struct OhciRegs {
    pub revision: ReadOnly<u32>,
    pub control: ReadWrite<u32>,
    pub command_status: ReadWrite<u32>,
    pub interrupt_status: ReadWrite<u32>,
    pub interrupt_enable: ReadWrite<u32>,
    pub interrupt_disable: ReadWrite<u32>,
    pub hcca: ReadWrite<u32>,
    pub periodic_current: ReadOnly<u32>,
    pub control_head: ReadWrite<u32>,
    pub control_current: ReadWrite<u32>,
    pub bulk_head: ReadWrite<u32>,
    pub bulk_current: ReadWrite<u32>,
    pub done_head: ReadOnly<u32>,
    pub fm_interval: ReadWrite<u32>,
    pub fm_remaining: ReadOnly<u32>,
    pub fm_number: ReadOnly<u32>,
    pub periodic_start: ReadWrite<u32>,
    pub ls_threshold: ReadWrite<u32>,
    pub rh_desc_a: ReadWrite<u32>,
    pub rh_desc_b: ReadWrite<u32>,
    pub rh_status: ReadWrite<u32>,
    pub rh_port_status: [ReadWrite<u32>; MAX_PORTS],
}

/// Register reads/writes share the little-endian volatile helpers with the
/// descriptor layer.
pub use crate::mem::{clr_bits, rd, set_bits, wr};

/// HcRevision bits.
pub mod revision {
    pub const REV_MASK: u32 = 0xff;
    /// Legacy keyboard/mouse emulation registers are present.
    pub const LEGACY: u32 = 1 << 8;
}

/// HcControl bits.
pub mod control {
    pub const CBSR_MASK: u32 = 0x3;
    pub const PLE: u32 = 1 << 2;
    pub const IE: u32 = 1 << 3;
    pub const CLE: u32 = 1 << 4;
    pub const BLE: u32 = 1 << 5;

    pub const HCFS_MASK: u32 = 0x3 << 6;
    pub const HCFS_RESET: u32 = 0x0 << 6;
    pub const HCFS_RESUME: u32 = 0x1 << 6;
    pub const HCFS_OPERATIONAL: u32 = 0x2 << 6;
    pub const HCFS_SUSPEND: u32 = 0x3 << 6;

    /// Interrupt routing: interrupts go to SMM while set.
    pub const IR: u32 = 1 << 8;
    pub const RWC: u32 = 1 << 9;
    pub const RWE: u32 = 1 << 10;
}

/// HcCommandStatus bits.
pub mod cmd_status {
    pub const HCR: u32 = 1 << 0;
    pub const CLF: u32 = 1 << 1;
    pub const BLF: u32 = 1 << 2;
    pub const OCR: u32 = 1 << 3;
}

/// Interrupt status/enable/disable bits.
pub mod int {
    pub const SO: u32 = 1 << 0;
    pub const WDH: u32 = 1 << 1;
    pub const SF: u32 = 1 << 2;
    pub const RD: u32 = 1 << 3;
    pub const UE: u32 = 1 << 4;
    pub const FNO: u32 = 1 << 5;
    pub const RHSC: u32 = 1 << 6;
    pub const OC: u32 = 1 << 30;
    pub const MIE: u32 = 1 << 31;
}

/// HcFmInterval fields.
pub mod fm_interval {
    pub const FI_MASK: u32 = 0x3fff;
    pub const FSMPS_SHIFT: u32 = 16;
    pub const FSMPS_MASK: u32 = 0x7fff;
    pub const FIT: u32 = 1 << 31;
}

/// HcPeriodicStart field.
pub const PERIODIC_START_MASK: u32 = 0x3fff;

/// HcRhDescriptorA bits.
pub mod rh_desc_a {
    pub const NDP_MASK: u32 = 0xff;
    /// Power switching mode: per-port when set (and NPS clear).
    pub const PSM: u32 = 1 << 8;
    /// No power switching: ports are always powered.
    pub const NPS: u32 = 1 << 9;
    /// Compound device.
    pub const DT: u32 = 1 << 10;
    /// Over-current protection mode: per-port when set.
    pub const OCPM: u32 = 1 << 11;
    /// No over-current protection.
    pub const NOCP: u32 = 1 << 12;
    /// Power-on to power-good time, 2 ms units.
    pub const POTPGT_SHIFT: u32 = 24;
}

/// HcRhDescriptorB bits.
pub mod rh_desc_b {
    pub const DR_MASK: u32 = 0xffff;
    pub const PPCM_SHIFT: u32 = 16;
}

/// HcRhStatus bits. Reads report status, writes are commands.
pub mod rh_status {
    /// Read: local power status (always 0). Write: clear global power.
    pub const LPS: u32 = 1 << 0;
    pub const OCI: u32 = 1 << 1;
    pub const DRWE: u32 = 1 << 15;
    /// Write: set global power.
    pub const LPSC: u32 = 1 << 16;
    pub const CCIC: u32 = 1 << 17;
    pub const CRWE: u32 = 1 << 31;
}

/// HcRhPortStatus bits. The status layout matches the USB hub port-status
/// word; writes of the low bits are commands.
pub mod rh_port_status {
    /// Read: connected. Write: clear port enable.
    pub const CCS: u32 = 1 << 0;
    /// Read: enabled. Write: set port enable.
    pub const PES: u32 = 1 << 1;
    /// Read: suspended. Write: set port suspend.
    pub const PSS: u32 = 1 << 2;
    /// Read: over-current. Write: clear suspend (resume).
    pub const POCI: u32 = 1 << 3;
    /// Read: in reset. Write: start port reset.
    pub const PRS: u32 = 1 << 4;
    /// Read: powered. Write: set port power.
    pub const PPS: u32 = 1 << 8;
    /// Read: low-speed device. Write: clear port power.
    pub const LSDA: u32 = 1 << 9;

    pub const CSC: u32 = 1 << 16;
    pub const PESC: u32 = 1 << 17;
    pub const PSSC: u32 = 1 << 18;
    pub const OCIC: u32 = 1 << 19;
    pub const PRSC: u32 = 1 << 20;

    pub const STATUS_MASK: u32 = CCS | PES | PSS | POCI | PRS | PPS | LSDA;
    pub const CHANGE_MASK: u32 = CSC | PESC | PSSC | OCIC | PRSC;
}

/// Offset of the legacy keyboard emulation register block.
pub const LEGACY_REGS_OFFSET: usize = 0x100;
