//! UHCI DMA structures: link pointers, transfer descriptors, queue heads.
//!
//! # References
//! - UHCI Design Guide revision 1.1, chapter 3 (data structures)

use crate::error::{Result, UsbError};
use crate::mem::{self, Le32};
use crate::usb::{PacketId, Target};

/// Link pointer encoding shared by the frame list, TDs and QHs.
pub mod link {
    pub const TERMINATE: u32 = 1 << 0;
    pub const QUEUE_HEAD: u32 = 1 << 1;
    /// Depth-first traversal of the queue element chain.
    pub const VERTICAL: u32 = 1 << 2;
    pub const ADDRESS_MASK: u32 = 0xffff_fff0;

    /// Link to a queue head.
    pub fn qh(phys: u32) -> u32 {
        (phys & ADDRESS_MASK) | QUEUE_HEAD
    }

    /// Link to a transfer descriptor.
    pub fn td(phys: u32) -> u32 {
        phys & ADDRESS_MASK
    }

    /// End-of-chain marker.
    pub const TERM: u32 = TERMINATE;
}

/// TD status word bits (second dword).
pub mod td_status {
    pub const SPD: u32 = 1 << 29;
    pub const ERROR_COUNT_SHIFT: u32 = 27;
    pub const ERROR_COUNT_MASK: u32 = 0x3;
    pub const LOW_SPEED: u32 = 1 << 26;
    pub const ISOCHRONOUS: u32 = 1 << 25;
    pub const IOC: u32 = 1 << 24;

    pub const ACTIVE: u32 = 1 << 23;
    pub const STALLED: u32 = 1 << 22;
    pub const BUFFER_ERROR: u32 = 1 << 21;
    pub const BABBLE: u32 = 1 << 20;
    pub const NAK: u32 = 1 << 19;
    pub const CRC_TIMEOUT: u32 = 1 << 18;
    pub const BIT_STUFF: u32 = 1 << 17;

    pub const ACTLEN_MASK: u32 = 0x7ff;
}

/// TD token word bits (third dword).
pub mod td_device {
    pub const MAXLEN_SHIFT: u32 = 21;
    pub const MAXLEN_MASK: u32 = 0x7ff;
    pub const TOGGLE: u32 = 1 << 19;
    pub const ENDPOINT_SHIFT: u32 = 15;
    pub const ENDPOINT_MASK: u32 = 0xf;
    pub const ADDRESS_SHIFT: u32 = 8;
    pub const ADDRESS_MASK: u32 = 0x7f;
    pub const PID_MASK: u32 = 0xff;
}

/// Transfer descriptor; 16 bytes used, 16-byte aligned. The hardware
/// ignores the rest of the 32-byte cell the design guide reserves.
#[repr(C, align(16))]
pub struct Td {
    next: Le32,
    status: Le32,
    device: Le32,
    buffer: Le32,
}

impl Td {
    /// Initialize the descriptor and mark it active.
    ///
    /// All TDs get the vertical flag so the queue executes depth first,
    /// keeping one endpoint's chain atomic within a frame. IN packets get
    /// short-packet-detect so a short read terminates the chain.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &self,
        error_count: u32,
        size: usize,
        toggle: bool,
        low_speed: bool,
        target: Target,
        pid: PacketId,
        buffer_phys: u32,
        next_phys: Option<u32>,
    ) {
        debug_assert!(size < 1024);

        let next = match next_phys {
            Some(pa) => {
                debug_assert_eq!(pa & link::ADDRESS_MASK, pa);
                pa | link::VERTICAL
            }
            None => link::VERTICAL | link::TERMINATE,
        };
        mem::wr(&self.next, next);

        // Max length is encoded as n-1; zero-length packets store 0x7ff.
        let maxlen = (size as u32).wrapping_sub(1) & td_device::MAXLEN_MASK;
        mem::wr(
            &self.device,
            (maxlen << td_device::MAXLEN_SHIFT)
                | if toggle { td_device::TOGGLE } else { 0 }
                | ((target.address as u32 & td_device::ADDRESS_MASK) << td_device::ADDRESS_SHIFT)
                | ((target.endpoint as u32 & td_device::ENDPOINT_MASK) << td_device::ENDPOINT_SHIFT)
                | (pid as u8 as u32 & td_device::PID_MASK),
        );

        mem::wr(&self.buffer, buffer_phys);

        // The activating store comes last, so the controller can never
        // observe an active but half-written descriptor.
        let mut status = ((error_count & td_status::ERROR_COUNT_MASK)
            << td_status::ERROR_COUNT_SHIFT)
            | td_status::ACTIVE;
        if low_speed {
            status |= td_status::LOW_SPEED;
        }
        if pid == PacketId::In {
            status |= td_status::SPD;
        }
        mem::write_barrier();
        mem::wr(&self.status, status);
        mem::write_barrier();
    }

    /// Map the completed descriptor's status onto the error taxonomy.
    pub fn error(&self) -> Result<()> {
        let status = mem::rd(&self.status);

        if status & td_status::BIT_STUFF != 0 {
            return Err(UsbError::Io);
        }
        if status & td_status::CRC_TIMEOUT != 0 {
            return Err(UsbError::BadChecksum);
        }
        // The controller retries NAKs itself; seeing the bit here means the
        // error counter ran out on something else.
        if status & td_status::NAK != 0 {
            return Err(UsbError::Again);
        }
        if status & td_status::BUFFER_ERROR != 0 {
            return Err(UsbError::Overflow);
        }
        if status & td_status::BABBLE != 0 {
            return Err(UsbError::Io);
        }
        if status & td_status::STALLED != 0 {
            return Err(UsbError::Stall);
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        mem::rd(&self.status) & td_status::ACTIVE != 0
    }

    /// Bytes actually transferred; encoded n-1 like the max length.
    pub fn act_size(&self) -> usize {
        ((mem::rd(&self.status).wrapping_add(1)) & td_status::ACTLEN_MASK) as usize
    }

    /// Short packet: fewer bytes than requested on a short-packet-detect TD.
    pub fn is_short(&self) -> bool {
        let max =
            ((mem::rd(&self.device) >> td_device::MAXLEN_SHIFT).wrapping_add(1))
                & td_device::MAXLEN_MASK;
        mem::rd(&self.status) & td_status::SPD != 0 && self.act_size() < max as usize
    }

    /// Data toggle of this TD, used to resynchronize the endpoint toggle
    /// after a failed chain.
    pub fn toggle(&self) -> u32 {
        (mem::rd(&self.device) & td_device::TOGGLE != 0) as u32
    }

    pub fn set_ioc(&self) {
        mem::set_bits(&self.status, td_status::IOC);
    }

    #[cfg(test)]
    pub fn raw_status(&self) -> u32 {
        mem::rd(&self.status)
    }

    #[cfg(test)]
    pub fn raw_device(&self) -> u32 {
        mem::rd(&self.device)
    }

    #[cfg(test)]
    pub fn raw_next(&self) -> u32 {
        mem::rd(&self.next)
    }

    #[cfg(test)]
    pub(crate) fn force_status(&self, value: u32) {
        mem::wr(&self.status, value);
    }
}

/// Queue head: horizontal link to the next queue, vertical element pointer
/// to the queue contents.
#[repr(C, align(16))]
pub struct Qh {
    next: Le32,
    element: Le32,
}

impl Qh {
    pub fn init(&self) {
        mem::wr(&self.next, link::TERM);
        mem::wr(&self.element, link::TERM);
    }

    pub fn set_next_qh(&self, phys: u32) {
        if phys == 0 {
            mem::wr(&self.next, link::TERM);
        } else {
            mem::wr(&self.next, link::qh(phys));
        }
    }

    pub fn set_element_td(&self, phys: u32) {
        if phys == 0 {
            mem::wr(&self.element, link::TERM);
        } else {
            mem::wr(&self.element, link::td(phys));
        }
    }

    pub fn next(&self) -> u32 {
        mem::rd(&self.next)
    }

    pub fn set_next_raw(&self, value: u32) {
        mem::wr(&self.next, value);
    }
}
