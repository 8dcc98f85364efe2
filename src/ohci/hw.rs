//! OHCI DMA structures: endpoint descriptors, transfer descriptors and the
//! host controller communications area.
//!
//! # References
//! - OpenHCI Specification for USB, release 1.0a, chapter 4

use crate::endpoint::EndpointProps;
use crate::error::{Result, UsbError};
use crate::mem::{self, Le32};
use crate::usb::{Direction, TransferType, UsbSpeed};

/// One OHCI TD moves at most this much; the two buffer-page pointers in
/// the TD cover it for any alignment.
pub const TD_MAX_TRANSFER: usize = 8 * 1024;

/// Hardware completion codes (OHCI spec, table 4-7).
pub mod cc {
    pub const NO_ERROR: u32 = 0x0;
    pub const CRC: u32 = 0x1;
    pub const BIT_STUFF: u32 = 0x2;
    pub const TOGGLE_MISMATCH: u32 = 0x3;
    pub const STALL: u32 = 0x4;
    pub const NO_RESPONSE: u32 = 0x5;
    pub const PID_FAIL: u32 = 0x6;
    pub const PID_UNEXPECTED: u32 = 0x7;
    pub const DATA_OVERRUN: u32 = 0x8;
    pub const DATA_UNDERRUN: u32 = 0x9;
    pub const BUFFER_OVERRUN: u32 = 0xc;
    pub const BUFFER_UNDERRUN: u32 = 0xd;
    pub const NOT_ACCESSED1: u32 = 0xe;
    pub const NOT_ACCESSED2: u32 = 0xf;
}

/// Map a completion code onto the portable taxonomy.
pub fn cc_to_result(code: u32) -> Result<()> {
    match code {
        cc::NO_ERROR => Ok(()),
        cc::CRC | cc::NO_RESPONSE => Err(UsbError::BadChecksum),
        cc::BIT_STUFF | cc::PID_FAIL | cc::PID_UNEXPECTED => Err(UsbError::Io),
        cc::TOGGLE_MISMATCH | cc::STALL => Err(UsbError::Stall),
        cc::DATA_OVERRUN | cc::DATA_UNDERRUN | cc::BUFFER_OVERRUN | cc::BUFFER_UNDERRUN => {
            Err(UsbError::Overflow)
        }
        _ => Err(UsbError::NotSupported),
    }
}

/// TD status word bits.
pub mod td_status {
    /// Accept short input packets without an error.
    pub const ROUND: u32 = 1 << 18;
    pub const DP_SHIFT: u32 = 19;
    pub const DP_MASK: u32 = 0x3;
    pub const DP_SETUP: u32 = 0x0;
    pub const DP_OUT: u32 = 0x1;
    pub const DP_IN: u32 = 0x2;
    pub const DI_SHIFT: u32 = 21;
    pub const DI_MASK: u32 = 0x7;
    pub const DI_NONE: u32 = 0x7;
    /// Explicit toggle value for this TD.
    pub const TOGGLE: u32 = 1 << 24;
    /// Use the TD toggle bit instead of the ED carry.
    pub const TOGGLE_FROM_TD: u32 = 1 << 25;
    pub const EC_SHIFT: u32 = 26;
    pub const EC_MASK: u32 = 0x3;
    pub const CC_SHIFT: u32 = 28;
    pub const CC_MASK: u32 = 0xf;
}

/// General transfer descriptor.
#[repr(C, align(32))]
pub struct Td {
    status: Le32,
    /// Current buffer pointer; cleared by the controller when the whole
    /// buffer went through.
    cbp: Le32,
    next: Le32,
    /// Last byte of the buffer (inclusive).
    be: Le32,
}

pub const TD_NEXT_PTR_MASK: u32 = 0xffff_fff0;

impl Td {
    /// Initialize the descriptor with a not-accessed completion code.
    ///
    /// `toggle` of `Some` forces the TD's own toggle bit; `None` defers to
    /// the endpoint descriptor's carry. IN transfers allow short reads.
    pub fn init(
        &self,
        next_phys: u32,
        direction: Direction,
        buffer_phys: u32,
        size: usize,
        toggle: Option<bool>,
    ) {
        let dp = match direction {
            Direction::In => td_status::DP_IN,
            Direction::Out => td_status::DP_OUT,
            Direction::Both => td_status::DP_SETUP,
        };
        let mut status = (dp << td_status::DP_SHIFT)
            | (cc::NOT_ACCESSED2 << td_status::CC_SHIFT)
            | (td_status::DI_NONE << td_status::DI_SHIFT);
        if let Some(toggle) = toggle {
            status |= td_status::TOGGLE_FROM_TD;
            if toggle {
                status |= td_status::TOGGLE;
            }
        }
        if direction == Direction::In {
            status |= td_status::ROUND;
        }
        mem::wr(&self.status, status);

        if buffer_phys != 0 && size != 0 {
            mem::wr(&self.cbp, buffer_phys);
            mem::wr(&self.be, buffer_phys + size as u32 - 1);
        } else {
            mem::wr(&self.cbp, 0);
            mem::wr(&self.be, 0);
        }

        self.set_next(next_phys);
        mem::write_barrier();
    }

    pub fn set_next(&self, next_phys: u32) {
        mem::wr(&self.next, next_phys & TD_NEXT_PTR_MASK);
    }

    /// The controller rewrites the code on retirement; both not-accessed
    /// values mean it has not touched the TD yet.
    pub fn is_finished(&self) -> bool {
        let code = (mem::rd(&self.status) >> td_status::CC_SHIFT) & td_status::CC_MASK;
        code != cc::NOT_ACCESSED1 && code != cc::NOT_ACCESSED2
    }

    pub fn error(&self) -> Result<()> {
        let code = (mem::rd(&self.status) >> td_status::CC_SHIFT) & td_status::CC_MASK;
        cc_to_result(code)
    }

    /// Bytes left unread in the buffer; a retired TD clears the current
    /// buffer pointer when everything was transferred.
    pub fn remain_size(&self) -> usize {
        let cbp = mem::rd(&self.cbp);
        if cbp == 0 {
            return 0;
        }
        (mem::rd(&self.be) - cbp + 1) as usize
    }

    pub(crate) fn raw_copy_from(&self, other: &Td) {
        mem::wr(&self.status, mem::rd(&other.status));
        mem::wr(&self.cbp, mem::rd(&other.cbp));
        mem::wr(&self.next, mem::rd(&other.next));
        mem::wr(&self.be, mem::rd(&other.be));
    }

    #[cfg(test)]
    pub(crate) fn raw_status(&self) -> u32 {
        mem::rd(&self.status)
    }

    #[cfg(test)]
    pub(crate) fn raw_next(&self) -> u32 {
        mem::rd(&self.next)
    }

    #[cfg(test)]
    pub(crate) fn retire(&self, code: u32, remaining: Option<(u32, u32)>) {
        let status =
            (mem::rd(&self.status) & !(td_status::CC_MASK << td_status::CC_SHIFT))
                | (code << td_status::CC_SHIFT);
        mem::wr(&self.status, status);
        match remaining {
            Some((cbp, be)) => {
                mem::wr(&self.cbp, cbp);
                mem::wr(&self.be, be);
            }
            None => mem::wr(&self.cbp, 0),
        }
    }
}

/// ED status word bits.
pub mod ed_status {
    pub const FA_MASK: u32 = 0x7f;
    pub const FA_SHIFT: u32 = 0;
    pub const EN_MASK: u32 = 0xf;
    pub const EN_SHIFT: u32 = 7;
    pub const D_MASK: u32 = 0x3;
    pub const D_SHIFT: u32 = 11;
    pub const D_FROM_TD: u32 = 0x0;
    pub const D_OUT: u32 = 0x1;
    pub const D_IN: u32 = 0x2;
    /// Low-speed endpoint.
    pub const S: u32 = 1 << 13;
    /// Skip this ED.
    pub const K: u32 = 1 << 14;
    /// Isochronous TD format.
    pub const F: u32 = 1 << 15;
    pub const MPS_MASK: u32 = 0x7ff;
    pub const MPS_SHIFT: u32 = 16;
}

pub const ED_PTR_MASK: u32 = 0xffff_fff0;
/// Toggle carry in the head pointer word.
pub const ED_HEAD_TOGGLE: u32 = 0x2;
/// Halted flag in the head pointer word.
pub const ED_HEAD_HALTED: u32 = 0x1;

/// Endpoint descriptor: one per registered endpoint, plus the dummy list
/// heads.
#[repr(C, align(32))]
pub struct Ed {
    status: Le32,
    td_tail: Le32,
    /// Updated by the controller; also carries the halted flag and the
    /// data toggle.
    td_head: Le32,
    next: Le32,
}

impl Ed {
    /// Initialize for `ep`, pointing both TD pointers at the endpoint's
    /// dummy TD. `None` builds a skipped dummy head for the schedule lists.
    pub fn init(&self, ep: Option<&EndpointProps>, dummy_td_phys: u32) {
        let Some(props) = ep else {
            mem::wr(&self.status, ed_status::K);
            mem::wr(&self.td_tail, 0);
            mem::wr(&self.td_head, 0);
            mem::wr(&self.next, 0);
            return;
        };

        let direction = match (props.transfer_type, props.direction) {
            (TransferType::Control, _) => ed_status::D_FROM_TD,
            (_, Direction::In) => ed_status::D_IN,
            (_, Direction::Out) => ed_status::D_OUT,
            (_, Direction::Both) => ed_status::D_FROM_TD,
        };

        let mut status = ((props.target.address as u32 & ed_status::FA_MASK)
            << ed_status::FA_SHIFT)
            | ((props.target.endpoint as u32 & ed_status::EN_MASK) << ed_status::EN_SHIFT)
            | ((direction & ed_status::D_MASK) << ed_status::D_SHIFT)
            | ((props.max_packet_size as u32 & ed_status::MPS_MASK) << ed_status::MPS_SHIFT);
        if props.speed == UsbSpeed::Low {
            status |= ed_status::S;
        }
        if props.transfer_type == TransferType::Isochronous {
            status |= ed_status::F;
        }
        mem::wr(&self.status, status);

        mem::wr(&self.td_head, dummy_td_phys & ED_PTR_MASK);
        mem::wr(&self.td_tail, dummy_td_phys & ED_PTR_MASK);
        mem::wr(&self.next, 0);
        mem::write_barrier();
    }

    /// Halted or skipped: the controller will not touch this ED.
    pub fn inactive(&self) -> bool {
        mem::rd(&self.td_head) & ED_HEAD_HALTED != 0 || mem::rd(&self.status) & ed_status::K != 0
    }

    pub fn clear_halt(&self) {
        mem::clr_bits(&self.td_head, ED_HEAD_HALTED);
    }

    /// Work remains while head and tail differ.
    pub fn transfer_pending(&self) -> bool {
        mem::rd(&self.td_head) & ED_PTR_MASK != mem::rd(&self.td_tail) & ED_PTR_MASK
    }

    pub fn head_td(&self) -> u32 {
        mem::rd(&self.td_head) & ED_PTR_MASK
    }

    pub fn tail_td(&self) -> u32 {
        mem::rd(&self.td_tail) & ED_PTR_MASK
    }

    pub fn set_tail_td(&self, phys: u32) {
        mem::wr(&self.td_tail, phys & ED_PTR_MASK);
    }

    /// Only legal while the ED is halted or off the schedule.
    pub fn set_head_td(&self, phys: u32) {
        mem::wr(&self.td_head, phys & ED_PTR_MASK);
    }

    pub fn next(&self) -> u32 {
        mem::rd(&self.next) & ED_PTR_MASK
    }

    pub fn set_next(&self, phys: u32) {
        mem::wr(&self.next, phys & ED_PTR_MASK);
    }

    pub fn set_next_raw(&self, value: u32) {
        mem::wr(&self.next, value);
    }

    pub fn next_raw(&self) -> u32 {
        mem::rd(&self.next)
    }

    pub fn toggle(&self) -> u32 {
        (mem::rd(&self.td_head) & ED_HEAD_TOGGLE != 0) as u32
    }

    pub fn set_toggle(&self, toggle: u32) {
        if toggle != 0 {
            mem::set_bits(&self.td_head, ED_HEAD_TOGGLE);
        } else {
            mem::clr_bits(&self.td_head, ED_HEAD_TOGGLE | ED_HEAD_HALTED);
        }
    }

    #[cfg(test)]
    pub(crate) fn raw_status(&self) -> u32 {
        mem::rd(&self.status)
    }

    #[cfg(test)]
    pub(crate) fn force_halt(&self) {
        mem::set_bits(&self.td_head, ED_HEAD_HALTED);
    }
}

/// Number of interrupt list heads in the HCCA.
pub const HCCA_INT_EP_COUNT: usize = 32;

/// Host controller communications area: the 256-byte shared page the
/// controller reads its periodic schedule from and publishes the frame
/// number and done queue into.
#[repr(C, align(256))]
pub struct Hcca {
    int_ep: [Le32; HCCA_INT_EP_COUNT],
    frame_number: Le32,
    done_head: Le32,
    _reserved: [u32; 30],
}

const _: () = assert!(core::mem::size_of::<Hcca>() == 256);

impl Hcca {
    pub fn set_int_ep(&self, index: usize, phys: u32) {
        mem::wr(&self.int_ep[index], phys);
    }

    pub fn int_ep(&self, index: usize) -> u32 {
        mem::rd(&self.int_ep[index])
    }

    pub fn frame_number(&self) -> u16 {
        mem::rd(&self.frame_number) as u16
    }

    pub fn done_head(&self) -> u32 {
        mem::rd(&self.done_head)
    }
}
