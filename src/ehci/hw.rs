//! EHCI DMA structures: typed link pointers, queue element transfer
//! descriptors and queue heads.
//!
//! # References
//! - Enhanced Host Controller Interface Specification, revision 1.0,
//!   chapter 3

use crate::endpoint::EndpointProps;
use crate::error::{Result, UsbError};
use crate::mem::{self, Le32};
use crate::usb::{Direction, TransferType, UsbSpeed};

/// A qTD covers 16 KiB at any starting alignment with its five page
/// pointers (20 KiB only when the buffer starts on a page boundary).
pub const TD_MAX_TRANSFER: usize = 16 * 1024;

const PAGE_SIZE: usize = 4096;

/// Typed link pointer encoding.
pub mod link {
    pub const TERMINATE: u32 = 1 << 0;
    pub const TYPE_ITD: u32 = 0x0 << 1;
    pub const TYPE_QH: u32 = 0x1 << 1;
    pub const TYPE_SITD: u32 = 0x2 << 1;
    pub const TYPE_FSTN: u32 = 0x3 << 1;
    pub const TYPE_MASK: u32 = 0x3 << 1;
    pub const ADDRESS_MASK: u32 = 0xffff_fff0;

    pub const TERM: u32 = TERMINATE;

    pub fn qh(phys: u32) -> u32 {
        (phys & ADDRESS_MASK) | TYPE_QH
    }

    pub fn td(phys: u32) -> u32 {
        phys & ADDRESS_MASK
    }
}

/// qTD/QH-overlay status word bits.
pub mod td_status {
    pub const TOGGLE: u32 = 1 << 31;
    pub const TOTAL_SHIFT: u32 = 16;
    pub const TOTAL_MASK: u32 = 0x7fff;
    pub const IOC: u32 = 1 << 15;
    pub const C_PAGE_SHIFT: u32 = 12;
    pub const C_PAGE_MASK: u32 = 0x7;
    pub const CERR_SHIFT: u32 = 10;
    pub const CERR_MASK: u32 = 0x3;
    pub const PID_SHIFT: u32 = 8;
    pub const PID_MASK: u32 = 0x3;
    pub const PID_OUT: u32 = 0x0;
    pub const PID_IN: u32 = 0x1;
    pub const PID_SETUP: u32 = 0x2;
    pub const ACTIVE: u32 = 1 << 7;
    pub const HALTED: u32 = 1 << 6;
    pub const BUFFER_ERROR: u32 = 1 << 5;
    pub const BABBLE: u32 = 1 << 4;
    pub const TRANS_ERROR: u32 = 1 << 3;
    pub const MISSED_UFRAME: u32 = 1 << 2;
    pub const SPLIT_STATE: u32 = 1 << 1;
    pub const PING: u32 = 1 << 0;
}

const BUFFER_POINTER_OFFSET_MASK: u32 = 0xfff;

fn pid_for(direction: Direction) -> u32 {
    match direction {
        Direction::In => td_status::PID_IN,
        Direction::Out => td_status::PID_OUT,
        Direction::Both => td_status::PID_SETUP,
    }
}

/// Queue element transfer descriptor (non-isochronous).
#[repr(C, align(32))]
pub struct Td {
    next: Le32,
    alternate: Le32,
    status: Le32,
    buffer_pointer: [Le32; 5],
    /// 64-bit structure tail; unused, the stack runs the controller in
    /// 32-bit mode.
    extended_bp: [Le32; 5],
}

impl Td {
    /// Initialize the descriptor and activate it last, behind a barrier,
    /// so the controller never sees it half-written.
    ///
    /// `toggle` of `Some` forces the TD toggle bit; `None` leaves it clear
    /// for the queue head's toggle carry. The buffer is split over the
    /// five page pointers; only the first may have an offset.
    pub fn init(
        &self,
        next_phys: u32,
        buffer_phys: u32,
        direction: Direction,
        size: usize,
        toggle: Option<bool>,
        ioc: bool,
    ) {
        debug_assert!(size <= TD_MAX_TRANSFER);
        debug_assert!(size & td_status::TOTAL_MASK as usize == size);

        for bp in &self.buffer_pointer {
            mem::wr(bp, 0);
        }
        for ebp in &self.extended_bp {
            mem::wr(ebp, 0);
        }

        let mut status = (pid_for(direction) << td_status::PID_SHIFT)
            | ((size as u32 & td_status::TOTAL_MASK) << td_status::TOTAL_SHIFT)
            | (3 << td_status::CERR_SHIFT);
        if ioc {
            status |= td_status::IOC;
        }
        if toggle == Some(true) {
            status |= td_status::TOGGLE;
        }
        mem::wr(&self.status, status);

        if buffer_phys != 0 {
            debug_assert!(size != 0);
            let mut buffer = buffer_phys;
            let mut remaining = size;
            for (i, bp) in self.buffer_pointer.iter().enumerate() {
                if remaining == 0 {
                    break;
                }
                let offset = (buffer & BUFFER_POINTER_OFFSET_MASK) as usize;
                debug_assert!(offset == 0 || i == 0);
                let this_page = remaining.min(PAGE_SIZE - offset);
                mem::wr(bp, buffer);
                remaining -= this_page;
                buffer += this_page as u32;
            }
        }

        mem::wr(
            &self.next,
            if next_phys != 0 {
                link::td(next_phys)
            } else {
                link::TERM
            },
        );
        mem::wr(&self.alternate, link::TERM);

        mem::write_barrier();
        mem::set_bits(&self.status, td_status::ACTIVE);
        mem::write_barrier();
    }

    pub fn error(&self) -> Result<()> {
        let status = mem::rd(&self.status);
        if status & td_status::HALTED != 0 {
            if status & td_status::TRANS_ERROR != 0 {
                return Err(UsbError::Io);
            }
            if status & td_status::BABBLE != 0 {
                return Err(UsbError::Io);
            }
            if status & td_status::BUFFER_ERROR != 0 {
                return Err(UsbError::Overflow);
            }
            return Err(UsbError::Stall);
        }
        if status & td_status::ACTIVE != 0 {
            return Err(UsbError::Busy);
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        mem::rd(&self.status) & td_status::ACTIVE != 0
    }

    /// Bytes the controller did not transfer.
    pub fn remain_size(&self) -> usize {
        ((mem::rd(&self.status) >> td_status::TOTAL_SHIFT) & td_status::TOTAL_MASK) as usize
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
    pub(crate) fn raw_buffer_pointer(&self, index: usize) -> u32 {
        mem::rd(&self.buffer_pointer[index])
    }

    #[cfg(test)]
    pub(crate) fn retire(&self, error_bits: u32, remaining: usize) {
        let status = mem::rd(&self.status)
            & !(td_status::ACTIVE | (td_status::TOTAL_MASK << td_status::TOTAL_SHIFT));
        mem::wr(
            &self.status,
            status | error_bits | ((remaining as u32) << td_status::TOTAL_SHIFT),
        );
    }
}

/// Endpoint characteristics word bits.
pub mod ep_char {
    pub const RL_SHIFT: u32 = 28;
    pub const RL_MASK: u32 = 0xf;
    /// Control endpoint flag, full/low-speed control only.
    pub const C: u32 = 1 << 27;
    pub const MAX_LENGTH_SHIFT: u32 = 16;
    pub const MAX_LENGTH_MASK: u32 = 0x7ff;
    /// Head of the async reclamation list.
    pub const H: u32 = 1 << 15;
    /// Data toggle from the TD instead of the queue-head carry.
    pub const DTC: u32 = 1 << 14;
    pub const EPS_SHIFT: u32 = 12;
    pub const EPS_FS: u32 = 0x0;
    pub const EPS_LS: u32 = 0x1;
    pub const EPS_HS: u32 = 0x2;
    pub const EP_SHIFT: u32 = 8;
    pub const EP_MASK: u32 = 0xf;
    pub const INACTIVATE: u32 = 1 << 7;
    pub const ADDR_MASK: u32 = 0x7f;
}

/// Endpoint capabilities word bits.
pub mod ep_cap {
    pub const MULTI_SHIFT: u32 = 30;
    pub const MULTI_MASK: u32 = 0x3;
    pub const TT_PORT_SHIFT: u32 = 23;
    pub const TT_PORT_MASK: u32 = 0x7f;
    pub const TT_ADDR_SHIFT: u32 = 16;
    pub const TT_ADDR_MASK: u32 = 0x7f;
    pub const C_MASK_SHIFT: u32 = 8;
    pub const C_MASK_MASK: u32 = 0xff;
    pub const S_MASK_SHIFT: u32 = 0;
    pub const S_MASK_MASK: u32 = 0xff;
}

/// Queue head: horizontal link, endpoint words and the transfer overlay
/// the controller works in.
#[repr(C, align(32))]
pub struct Qh {
    horizontal: Le32,
    ep_char: Le32,
    ep_cap: Le32,
    current: Le32,
    // Transfer overlay.
    next: Le32,
    alternate: Le32,
    status: Le32,
    buffer_pointer: [Le32; 5],
}

impl Qh {
    /// Initialize for `ep`; `None` builds the halted dummy head the
    /// schedule lists hang off.
    pub fn init(&self, ep: Option<&EndpointProps>) {
        mem::wr(&self.horizontal, link::TERM);
        mem::wr(&self.current, 0);
        mem::wr(&self.next, link::TERM);
        mem::wr(&self.alternate, link::TERM);
        for bp in &self.buffer_pointer {
            mem::wr(bp, 0);
        }

        let Some(props) = ep else {
            mem::wr(&self.ep_char, ep_char::H);
            mem::wr(&self.status, td_status::HALTED);
            mem::wr(&self.ep_cap, 0);
            return;
        };

        let speed = match props.speed {
            UsbSpeed::Low => ep_char::EPS_LS,
            UsbSpeed::Full => ep_char::EPS_FS,
            UsbSpeed::High => ep_char::EPS_HS,
        };
        let mut characteristics = (props.target.address as u32 & ep_char::ADDR_MASK)
            | ((props.target.endpoint as u32 & ep_char::EP_MASK) << ep_char::EP_SHIFT)
            | (speed << ep_char::EPS_SHIFT)
            | ((props.max_packet_size as u32 & ep_char::MAX_LENGTH_MASK)
                << ep_char::MAX_LENGTH_SHIFT);
        if props.transfer_type == TransferType::Control {
            if props.speed != UsbSpeed::High {
                characteristics |= ep_char::C;
            }
            // Control runs its own toggle sequence; bulk and interrupt use
            // the queue-head carry.
            characteristics |= ep_char::DTC;
        }
        mem::wr(&self.ep_char, characteristics);

        let mut capabilities = ((3u32 << 2) << ep_cap::C_MASK_SHIFT)
            | ((props.packets_per_uframe as u32 & ep_cap::MULTI_MASK) << ep_cap::MULTI_SHIFT);
        if props.speed.is_11() {
            if let Some(tt) = props.tt {
                capabilities |= ((tt.port as u32 & ep_cap::TT_PORT_MASK) << ep_cap::TT_PORT_SHIFT)
                    | ((tt.hub_address as u32 & ep_cap::TT_ADDR_MASK) << ep_cap::TT_ADDR_SHIFT);
            }
        }
        if props.transfer_type == TransferType::Interrupt {
            capabilities |= 3 << ep_cap::S_MASK_SHIFT;
        }
        mem::wr(&self.ep_cap, capabilities);
        mem::write_barrier();
    }

    pub fn halted(&self) -> bool {
        mem::rd(&self.status) & td_status::HALTED != 0
    }

    pub fn clear_halt(&self) {
        mem::clr_bits(&self.status, td_status::HALTED);
    }

    /// A fetchable next TD exists in the overlay.
    pub fn transfer_pending(&self) -> bool {
        mem::rd(&self.next) & link::TERMINATE == 0
    }

    /// The overlay's current transaction is still live.
    pub fn transfer_active(&self) -> bool {
        mem::rd(&self.status) & td_status::ACTIVE != 0
    }

    /// Point the overlay at a fresh TD chain. Only valid while the queue
    /// head is idle (no pending work, endpoint quiesced).
    pub fn set_next_td(&self, td_phys: u32) {
        mem::wr(&self.next, link::td(td_phys));
        mem::write_barrier();
    }

    /// Scrub the overlay pointers after a completed batch so a stale TD
    /// reference cannot confuse the next activation.
    pub fn clear_td_pointers(&self) {
        mem::wr(&self.next, link::TERM);
        mem::wr(&self.current, link::TERM);
    }

    pub fn append_qh(&self, qh_phys: u32) {
        mem::wr(&self.horizontal, link::qh(qh_phys));
    }

    pub fn horizontal_raw(&self) -> u32 {
        mem::rd(&self.horizontal)
    }

    pub fn set_horizontal_raw(&self, value: u32) {
        mem::wr(&self.horizontal, value);
    }

    /// True when the TDs carry their own toggle (control endpoints).
    pub fn toggle_from_td(&self) -> bool {
        mem::rd(&self.ep_char) & ep_char::DTC != 0
    }

    pub fn toggle(&self) -> u32 {
        (mem::rd(&self.status) & td_status::TOGGLE != 0) as u32
    }

    pub fn set_toggle(&self, toggle: u32) {
        if toggle != 0 {
            mem::set_bits(&self.status, td_status::TOGGLE);
        } else {
            mem::clr_bits(&self.status, td_status::TOGGLE);
        }
    }

    #[cfg(test)]
    pub(crate) fn raw_ep_char(&self) -> u32 {
        mem::rd(&self.ep_char)
    }

    #[cfg(test)]
    pub(crate) fn raw_ep_cap(&self) -> u32 {
        mem::rd(&self.ep_cap)
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
    pub(crate) fn force_halt(&self) {
        mem::set_bits(&self.status, td_status::HALTED);
    }

    #[cfg(test)]
    pub(crate) fn force_idle(&self) {
        mem::clr_bits(&self.status, td_status::ACTIVE);
        mem::wr(&self.next, link::TERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Tt;
    use crate::usb::Target;

    fn props(
        transfer_type: TransferType,
        speed: UsbSpeed,
        mps: u16,
    ) -> EndpointProps {
        EndpointProps::new(
            Target {
                address: 7,
                endpoint: 2,
            },
            Direction::In,
            transfer_type,
            speed,
            mps,
        )
    }

    fn zeroed<T>() -> T {
        unsafe { core::mem::zeroed() }
    }

    #[test]
    fn td_init_activates_last() {
        let td: Td = zeroed();
        td.init(0x40, 0x0001_0000, Direction::In, 512, None, true);
        let status = td.raw_status();
        assert_ne!(status & td_status::ACTIVE, 0);
        assert_ne!(status & td_status::IOC, 0);
        assert_eq!(
            (status >> td_status::PID_SHIFT) & td_status::PID_MASK,
            td_status::PID_IN
        );
        assert_eq!(
            (status >> td_status::TOTAL_SHIFT) & td_status::TOTAL_MASK,
            512
        );
        assert_eq!((status >> td_status::CERR_SHIFT) & td_status::CERR_MASK, 3);
        // QH toggle carry: TD toggle bit stays clear.
        assert_eq!(status & td_status::TOGGLE, 0);
        assert_eq!(td.raw_next(), 0x40);
        assert_eq!(td.remain_size(), 512);
    }

    #[test]
    fn td_buffer_split_handles_page_straddle() {
        let td: Td = zeroed();
        // 8 KiB starting 4 bytes into a page needs three pointers.
        td.init(0, 0x0001_0004, Direction::Out, 8192, None, false);
        assert_eq!(td.raw_buffer_pointer(0), 0x0001_0004);
        assert_eq!(td.raw_buffer_pointer(1), 0x0001_1000);
        assert_eq!(td.raw_buffer_pointer(2), 0x0001_2000);
        assert_eq!(td.raw_buffer_pointer(3), 0);
    }

    #[test]
    fn td_full_16k_uses_five_pages() {
        let td: Td = zeroed();
        td.init(0, 0x0002_0200, Direction::Out, TD_MAX_TRANSFER, None, false);
        for i in 0..5 {
            assert_ne!(td.raw_buffer_pointer(i), 0, "pointer {} unused", i);
        }
        assert_eq!(td.raw_buffer_pointer(4), 0x0002_4000);
    }

    #[test]
    fn error_decode() {
        let td: Td = zeroed();
        td.init(0, 0x1000, Direction::In, 64, None, false);
        for (bits, expected) in [
            (td_status::HALTED | td_status::TRANS_ERROR, UsbError::Io),
            (td_status::HALTED | td_status::BABBLE, UsbError::Io),
            (
                td_status::HALTED | td_status::BUFFER_ERROR,
                UsbError::Overflow,
            ),
            (td_status::HALTED, UsbError::Stall),
        ] {
            td.retire(bits, 64);
            assert_eq!(td.error(), Err(expected));
        }
        td.retire(0, 0);
        assert_eq!(td.error(), Ok(()));
    }

    #[test]
    fn qh_init_high_speed_bulk() {
        let qh: Qh = zeroed();
        qh.init(Some(&props(TransferType::Bulk, UsbSpeed::High, 512)));
        let chars = qh.raw_ep_char();
        assert_eq!(chars & ep_char::ADDR_MASK, 7);
        assert_eq!((chars >> ep_char::EP_SHIFT) & ep_char::EP_MASK, 2);
        assert_eq!((chars >> ep_char::EPS_SHIFT) & 0x3, ep_char::EPS_HS);
        assert_eq!(
            (chars >> ep_char::MAX_LENGTH_SHIFT) & ep_char::MAX_LENGTH_MASK,
            512
        );
        // Bulk leaves toggle management to the queue head.
        assert_eq!(chars & ep_char::DTC, 0);
        assert_eq!(chars & ep_char::C, 0);
        assert_eq!(
            (qh.raw_ep_cap() >> ep_cap::MULTI_SHIFT) & ep_cap::MULTI_MASK,
            1
        );
    }

    #[test]
    fn qh_init_full_speed_control_sets_c_and_dtc() {
        let qh: Qh = zeroed();
        let mut p = props(TransferType::Control, UsbSpeed::Full, 64);
        p.tt = Some(Tt {
            hub_address: 3,
            port: 4,
        });
        qh.init(Some(&p));
        let chars = qh.raw_ep_char();
        assert_ne!(chars & ep_char::C, 0);
        assert_ne!(chars & ep_char::DTC, 0);
        let cap = qh.raw_ep_cap();
        assert_eq!((cap >> ep_cap::TT_ADDR_SHIFT) & ep_cap::TT_ADDR_MASK, 3);
        assert_eq!((cap >> ep_cap::TT_PORT_SHIFT) & ep_cap::TT_PORT_MASK, 4);
    }

    #[test]
    fn dummy_qh_is_halted_list_head() {
        let qh: Qh = zeroed();
        qh.init(None);
        assert_eq!(qh.raw_ep_char(), ep_char::H);
        assert!(qh.halted());
        assert!(!qh.transfer_pending());
        assert_eq!(qh.horizontal_raw(), link::TERM);
    }

    #[test]
    fn qh_overlay_operations() {
        let qh: Qh = zeroed();
        qh.init(Some(&props(TransferType::Bulk, UsbSpeed::High, 512)));
        qh.set_next_td(0x0003_0040);
        assert!(qh.transfer_pending());
        assert_eq!(qh.raw_next(), 0x0003_0040);
        qh.clear_td_pointers();
        assert!(!qh.transfer_pending());
        qh.force_halt();
        assert!(qh.halted());
        qh.clear_halt();
        assert!(!qh.halted());
    }
}
