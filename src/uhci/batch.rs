//! UHCI transfer batch: buffer segmentation into a TD chain and the
//! completion predicate.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::slice;

use crate::batch::TransferBatch;
use crate::dma::DmaBuffer;
use crate::error::{Result, UsbError};
use crate::usb::{Direction, PacketId, TransferType, UsbSpeed, SETUP_PACKET_SIZE};

use super::hw::{Qh, Td};
use super::UhciEndpoint;

/// Retries the controller attempts per transaction before giving up.
const DEFAULT_ERROR_COUNT: u32 = 3;

/// A batch bound to a UHCI endpoint, owning its TD chain and queue head.
pub struct UhciBatch {
    pub base: TransferBatch,
    pub ep: Arc<UhciEndpoint>,
    /// TD array, queue head and setup bytes in one DMA allocation; empty
    /// until [`UhciBatch::prepare`] runs.
    dma: Option<DmaBuffer>,
    td_count: usize,
}

impl UhciBatch {
    pub fn new(ep: Arc<UhciEndpoint>, base: TransferBatch) -> Box<UhciBatch> {
        Box::new(UhciBatch {
            base,
            ep,
            dma: None,
            td_count: 0,
        })
    }

    /// Allocate the hardware structures and build the TD chain.
    pub fn prepare(&mut self) -> Result<()> {
        if self.dma.is_some() {
            return Ok(());
        }
        let transfer_type = self.ep.base.props.transfer_type;
        let mps = self.ep.base.props.max_packet_size as usize;

        // Control needs no data TDs for a zero-length request; bulk and
        // interrupt always get at least the one zero-length packet.
        let data_tds = self.base.size.div_ceil(mps);
        let (td_count, setup_size) = match transfer_type {
            TransferType::Control => (data_tds + 2, SETUP_PACKET_SIZE),
            TransferType::Bulk | TransferType::Interrupt => (data_tds.max(1), 0),
            TransferType::Isochronous => return Err(UsbError::NotSupported),
        };

        let tds_size = td_count * core::mem::size_of::<Td>();
        let total = tds_size + core::mem::size_of::<Qh>() + setup_size;
        let dma = DmaBuffer::alloc(total, 16)?;

        self.td_count = td_count;
        self.dma = Some(dma);

        let qh = self.qh();
        qh.init();
        qh.set_element_td(self.td_phys(0));

        if setup_size != 0 {
            let setup = unsafe {
                slice::from_raw_parts_mut(
                    self.dma().as_mut_ptr().add(self.setup_offset()),
                    SETUP_PACKET_SIZE,
                )
            };
            setup.copy_from_slice(&self.base.setup);
        }

        match transfer_type {
            TransferType::Control => self.build_control(),
            _ => self.build_data(),
        }
        Ok(())
    }

    fn dma(&self) -> &DmaBuffer {
        self.dma.as_ref().expect("batch not prepared")
    }

    fn tds(&self) -> &[Td] {
        unsafe { slice::from_raw_parts(self.dma().as_ptr() as *const Td, self.td_count) }
    }

    fn td_phys(&self, index: usize) -> u32 {
        self.dma().phys_of(&self.tds()[index] as *const Td)
    }

    fn qh_offset(&self) -> usize {
        self.td_count * core::mem::size_of::<Td>()
    }

    fn setup_offset(&self) -> usize {
        self.qh_offset() + core::mem::size_of::<Qh>()
    }

    pub fn qh(&self) -> &Qh {
        unsafe { &*(self.dma().as_ptr().add(self.qh_offset()) as *const Qh) }
    }

    pub fn qh_phys(&self) -> u32 {
        self.dma().phys_of(self.qh() as *const Qh)
    }

    fn setup_phys(&self) -> u32 {
        self.dma().phys() + self.setup_offset() as u32
    }

    /// SETUP stage, alternating-toggle data stage, opposite-direction
    /// status stage with toggle 1 and IOC.
    fn build_control(&self) {
        let dir = self.base.dir;
        debug_assert!(dir == Direction::In || dir == Direction::Out);

        let target = self.base.target;
        let low_speed = self.ep.base.props.speed == UsbSpeed::Low;
        let mps = self.ep.base.props.max_packet_size as usize;
        let tds = self.tds();

        tds[0].init(
            DEFAULT_ERROR_COUNT,
            SETUP_PACKET_SIZE,
            false,
            low_speed,
            target,
            PacketId::Setup,
            self.setup_phys(),
            Some(self.td_phys(1)),
        );

        let data_pid = PacketId::from(dir);
        let status_pid = PacketId::from(dir.reverse());

        let mut td = 1;
        let mut toggle = true;
        let mut remain = self.base.size;
        let mut buffer = self.base.buffer.phys();
        while remain > 0 {
            let packet = remain.min(mps);
            tds[td].init(
                DEFAULT_ERROR_COUNT,
                packet,
                toggle,
                low_speed,
                target,
                data_pid,
                buffer,
                Some(self.td_phys(td + 1)),
            );
            td += 1;
            toggle = !toggle;
            buffer += packet as u32;
            remain -= packet;
            debug_assert!(td < self.td_count);
        }

        debug_assert_eq!(td, self.td_count - 1);
        tds[td].init(
            DEFAULT_ERROR_COUNT,
            0,
            true,
            low_speed,
            target,
            status_pid,
            0,
            None,
        );
        tds[td].set_ioc();
    }

    /// Single-direction chain with the software-tracked endpoint toggle;
    /// the last TD raises IOC.
    fn build_data(&self) {
        let dir = self.base.dir;
        debug_assert!(dir == Direction::In || dir == Direction::Out);

        let pid = PacketId::from(dir);
        let target = self.base.target;
        let low_speed = self.ep.base.props.speed == UsbSpeed::Low;
        let mps = self.ep.base.props.max_packet_size as usize;
        let tds = self.tds();

        let mut toggle = self.ep.toggle() != 0;
        let mut td = 0;
        let mut remain = self.base.size;
        let mut buffer = self.base.buffer.phys();
        loop {
            let packet = remain.min(mps);
            let next = if td + 1 < self.td_count {
                Some(self.td_phys(td + 1))
            } else {
                None
            };
            tds[td].init(
                DEFAULT_ERROR_COUNT,
                packet,
                toggle,
                low_speed,
                target,
                pid,
                if packet == 0 { 0 } else { buffer },
                next,
            );
            td += 1;
            toggle = !toggle;
            buffer += packet as u32;
            remain -= packet;
            if td == self.td_count {
                break;
            }
        }
        tds[td - 1].set_ioc();
        self.ep.set_toggle(toggle as u32);
    }

    /// Walk the chain; false while any TD is still active.
    ///
    /// On an error the endpoint toggle is resynchronized from the failing
    /// TD. A short IN packet ends the walk successfully. Control batches
    /// report payload bytes only, and only when anything at all got
    /// through.
    pub fn check_completed(&mut self) -> bool {
        self.base.transferred_size = 0;

        for index in 0..self.td_count {
            let (active, status, act_size, short, toggle) = {
                let td = &self.tds()[index];
                (
                    td.is_active(),
                    td.error(),
                    td.act_size(),
                    td.is_short(),
                    td.toggle(),
                )
            };
            if active {
                return false;
            }

            if let Err(err) = status {
                self.base.error = Err(err);
                self.ep.set_toggle(toggle);
                break;
            }

            self.base.transferred_size += act_size;
            if short {
                break;
            }
        }

        if self.base.transferred_size > 0
            && self.ep.base.props.transfer_type == TransferType::Control
        {
            debug_assert!(self.base.transferred_size >= SETUP_PACKET_SIZE);
            self.base.transferred_size -= SETUP_PACKET_SIZE;
        }
        debug_assert!(self.base.transferred_size <= self.base.size);

        true
    }

    #[cfg(test)]
    pub(crate) fn test_tds(&self) -> &[Td] {
        self.tds()
    }

    #[cfg(test)]
    pub(crate) fn td_total(&self) -> usize {
        self.td_count
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::make_endpoint;
    use super::super::hw::{link, td_status};
    use super::*;
    use crate::usb::Target;

    fn make_batch(
        transfer_type: TransferType,
        dir: Direction,
        size: usize,
        mps: u16,
        setup: [u8; SETUP_PACKET_SIZE],
    ) -> Box<UhciBatch> {
        let ep = make_endpoint(transfer_type, dir, mps);
        let buffer = DmaBuffer::alloc(size.max(1), 16).unwrap();
        let base = TransferBatch::new(
            Target {
                address: 0,
                endpoint: 0,
            },
            dir,
            setup,
            buffer,
            size,
            Box::new(|_| {}),
        );
        let mut batch = UhciBatch::new(ep, base);
        batch.prepare().unwrap();
        batch
    }

    fn retire(batch: &UhciBatch, index: usize, act_size: usize) {
        let td = &batch.test_tds()[index];
        let status = td.raw_status() & !td_status::ACTIVE & !td_status::ACTLEN_MASK;
        td.force_status(status | ((act_size as u32).wrapping_sub(1) & td_status::ACTLEN_MASK));
    }

    #[test]
    fn control_in_18_bytes_mps8_yields_five_tds() {
        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let batch = make_batch(TransferType::Control, Direction::In, 18, 8, setup);
        assert_eq!(batch.td_total(), 5);

        let tds = batch.test_tds();
        // SETUP: toggle 0, 8 bytes, SETUP PID.
        assert_eq!(tds[0].toggle(), 0);
        assert_eq!(tds[0].raw_device() & 0xff, PacketId::Setup as u8 as u32);
        // DATA: IN toggles 1, 0, 1 with sizes 8, 8, 2.
        for (i, (toggle, size)) in [(1u32, 8u32), (0, 8), (1, 2)].iter().enumerate() {
            let td = &tds[i + 1];
            assert_eq!(td.toggle(), *toggle);
            assert_eq!(td.raw_device() & 0xff, PacketId::In as u8 as u32);
            assert_eq!((td.raw_device() >> 21) & 0x7ff, size - 1);
        }
        // STATUS: OUT, toggle 1, zero length, IOC.
        let status_td = &tds[4];
        assert_eq!(status_td.raw_device() & 0xff, PacketId::Out as u8 as u32);
        assert_eq!(status_td.toggle(), 1);
        assert_eq!((status_td.raw_device() >> 21) & 0x7ff, 0x7ff);
        assert_ne!(status_td.raw_status() & td_status::IOC, 0);
        // Chain links are vertical TD pointers, terminated at the end.
        assert_eq!(tds[0].raw_next() & link::TERMINATE, 0);
        assert_ne!(tds[4].raw_next() & link::TERMINATE, 0);
    }

    #[test]
    fn control_completion_counts_payload_only() {
        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let mut batch = make_batch(TransferType::Control, Direction::In, 18, 8, setup);
        assert!(!batch.check_completed());

        retire(&batch, 0, 8);
        retire(&batch, 1, 8);
        retire(&batch, 2, 8);
        retire(&batch, 3, 2);
        retire(&batch, 4, 0);
        assert!(batch.check_completed());
        assert_eq!(batch.base.error, Ok(()));
        assert_eq!(batch.base.transferred_size, 18);
    }

    #[test]
    fn zero_length_control_needs_only_setup_and_status() {
        let setup = [0x00, 0x05, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
        let batch = make_batch(TransferType::Control, Direction::Out, 0, 8, setup);
        assert_eq!(batch.td_total(), 2);

        let tds = batch.test_tds();
        assert_eq!(tds[0].raw_device() & 0xff, PacketId::Setup as u8 as u32);
        // STATUS directly follows SETUP: opposite direction, IOC.
        assert_eq!(tds[1].raw_device() & 0xff, PacketId::In as u8 as u32);
        assert_ne!(tds[1].raw_status() & td_status::IOC, 0);
    }

    #[test]
    fn zero_length_control_reply_subtracts_nothing() {
        let setup = [0x00, 0x05, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
        let mut batch = make_batch(TransferType::Control, Direction::Out, 0, 8, setup);
        // Both stages retired with nothing counted: the setup subtraction
        // only applies when anything at all got through.
        retire(&batch, 0, 0);
        retire(&batch, 1, 0);
        assert!(batch.check_completed());
        assert_eq!(batch.base.error, Ok(()));
        assert_eq!(batch.base.transferred_size, 0);
    }

    #[test]
    fn bulk_toggle_carries_across_batches() {
        let ep = make_endpoint(TransferType::Bulk, Direction::Out, 64);
        for expected_first in [0u32, 1, 0] {
            let buffer = DmaBuffer::alloc(192, 16).unwrap();
            let base = TransferBatch::new(
                Target {
                    address: 1,
                    endpoint: 2,
                },
                Direction::Out,
                [0; SETUP_PACKET_SIZE],
                buffer,
                192,
                Box::new(|_| {}),
            );
            let mut batch = UhciBatch::new(ep.clone(), base);
            batch.prepare().unwrap();
            assert_eq!(batch.td_total(), 3);
            assert_eq!(batch.test_tds()[0].toggle(), expected_first);
            assert_eq!(batch.test_tds()[1].toggle(), expected_first ^ 1);
            // Odd TD count flips the endpoint toggle for the next batch.
            assert_eq!(ep.toggle(), expected_first ^ 1);
        }
    }

    #[test]
    fn short_packet_ends_walk_early() {
        let mut batch = make_batch(
            TransferType::Interrupt,
            Direction::In,
            64,
            64,
            [0; SETUP_PACKET_SIZE],
        );
        assert_eq!(batch.td_total(), 1);
        retire(&batch, 0, 12);
        assert!(batch.check_completed());
        assert_eq!(batch.base.error, Ok(()));
        assert_eq!(batch.base.transferred_size, 12);
    }

    #[test]
    fn error_captures_failing_toggle_and_stops() {
        let mut batch = make_batch(
            TransferType::Control,
            Direction::Out,
            16,
            8,
            [0; SETUP_PACKET_SIZE],
        );
        // SETUP fine, first DATA TD stalls.
        retire(&batch, 0, 8);
        let failing = &batch.test_tds()[1];
        failing.force_status(
            (failing.raw_status() & !td_status::ACTIVE & !td_status::ACTLEN_MASK)
                | td_status::STALLED
                | 0x7ff,
        );
        assert!(batch.check_completed());
        assert_eq!(batch.base.error, Err(UsbError::Stall));
        // Only the 8 setup bytes went through: nothing to report.
        assert_eq!(batch.base.transferred_size, 0);
        // Toggle resynchronized from the failing TD (data stage starts at 1).
        assert_eq!(batch.ep.toggle(), 1);
    }

    #[test]
    fn isochronous_is_rejected() {
        let ep = make_endpoint(TransferType::Isochronous, Direction::In, 64);
        let buffer = DmaBuffer::alloc(64, 16).unwrap();
        let base = TransferBatch::new(
            Target {
                address: 1,
                endpoint: 3,
            },
            Direction::In,
            [0; SETUP_PACKET_SIZE],
            buffer,
            64,
            Box::new(|_| {}),
        );
        let mut batch = UhciBatch::new(ep, base);
        assert_eq!(batch.prepare(), Err(UsbError::NotSupported));
    }
}
