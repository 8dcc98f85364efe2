//! EHCI transfer batch: buffer segmentation into 16 KiB qTDs and the
//! overlay-based completion predicate.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::slice;

use crate::batch::TransferBatch;
use crate::dma::DmaBuffer;
use crate::error::{Result, UsbError};
use crate::usb::{Direction, TransferType, SETUP_PACKET_SIZE};

use super::hw::{Td, TD_MAX_TRANSFER};
use super::EhciEndpoint;

pub struct EhciBatch {
    pub base: TransferBatch,
    pub ep: Arc<EhciEndpoint>,
    /// TD array plus setup bytes; empty until prepared.
    dma: Option<DmaBuffer>,
    td_count: usize,
    /// Data bytes carried by each TD (0 for the setup and status stages),
    /// for accounting partial progress.
    td_data_sizes: Vec<usize>,
}

impl EhciBatch {
    pub fn new(ep: Arc<EhciEndpoint>, base: TransferBatch) -> Box<EhciBatch> {
        Box::new(EhciBatch {
            base,
            ep,
            dma: None,
            td_count: 0,
            td_data_sizes: Vec::new(),
        })
    }

    /// Allocate the TD chain. One TD moves up to 16 KiB; control batches
    /// get a setup and a status stage around the data TDs.
    pub fn prepare(&mut self) -> Result<()> {
        if self.dma.is_some() {
            return Ok(());
        }

        let transfer_type = self.ep.base.props.transfer_type;

        // Control needs no data TDs for a zero-length request; bulk and
        // interrupt always get at least the one zero-length packet.
        let data_tds = self.base.size.div_ceil(TD_MAX_TRANSFER);
        let (td_count, setup_size) = match transfer_type {
            TransferType::Control => (data_tds + 2, SETUP_PACKET_SIZE),
            TransferType::Bulk | TransferType::Interrupt => (data_tds.max(1), 0),
            TransferType::Isochronous => return Err(UsbError::NotSupported),
        };

        let tds_size = td_count * core::mem::size_of::<Td>();
        let dma = DmaBuffer::alloc(tds_size + setup_size, 32)?;

        if setup_size != 0 {
            let setup =
                unsafe { slice::from_raw_parts_mut(dma.as_mut_ptr().add(tds_size), setup_size) };
            setup.copy_from_slice(&self.base.setup);
        }

        self.td_count = td_count;
        self.td_data_sizes = alloc::vec![0; td_count];
        self.dma = Some(dma);

        match transfer_type {
            TransferType::Control => self.build_control(),
            _ => self.build_data(),
        }
        Ok(())
    }

    fn dma(&self) -> &DmaBuffer {
        self.dma.as_ref().expect("batch not prepared")
    }

    fn td(&self, index: usize) -> &Td {
        unsafe { &*(self.dma().as_ptr() as *const Td).add(index) }
    }

    fn td_phys(&self, index: usize) -> u32 {
        self.dma().phys_of(self.td(index) as *const Td)
    }

    fn setup_phys(&self) -> u32 {
        self.dma().phys() + (self.td_count * core::mem::size_of::<Td>()) as u32
    }

    /// SETUP with toggle 0, data stage alternating from 1, opposite-
    /// direction status stage with toggle 1 and the completion interrupt.
    fn build_control(&mut self) {
        let dir = self.base.dir;
        debug_assert!(dir == Direction::In || dir == Direction::Out);

        self.td(0).init(
            self.td_phys(1),
            self.setup_phys(),
            Direction::Both,
            SETUP_PACKET_SIZE,
            Some(false),
            false,
        );

        let mut td = 1;
        let mut toggle = true;
        let mut remain = self.base.size;
        let mut buffer = self.base.buffer.phys();
        while remain > 0 {
            let chunk = remain.min(TD_MAX_TRANSFER);
            self.td(td)
                .init(self.td_phys(td + 1), buffer, dir, chunk, Some(toggle), false);
            self.td_data_sizes[td] = chunk;
            td += 1;
            toggle = !toggle;
            buffer += chunk as u32;
            remain -= chunk;
            debug_assert!(td < self.td_count - 1 || remain == 0);
        }

        debug_assert_eq!(td, self.td_count - 1);
        self.td(td)
            .init(0, 0, dir.reverse(), 0, Some(true), true);
    }

    /// Single-direction chain; the queue head's toggle carry sequences
    /// the packets. The last TD raises the completion interrupt.
    fn build_data(&mut self) {
        let dir = self.base.dir;
        debug_assert!(dir == Direction::In || dir == Direction::Out);

        let mut td = 0;
        let mut remain = self.base.size;
        let mut buffer = self.base.buffer.phys();
        loop {
            let chunk = remain.min(TD_MAX_TRANSFER);
            let last = td + 1 == self.td_count;
            self.td(td).init(
                if last { 0 } else { self.td_phys(td + 1) },
                if chunk == 0 { 0 } else { buffer },
                dir,
                chunk,
                None,
                last,
            );
            self.td_data_sizes[td] = chunk;
            buffer += chunk as u32;
            remain -= chunk;
            td += 1;
            if td == self.td_count {
                break;
            }
        }
    }

    /// Point the queue head's overlay at the chain; the controller picks
    /// it up on its next pass over the schedule.
    pub fn commit(&mut self) {
        self.ep.qh().set_next_td(self.td_phys(0));
    }

    /// False while the queue head reports live work and no halt.
    ///
    /// After an error the halt is cleared so the endpoint can run again
    /// once the class driver recovers; the overlay pointers are scrubbed
    /// either way.
    pub fn check_completed(&mut self) -> bool {
        let ep = self.ep.clone();
        let qh = ep.qh();

        if !qh.halted() && (qh.transfer_pending() || qh.transfer_active()) {
            return false;
        }

        self.base.transferred_size = 0;

        for index in 0..self.td_count {
            let (active, status, remain) = {
                let td = self.td(index);
                (td.is_active(), td.error(), td.remain_size())
            };
            if active {
                // The controller stopped fetching past a short packet;
                // everything before this TD stands.
                break;
            }
            match status {
                Ok(()) => {
                    let data_size = self.td_data_sizes[index];
                    self.base.transferred_size += data_size - remain.min(data_size);
                }
                Err(err) => {
                    self.base.error = Err(err);
                    qh.clear_halt();
                    break;
                }
            }
        }

        if self.base.error.is_err() {
            self.base.transferred_size = 0;
        }
        debug_assert!(self.base.transferred_size <= self.base.size);

        qh.clear_td_pointers();
        true
    }

    #[cfg(test)]
    pub(crate) fn test_td(&self, index: usize) -> &Td {
        self.td(index)
    }

    #[cfg(test)]
    pub(crate) fn td_total(&self) -> usize {
        self.td_count
    }
}

#[cfg(test)]
mod tests {
    use super::super::hw::td_status;
    use super::super::tests::{make_batch_on, make_endpoint};
    use super::*;
    use crate::usb::UsbSpeed;

    #[test]
    fn bulk_8k_high_speed_uses_one_td_with_page_pointers() {
        let ep = make_endpoint(TransferType::Bulk, Direction::Out, UsbSpeed::High, 512);
        let mut batch = make_batch_on(ep, Direction::Out, 8192);
        batch.prepare().unwrap();
        assert_eq!(batch.td_total(), 1);

        let td = batch.test_td(0);
        assert_eq!(
            (td.raw_status() >> td_status::TOTAL_SHIFT) & td_status::TOTAL_MASK,
            8192
        );
        // Last TD raises the completion interrupt.
        assert_ne!(td.raw_status() & td_status::IOC, 0);
        // The QH carries the toggle.
        assert_eq!(td.raw_status() & td_status::TOGGLE, 0);
        // Page-straddling buffer fills consecutive pointers.
        let first = td.raw_buffer_pointer(0);
        assert_ne!(first, 0);
        let second = td.raw_buffer_pointer(1);
        assert_eq!(second & 0xfff, 0);

        // Completion with everything transferred.
        td.retire(0, 0);
        batch.ep.qh().force_idle();
        assert!(batch.check_completed());
        assert_eq!(batch.base.error, Ok(()));
        assert_eq!(batch.base.transferred_size, 8192);
    }

    #[test]
    fn large_control_splits_data_by_16k() {
        let ep = make_endpoint(TransferType::Control, Direction::Both, UsbSpeed::High, 64);
        let mut batch = make_batch_on(ep, Direction::In, 40 * 1024);
        batch.prepare().unwrap();
        // 40 KiB: three data TDs plus setup and status.
        assert_eq!(batch.td_total(), 5);

        let setup = batch.test_td(0);
        assert_eq!(
            (setup.raw_status() >> td_status::PID_SHIFT) & td_status::PID_MASK,
            td_status::PID_SETUP
        );
        assert_eq!(setup.raw_status() & td_status::TOGGLE, 0);

        // Data toggles alternate 1, 0, 1 explicitly.
        for (i, expected) in [(1, true), (2, false), (3, true)] {
            let td = batch.test_td(i);
            assert_eq!(td.raw_status() & td_status::TOGGLE != 0, expected, "td {}", i);
            assert_eq!(
                (td.raw_status() >> td_status::PID_SHIFT) & td_status::PID_MASK,
                td_status::PID_IN
            );
        }

        let status = batch.test_td(4);
        assert_eq!(
            (status.raw_status() >> td_status::PID_SHIFT) & td_status::PID_MASK,
            td_status::PID_OUT
        );
        assert_ne!(status.raw_status() & td_status::TOGGLE, 0);
        assert_ne!(status.raw_status() & td_status::IOC, 0);
    }

    #[test]
    fn commit_points_overlay_at_first_td() {
        let ep = make_endpoint(TransferType::Bulk, Direction::In, UsbSpeed::High, 512);
        let mut batch = make_batch_on(ep.clone(), Direction::In, 512);
        batch.prepare().unwrap();
        batch.commit();
        assert!(ep.qh().transfer_pending());
        assert_eq!(ep.qh().raw_next(), batch.td_phys(0));
        assert!(!batch.check_completed());
    }

    #[test]
    fn short_read_stops_the_walk_successfully() {
        let ep = make_endpoint(TransferType::Bulk, Direction::In, UsbSpeed::High, 512);
        let mut batch = make_batch_on(ep.clone(), Direction::In, 2 * TD_MAX_TRANSFER);
        batch.prepare().unwrap();
        batch.commit();

        // First TD short (12 KiB of 16 KiB), second never fetched.
        batch.test_td(0).retire(0, 4096);
        ep.qh().force_idle();
        assert!(batch.check_completed());
        assert_eq!(batch.base.error, Ok(()));
        assert_eq!(batch.base.transferred_size, TD_MAX_TRANSFER - 4096);
        // Overlay pointers are scrubbed for the next activation.
        assert!(!ep.qh().transfer_pending());
    }

    #[test]
    fn halted_queue_reports_error_and_recovers() {
        let ep = make_endpoint(TransferType::Control, Direction::Both, UsbSpeed::High, 64);
        let mut batch = make_batch_on(ep.clone(), Direction::Out, 64);
        batch.prepare().unwrap();
        batch.commit();

        batch.test_td(0).retire(0, 0);
        batch
            .test_td(1)
            .retire(td_status::HALTED, 64);
        ep.qh().force_halt();

        assert!(batch.check_completed());
        assert_eq!(batch.base.error, Err(UsbError::Stall));
        assert_eq!(batch.base.transferred_size, 0);
        // Halt cleared so the endpoint runs after the class driver's
        // clear-stall.
        assert!(!ep.qh().halted());
    }

    #[test]
    fn isochronous_is_rejected() {
        let ep = make_endpoint(TransferType::Isochronous, Direction::In, UsbSpeed::High, 1024);
        let mut batch = make_batch_on(ep, Direction::In, 1024);
        assert_eq!(batch.prepare(), Err(UsbError::NotSupported));
    }
}
