//! OHCI transfer batch: TD chain construction against the endpoint's
//! head/tail descriptor pair, and the completion predicate.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::slice;

use crate::batch::TransferBatch;
use crate::dma::DmaBuffer;
use crate::error::{Result, UsbError};
use crate::usb::{Direction, TransferType, SETUP_PACKET_SIZE};

use super::hw::Td;
use super::OhciEndpoint;

pub struct OhciBatch {
    pub base: TransferBatch,
    pub ep: Arc<OhciEndpoint>,
    /// TD cells plus setup bytes; empty until prepared.
    dma: Option<DmaBuffer>,
    /// The working TD chain. After commit the first entry aliases the
    /// endpoint's dummy cell, which the controller executes in place of
    /// our first TD.
    tds: Vec<*mut Td>,
    td_count: usize,
}

unsafe impl Send for OhciBatch {}

impl OhciBatch {
    pub fn new(ep: Arc<OhciEndpoint>, base: TransferBatch) -> Box<OhciBatch> {
        Box::new(OhciBatch {
            base,
            ep,
            dma: None,
            tds: Vec::new(),
            td_count: 0,
        })
    }

    /// Allocate the TD cells and build the chain. One TD per packet; the
    /// endpoint toggle carry drives bulk and interrupt toggles.
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
        let dma = DmaBuffer::alloc(tds_size + setup_size, 32)?;

        let tds: Vec<*mut Td> = (0..td_count)
            .map(|i| unsafe { (dma.as_mut_ptr() as *mut Td).add(i) })
            .collect();

        if setup_size != 0 {
            let setup =
                unsafe { slice::from_raw_parts_mut(dma.as_mut_ptr().add(tds_size), setup_size) };
            setup.copy_from_slice(&self.base.setup);
        }

        self.td_count = td_count;
        self.tds = tds;
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
        unsafe { &*self.tds[index] }
    }

    fn td_phys(&self, index: usize) -> u32 {
        self.dma().phys_of(self.tds[index])
    }

    fn setup_phys(&self) -> u32 {
        self.dma().phys() + (self.td_count * core::mem::size_of::<Td>()) as u32
    }

    /// SETUP with toggle 0, data stage alternating from 1, opposite-
    /// direction zero-length status with toggle 1.
    fn build_control(&self) {
        let dir = self.base.dir;
        debug_assert!(dir == Direction::In || dir == Direction::Out);
        let mps = self.ep.base.props.max_packet_size as usize;

        self.td(0).init(
            self.td_phys(1),
            Direction::Both,
            self.setup_phys(),
            SETUP_PACKET_SIZE,
            Some(false),
        );

        let mut td = 1;
        let mut toggle = true;
        let mut remain = self.base.size;
        let mut buffer = self.base.buffer.phys();
        while remain > 0 {
            let packet = remain.min(mps);
            self.td(td)
                .init(self.td_phys(td + 1), dir, buffer, packet, Some(toggle));
            td += 1;
            toggle = !toggle;
            buffer += packet as u32;
            remain -= packet;
            debug_assert!(td < self.td_count);
        }

        debug_assert_eq!(td, self.td_count - 1);
        // The final link is filled in at commit, when the endpoint's new
        // dummy tail is known.
        self.td(td).init(0, dir.reverse(), 0, 0, Some(true));
    }

    /// Single-direction chain; the ED's toggle carry sequences the
    /// packets.
    fn build_data(&self) {
        let dir = self.base.dir;
        debug_assert!(dir == Direction::In || dir == Direction::Out);
        let mps = self.ep.base.props.max_packet_size as usize;

        let mut td = 0;
        let mut remain = self.base.size;
        let mut buffer = self.base.buffer.phys();
        loop {
            let packet = remain.min(mps);
            let next = if td + 1 < self.td_count {
                self.td_phys(td + 1)
            } else {
                0
            };
            self.td(td).init(
                next,
                dir,
                if packet == 0 { 0 } else { buffer },
                packet,
                None,
            );
            td += 1;
            buffer += packet as u32;
            remain -= packet;
            if td == self.td_count {
                break;
            }
        }
    }

    /// Hand the chain to the hardware.
    ///
    /// The controller is already executing the ED whose head points at the
    /// endpoint's dummy TD, so the first chain TD is copied into that
    /// dummy cell, the old spare dummy becomes the new tail, and moving
    /// the tail pointer is what publishes the work.
    pub fn commit(&mut self) {
        let mut ep_tds = self.ep.tds.lock();

        let dummy = unsafe { &*ep_tds[0] };
        dummy.raw_copy_from(self.td(0));
        self.tds[0] = ep_tds[0];

        let new_tail = ep_tds[1];
        let new_tail_phys = self.ep.td_phys(new_tail);
        unsafe { &*self.tds[self.td_count - 1] }.set_next(new_tail_phys);

        crate::mem::write_barrier();
        self.ep.ed().set_tail_td(new_tail_phys);

        ep_tds.swap(0, 1);
    }

    /// False while the ED still has work and no error; otherwise harvest
    /// the TDs. On an error the ED head is parked back on the endpoint's
    /// dummy and the halt cleared so the next batch can run.
    pub fn check_completed(&mut self) -> bool {
        let ep = self.ep.clone();
        let ed = ep.ed();

        if !ed.inactive() && ed.transfer_pending() {
            return false;
        }

        self.base.transferred_size = self.base.size;

        for index in 0..self.td_count {
            let (status, remain) = {
                let td = self.td(index);
                (td.error(), td.remain_size())
            };
            match status {
                Ok(()) => {
                    // Retired TDs report the bytes they did not move;
                    // short input packets land in the last TD executed.
                    self.base.transferred_size -= remain.min(self.base.transferred_size);
                }
                Err(err) => {
                    self.base.error = Err(err);
                    debug_assert!(ed.inactive());
                    // Park the head on the endpoint dummy: head == tail,
                    // nothing left to execute, and the chain's TDs are
                    // all ours again.
                    let dummy_phys = {
                        let ep_tds = ep.tds.lock();
                        ep.td_phys(ep_tds[0])
                    };
                    ed.set_head_td(dummy_phys);
                    ed.clear_halt();
                    break;
                }
            }
        }

        if self.base.error.is_err() {
            self.base.transferred_size = 0;
        }
        debug_assert!(self.base.transferred_size <= self.base.size);
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
