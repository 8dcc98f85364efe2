//! OHCI (USB 1.1) host controller driver.
//!
//! OHCI is the memory-mapped USB 1.1 personality: endpoint descriptors
//! chained per transfer class, general TDs on a head/tail pair per
//! endpoint, and the shared HCCA page carrying the 32 periodic list heads.
//!
//! # References
//! - OpenHCI Specification for USB, release 1.0a

pub mod batch;
pub mod endpoint_list;
pub mod hw;
pub mod regs;
pub mod rh;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::batch::{CompletionCallback, TransferBatch};
use crate::bus::{AddressAllocator, HostController};
use crate::dma::DmaBuffer;
use crate::endpoint::{Endpoint, EndpointProps};
use crate::error::{Result, UsbError};
use crate::time::{delay_ms, Timeout};
use crate::usb::{Direction, TransferType, SETUP_PACKET_SIZE};

use batch::OhciBatch;
use endpoint_list::EndpointList;
use hw::{Ed, Hcca, Td, HCCA_INT_EP_COUNT};
use regs::{clr_bits, cmd_status, control, fm_interval, int, rd, revision, set_bits, wr, OhciRegs};
use rh::OhciRh;

const USED_INTERRUPTS: u32 = int::SO | int::WDH | int::UE | int::RHSC;

/// Per-endpoint OHCI state: the ED and the two TD cells the commit
/// protocol swaps between dummy-tail and first-of-chain duty.
pub struct OhciEndpoint {
    pub base: Endpoint<OhciBatch>,
    dma: DmaBuffer,
    pub(crate) tds: Mutex<[*mut Td; 2]>,
}

unsafe impl Send for OhciEndpoint {}
unsafe impl Sync for OhciEndpoint {}

impl OhciEndpoint {
    pub fn new(props: EndpointProps) -> Result<Arc<OhciEndpoint>> {
        let ed_size = core::mem::size_of::<Ed>();
        let td_size = core::mem::size_of::<Td>();
        let dma = DmaBuffer::alloc(ed_size + 2 * td_size, 32)?;
        let tds = [
            unsafe { dma.as_mut_ptr().add(ed_size) as *mut Td },
            unsafe { dma.as_mut_ptr().add(ed_size + td_size) as *mut Td },
        ];
        Ok(Arc::new(OhciEndpoint {
            base: Endpoint::new(props),
            dma,
            tds: Mutex::new(tds),
        }))
    }

    pub fn ed(&self) -> &Ed {
        unsafe { &*(self.dma.as_ptr() as *const Ed) }
    }

    pub fn ed_phys(&self) -> u32 {
        self.dma.phys()
    }

    pub(crate) fn td_phys(&self, td: *mut Td) -> u32 {
        self.dma.phys_of(td)
    }
}

pub struct Ohci {
    regs: *const OhciRegs,
    hcca: DmaBuffer,
    list_control: EndpointList,
    list_bulk: EndpointList,
    list_interrupt: EndpointList,
    list_isochronous: EndpointList,
    /// Endpoints with a committed batch, scanned on writeback-done-head.
    pending: Mutex<Vec<Arc<OhciEndpoint>>>,
    rh: OhciRh,
    addresses: AddressAllocator,
}

unsafe impl Send for Ohci {}
unsafe impl Sync for Ohci {}

impl Ohci {
    /// Build the driver's memory structures over the controller's
    /// register block. Hardware is untouched until [`Ohci::start`].
    pub fn new(mmio_base: *mut u8) -> Result<Ohci> {
        let regs = mmio_base as *const OhciRegs;

        let list_control = EndpointList::new("control")?;
        let list_bulk = EndpointList::new("bulk")?;
        let list_interrupt = EndpointList::new("interrupt")?;
        let list_isochronous = EndpointList::new("isochronous")?;
        list_interrupt.set_next(&list_isochronous);

        let hcca = DmaBuffer::alloc(core::mem::size_of::<Hcca>(), 256)?;
        let hcca_ref = unsafe { &*(hcca.as_ptr() as *const Hcca) };
        for i in 0..HCCA_INT_EP_COUNT {
            hcca_ref.set_int_ep(i, list_interrupt.head_phys());
        }

        let addresses = AddressAllocator::new();
        let rh = OhciRh::new(regs);
        rh.set_address(addresses.device_enumerate()?);

        Ok(Ohci {
            regs,
            hcca,
            list_control,
            list_bulk,
            list_interrupt,
            list_isochronous,
            pending: Mutex::new(Vec::new()),
            rh,
            addresses,
        })
    }

    fn regs(&self) -> &OhciRegs {
        unsafe { &*self.regs }
    }

    fn hcca(&self) -> &Hcca {
        unsafe { &*(self.hcca.as_ptr() as *const Hcca) }
    }

    pub fn roothub(&self) -> &OhciRh {
        &self.rh
    }

    pub fn addresses(&self) -> &AddressAllocator {
        &self.addresses
    }

    /// Take the controller away from whatever firmware drove it before
    /// (OHCI spec 5.1.1.3).
    fn gain_control(&self) {
        let regs = self.regs();

        if rd(&regs.revision) & revision::LEGACY != 0 {
            // Kill the keyboard emulation, keeping only the A20 state bit;
            // clearing that one restarts some machines.
            let legacy = unsafe {
                &*((self.regs as *const u8).add(regs::LEGACY_REGS_OFFSET) as *const crate::mem::Le32)
            };
            crate::mem::clr_bits(legacy, !0x100);
            log::debug!("OHCI: legacy emulation disabled");
        }

        if rd(&regs.control) & control::IR != 0 {
            // An SMM driver owns the controller; ask for it.
            log::debug!("OHCI: requesting ownership from SMM driver");
            set_bits(&regs.command_status, cmd_status::OCR);
            let timeout = Timeout::from_ms(100);
            while rd(&regs.control) & control::IR != 0 && !timeout.is_expired() {
                core::hint::spin_loop();
            }
            wr(
                &regs.control,
                (rd(&regs.control) & !control::HCFS_MASK) | control::HCFS_RESET,
            );
            delay_ms(50);
            return;
        }

        let state = rd(&regs.control) & control::HCFS_MASK;
        if state != control::HCFS_RESET {
            if state == control::HCFS_OPERATIONAL {
                log::debug!("OHCI: BIOS left the controller operational");
                return;
            }
            // Suspended by the BIOS; resume takes 20 ms.
            wr(
                &regs.control,
                (rd(&regs.control) & !control::HCFS_MASK) | control::HCFS_RESUME,
            );
            delay_ms(20);
            return;
        }

        // Cold start: hold reset for the 50 ms the USB spec demands.
        delay_ms(50);
    }

    /// Hardware initialization (OHCI spec 5.1.1.4): reset, program the
    /// schedule bases, enable the lists and go operational.
    pub fn start(&self) {
        let regs = self.regs();

        self.gain_control();
        self.rh.init_power_switching();

        // HCRESET wipes HcFmInterval; keep the value across it.
        let saved_fm_interval = rd(&regs.fm_interval);

        wr(&regs.command_status, cmd_status::HCR);
        let timeout = Timeout::from_ms(10);
        while rd(&regs.command_status) & cmd_status::HCR != 0 {
            if timeout.is_expired() {
                log::warn!("OHCI: controller reset did not complete");
                break;
            }
            core::hint::spin_loop();
        }
        wr(&regs.fm_interval, saved_fm_interval);

        wr(&regs.hcca, self.hcca.phys());
        wr(&regs.control_head, self.list_control.head_phys());
        wr(&regs.bulk_head, self.list_bulk.head_phys());

        set_bits(
            &regs.control,
            control::PLE | control::IE | control::CLE | control::BLE,
        );

        wr(&regs.interrupt_status, !0);
        wr(&regs.interrupt_enable, USED_INTERRUPTS | int::MIE);

        // Start periodic processing at 90% of the frame interval.
        let frame_length = saved_fm_interval & fm_interval::FI_MASK;
        wr(
            &regs.periodic_start,
            (frame_length / 10 * 9) & regs::PERIODIC_START_MASK,
        );

        wr(
            &regs.control,
            (rd(&regs.control) & !control::HCFS_MASK) | control::HCFS_OPERATIONAL,
        );
        log::info!("OHCI: controller operational");
    }

    fn list_for(&self, transfer_type: TransferType) -> &EndpointList {
        match transfer_type {
            TransferType::Control => &self.list_control,
            TransferType::Bulk => &self.list_bulk,
            TransferType::Interrupt => &self.list_interrupt,
            TransferType::Isochronous => &self.list_isochronous,
        }
    }

    /// Link an ED into its schedule list with that list's processing
    /// paused; the current-ED register is cleared so the controller
    /// restarts the walk from the head.
    fn enqueue_endpoint(&self, ep: &Arc<OhciEndpoint>) {
        let regs = self.regs();
        match ep.base.props.transfer_type {
            TransferType::Control => {
                clr_bits(&regs.control, control::CLE);
                self.list_control.append_ep(ep);
                wr(&regs.control_current, 0);
                set_bits(&regs.control, control::CLE);
            }
            TransferType::Bulk => {
                clr_bits(&regs.control, control::BLE);
                self.list_bulk.append_ep(ep);
                wr(&regs.bulk_current, 0);
                set_bits(&regs.control, control::BLE);
            }
            TransferType::Interrupt | TransferType::Isochronous => {
                clr_bits(&regs.control, control::PLE | control::IE);
                self.list_for(ep.base.props.transfer_type).append_ep(ep);
                set_bits(&regs.control, control::PLE | control::IE);
            }
        }
    }

    fn dequeue_endpoint(&self, ep: &Arc<OhciEndpoint>) {
        let regs = self.regs();
        match ep.base.props.transfer_type {
            TransferType::Control => {
                clr_bits(&regs.control, control::CLE);
                self.list_control.remove_ep(ep);
                wr(&regs.control_current, 0);
                set_bits(&regs.control, control::CLE);
            }
            TransferType::Bulk => {
                clr_bits(&regs.control, control::BLE);
                self.list_bulk.remove_ep(ep);
                wr(&regs.bulk_current, 0);
                set_bits(&regs.control, control::BLE);
            }
            TransferType::Interrupt | TransferType::Isochronous => {
                clr_bits(&regs.control, control::PLE | control::IE);
                self.list_for(ep.base.props.transfer_type).remove_ep(ep);
                set_bits(&regs.control, control::PLE | control::IE);
            }
        }
    }

    /// Writeback-done-head: find finished batches among the pending
    /// endpoints.
    fn scan_pending(&self) {
        let mut finished: Vec<Box<OhciBatch>> = Vec::new();
        {
            let mut pending = self.pending.lock();
            pending.retain(|ep| {
                let done = ep
                    .base
                    .with_active(|b| b.map(|b| b.check_completed()).unwrap_or(true));
                if !done {
                    return true;
                }
                if let Some(batch) = ep.base.deactivate() {
                    finished.push(batch);
                }
                false
            });
        }
        for mut batch in finished {
            if batch.base.error.is_err()
                && batch.ep.base.props.transfer_type != TransferType::Control
            {
                batch.ep.ed().set_toggle(0);
            }
            batch.base.finish();
        }
    }
}

impl HostController for Ohci {
    type Endpoint = OhciEndpoint;
    type Batch = OhciBatch;

    fn used_interrupts(&self) -> u32 {
        USED_INTERRUPTS
    }

    fn status(&self) -> u32 {
        let regs = self.regs();
        let status = rd(&regs.interrupt_status);
        wr(&regs.interrupt_status, status);
        status
    }

    fn interrupt(&self, status: u32) {
        if status & !int::SF == 0 {
            return;
        }

        if status & int::RHSC != 0 {
            self.rh.interrupt();
        }

        if status & int::WDH != 0 {
            log::debug!(
                "OHCI: done head {:#x}, frame {}",
                self.hcca().done_head(),
                self.hcca().frame_number()
            );
            self.scan_pending();
        }

        if status & int::UE != 0 {
            log::error!("OHCI: unrecoverable error, restarting controller");
            self.start();
        }
    }

    fn endpoint_create(&self, props: EndpointProps) -> Result<Arc<OhciEndpoint>> {
        OhciEndpoint::new(props)
    }

    fn endpoint_register(&self, ep: &Arc<OhciEndpoint>) -> Result<()> {
        let dummy_phys = {
            let tds = ep.tds.lock();
            ep.td_phys(tds[0])
        };
        ep.ed().init(Some(&ep.base.props), dummy_phys);
        self.enqueue_endpoint(ep);
        ep.base.set_online();
        Ok(())
    }

    /// Unlink the ED and cancel its in-flight batch. After the list is
    /// disabled and relinked the controller may still finish the current
    /// frame with the ED cached; one frame of quiet covers that before
    /// the batch memory is released.
    fn endpoint_unregister(&self, ep: &Arc<OhciEndpoint>) {
        ep.base.set_offline();

        let timeout = Timeout::from_ms(10);
        while ep.base.has_active() && !timeout.is_expired() {
            core::hint::spin_loop();
        }

        self.dequeue_endpoint(ep);
        delay_ms(1);

        let batch = {
            let mut pending = self.pending.lock();
            pending.retain(|p| !Arc::ptr_eq(p, ep));
            ep.base.deactivate()
        };
        if let Some(mut batch) = batch {
            batch.base.fail(UsbError::Interrupted);
        }
    }

    fn batch_create(
        &self,
        ep: &Arc<OhciEndpoint>,
        dir: Direction,
        setup: [u8; SETUP_PACKET_SIZE],
        buffer: DmaBuffer,
        size: usize,
        on_complete: CompletionCallback,
    ) -> Result<Box<OhciBatch>> {
        let base = TransferBatch::new(ep.base.props.target, dir, setup, buffer, size, on_complete);
        Ok(OhciBatch::new(ep.clone(), base))
    }

    fn batch_schedule(&self, mut batch: Box<OhciBatch>) -> Result<()> {
        if batch.base.target.address == self.rh.address() {
            return self.rh.schedule(batch);
        }

        if let Err(err) = batch.prepare() {
            batch.base.fail(err);
            return Err(err);
        }

        let ep = batch.ep.clone();
        let transfer_type = ep.base.props.transfer_type;
        {
            let mut pending = self.pending.lock();
            if let Err((err, mut batch)) = ep.base.activate(batch) {
                drop(pending);
                batch.base.fail(err);
                return Err(err);
            }
            ep.base
                .with_active(|b| b.expect("batch just activated").commit());
            pending.push(ep.clone());
        }

        // Control and bulk processing needs a kick to notice new work.
        let regs = self.regs();
        match transfer_type {
            TransferType::Control => set_bits(&regs.command_status, cmd_status::CLF),
            TransferType::Bulk => set_bits(&regs.command_status, cmd_status::BLF),
            _ => {}
        }
        Ok(())
    }

    fn rh_address(&self) -> u8 {
        self.rh.address()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::usb::{Target, UsbSpeed};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    pub(crate) fn leak_regs() -> &'static OhciRegs {
        crate::dma::ensure_test_pool();
        Box::leak(Box::new(unsafe { core::mem::zeroed::<OhciRegs>() }))
    }

    pub(crate) fn make_endpoint(
        transfer_type: TransferType,
        dir: Direction,
        mps: u16,
    ) -> Arc<OhciEndpoint> {
        let ep = OhciEndpoint::new(EndpointProps::new(
            Target {
                address: 2,
                endpoint: 1,
            },
            dir,
            transfer_type,
            UsbSpeed::Full,
            mps,
        ))
        .unwrap();
        let dummy = {
            let tds = ep.tds.lock();
            ep.td_phys(tds[0])
        };
        ep.ed().init(Some(&ep.base.props), dummy);
        ep.base.set_online();
        ep
    }

    pub(crate) fn make_batch_on(
        ep: Arc<OhciEndpoint>,
        dir: Direction,
        size: usize,
    ) -> Box<OhciBatch> {
        let buffer = DmaBuffer::alloc(size.max(1), 16).unwrap();
        let base = TransferBatch::new(
            ep.base.props.target,
            dir,
            [0; SETUP_PACKET_SIZE],
            buffer,
            size,
            Box::new(|_| {}),
        );
        OhciBatch::new(ep, base)
    }

    fn make_hc(ports: u32) -> (&'static OhciRegs, Ohci) {
        let regs = leak_regs();
        wr(&regs.rh_desc_a, ports);
        let hc = Ohci::new(regs as *const OhciRegs as *mut u8).unwrap();
        (regs, hc)
    }

    #[test]
    fn hcca_entries_point_at_interrupt_list() {
        let (_regs, hc) = make_hc(2);
        for i in [0usize, 15, 31] {
            assert_eq!(hc.hcca().int_ep(i), hc.list_interrupt.head_phys());
        }
    }

    #[test]
    fn register_programs_ed_and_links_list() {
        let (regs, hc) = make_hc(2);
        let ep = make_endpoint(TransferType::Bulk, Direction::Out, 64);
        hc.endpoint_register(&ep).unwrap();
        assert_eq!(hc.list_bulk.hw_chain(), vec![ep.ed_phys()]);
        // The list-enable bit is back on after the edit.
        assert_ne!(rd(&regs.control) & control::BLE, 0);

        hc.endpoint_unregister(&ep);
        assert!(hc.list_bulk.hw_chain().is_empty());
    }

    #[test]
    fn schedule_kicks_bulk_filled_and_completes_on_wdh() {
        let (regs, hc) = make_hc(2);
        let ep = make_endpoint(TransferType::Bulk, Direction::Out, 64);
        hc.endpoint_register(&ep).unwrap();

        let finished = StdArc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let buffer = DmaBuffer::alloc(64, 16).unwrap();
        let batch = hc
            .batch_create(
                &ep,
                Direction::Out,
                [0; SETUP_PACKET_SIZE],
                buffer,
                64,
                Box::new(move |b| {
                    assert_eq!(b.error, Ok(()));
                    assert_eq!(b.transferred_size, 64);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        hc.batch_schedule(batch).unwrap();
        assert_ne!(rd(&regs.command_status) & cmd_status::BLF, 0);

        // Still running: WDH scan leaves it pending.
        hc.interrupt(int::WDH);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        // Retire the TD and drain the ED.
        ep.base.with_active(|b| {
            let b = b.unwrap();
            b.test_td(0).retire(hw::cc::NO_ERROR, None);
        });
        ep.ed().set_head_td(ep.ed().tail_td());
        hc.interrupt(int::WDH);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!ep.base.has_active());
    }

    #[test]
    fn unregister_mid_transfer_interrupts_batch() {
        let (_regs, hc) = make_hc(2);
        let ep = make_endpoint(TransferType::Bulk, Direction::In, 64);
        hc.endpoint_register(&ep).unwrap();

        let finished = StdArc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let buffer = DmaBuffer::alloc(4096, 16).unwrap();
        let batch = hc
            .batch_create(
                &ep,
                Direction::In,
                [0; SETUP_PACKET_SIZE],
                buffer,
                4096,
                Box::new(move |b| {
                    assert_eq!(b.error, Err(UsbError::Interrupted));
                    assert_eq!(b.transferred_size, 0);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        hc.batch_schedule(batch).unwrap();

        hc.endpoint_unregister(&ep);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(hc.list_bulk.hw_chain().is_empty());
        assert!(hc.pending.lock().is_empty());
    }

    #[test]
    fn root_hub_descriptor_request_is_routed() {
        let (regs, hc) = make_hc(3 | regs::rh_desc_a::PSM);
        let _ = regs;
        let rh_addr = hc.rh_address();
        let ep = OhciEndpoint::new(EndpointProps::new(
            Target {
                address: rh_addr,
                endpoint: 0,
            },
            Direction::Both,
            TransferType::Control,
            UsbSpeed::Full,
            64,
        ))
        .unwrap();
        ep.base.set_online();

        let finished = StdArc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        // Class GetDescriptor(hub).
        let setup = [0xa0, 0x06, 0x00, 0x29, 0x00, 0x00, 0x0f, 0x00];
        let buffer = DmaBuffer::alloc(15, 16).unwrap();
        let batch = hc
            .batch_create(
                &ep,
                Direction::In,
                setup,
                buffer,
                15,
                Box::new(move |b| {
                    assert_eq!(b.error, Ok(()));
                    let data = unsafe { b.buffer.as_slice() };
                    assert_eq!(data[2], 3);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        hc.batch_schedule(batch).unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_change_batch_parks_until_rhsc() {
        let (regs, hc) = make_hc(2);
        let rh_addr = hc.rh_address();
        let ep = OhciEndpoint::new(EndpointProps::new(
            Target {
                address: rh_addr,
                endpoint: 1,
            },
            Direction::In,
            TransferType::Interrupt,
            UsbSpeed::Full,
            8,
        ))
        .unwrap();
        ep.base.set_online();

        let finished = StdArc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let buffer = DmaBuffer::alloc(8, 16).unwrap();
        let batch = hc
            .batch_create(
                &ep,
                Direction::In,
                [0; SETUP_PACKET_SIZE],
                buffer,
                8,
                Box::new(move |b| {
                    assert_eq!(b.error, Ok(()));
                    let data = unsafe { b.buffer.as_slice() };
                    // Port 1 (bit 2) changed.
                    assert_eq!(data[0], 0b100);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        hc.batch_schedule(batch).unwrap();
        // Nothing to report: parked, not finished.
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(ep.base.has_active());

        // A connect change on port 1 arrives with the RHSC interrupt.
        wr(&regs.rh_port_status[1], regs::rh_port_status::CSC);
        hc.interrupt(int::RHSC);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!ep.base.has_active());
    }
}
