//! UHCI (USB 1.1) host controller driver.
//!
//! UHCI is the programmed-I/O personality: 16-bit registers in x86 I/O
//! space, a 4 KiB frame list of link pointers, and a chain of four
//! schedule queues (interrupt, low-speed control, full-speed control,
//! bulk) walked every millisecond frame.
//!
//! # References
//! - UHCI Design Guide revision 1.1

pub mod batch;
pub mod hw;
pub mod regs;
pub mod rh;
pub mod transfer_list;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::batch::{CompletionCallback, TransferBatch};
use crate::bus::{AddressAllocator, HostController};
use crate::dma::DmaBuffer;
use crate::endpoint::{Endpoint, EndpointProps};
use crate::error::{Result, UsbError};
use crate::io::{PciConfig, PortIo};
use crate::time::{delay_ms, Timeout};
use crate::usb::{Direction, TransferType, UsbSpeed, SETUP_PACKET_SIZE};

use batch::UhciBatch;
use hw::link;
use regs::{cmd, intr, sts, UhciRegs};
use rh::UhciRh;
use transfer_list::TransferList;

/// Consecutive hardware failures tolerated before the controller is
/// declared dead.
const ALLOWED_HW_FAILURES: u32 = 5;

const FRAME_LIST_COUNT: usize = 1024;

/// PCI legacy-support register; writing the magic value clears the
/// keyboard/mouse emulation traps and all its write-1-to-clear bits
/// (UHCI Design Guide p. 45).
const PCI_LEGSUP_OFFSET: u16 = 0xc0;
const PCI_LEGSUP_CLEAR: u16 = 0xaf00;

/// Per-endpoint UHCI state: the generic endpoint plus the software-managed
/// data toggle (UHCI queue heads do not carry one).
pub struct UhciEndpoint {
    pub base: Endpoint<UhciBatch>,
    toggle: AtomicU32,
}

impl UhciEndpoint {
    pub fn new(props: EndpointProps) -> Arc<UhciEndpoint> {
        Arc::new(UhciEndpoint {
            base: Endpoint::new(props),
            toggle: AtomicU32::new(0),
        })
    }

    pub fn toggle(&self) -> u32 {
        self.toggle.load(Ordering::Acquire)
    }

    pub fn set_toggle(&self, toggle: u32) {
        self.toggle.store(toggle & 1, Ordering::Release);
    }
}

pub struct Uhci {
    regs: UhciRegs,
    frame_list: DmaBuffer,
    transfers_interrupt: TransferList,
    transfers_control_slow: TransferList,
    transfers_control_full: TransferList,
    transfers_bulk_full: TransferList,
    rh: UhciRh,
    addresses: AddressAllocator,
    hw_failures: AtomicU32,
    gone: AtomicBool,
}

impl Uhci {
    /// Set up the driver's memory structures and hand the controller's
    /// legacy traps back to the OS. The hardware is not started yet; call
    /// [`Uhci::start`] once interrupts are wired up.
    pub fn new(io: Arc<dyn PortIo>, io_base: u16, pci: Option<&dyn PciConfig>) -> Result<Uhci> {
        if let Some(pci) = pci {
            if let Err(err) = pci.write16(PCI_LEGSUP_OFFSET, PCI_LEGSUP_CLEAR) {
                log::warn!("UHCI: failed to disable legacy support: {}", err);
            }
        }

        let regs = UhciRegs::new(io, io_base);

        let frame_list = DmaBuffer::alloc(FRAME_LIST_COUNT * 4, 4096)?;

        let transfers_interrupt = TransferList::new("interrupt")?;
        let transfers_control_slow = TransferList::new("control slow")?;
        let transfers_control_full = TransferList::new("control full")?;
        let transfers_bulk_full = TransferList::new("bulk full")?;

        // One hardware chain: interrupt, low-speed control, full-speed
        // control, bulk. Bulk points back at full-speed control for
        // bandwidth reclamation.
        transfers_interrupt.set_next(&transfers_control_slow);
        transfers_control_slow.set_next(&transfers_control_full);
        transfers_control_full.set_next(&transfers_bulk_full);
        transfers_bulk_full.set_next(&transfers_control_full);

        // Every frame enters the schedule at the interrupt queue.
        let entry = link::qh(transfers_interrupt.head_phys());
        let frames = frame_list.as_mut_ptr() as *mut u32;
        for i in 0..FRAME_LIST_COUNT {
            unsafe { frames.add(i).write_volatile(entry.to_le()) };
        }

        let addresses = AddressAllocator::new();
        let rh = UhciRh::new(regs.clone());
        rh.set_address(addresses.device_enumerate()?);

        log::debug!("UHCI: frame list and transfer queues initialized");

        Ok(Uhci {
            regs,
            frame_list,
            transfers_interrupt,
            transfers_control_slow,
            transfers_control_full,
            transfers_bulk_full,
            rh,
            addresses,
            hw_failures: AtomicU32::new(0),
            gone: AtomicBool::new(false),
        })
    }

    /// Reset and start the controller hardware.
    pub fn start(&self) {
        self.init_hw();
    }

    pub fn roothub(&self) -> &UhciRh {
        &self.rh
    }

    pub fn addresses(&self) -> &AddressAllocator {
        &self.addresses
    }

    /// Bring the hardware to a known state and let it run.
    ///
    /// Also the recovery path after a host error; the global reset drops
    /// every port, which the hub driver observes as disconnects.
    fn init_hw(&self) {
        let regs = &self.regs;

        // Global reset first; 50 ms is the root-port reset time the USB
        // spec demands.
        regs.write_cmd(cmd::GLOBAL_RESET);
        delay_ms(50);
        regs.write_cmd(0);

        regs.write_cmd(cmd::HCRESET);
        let timeout = Timeout::from_ms(500);
        while regs.read_cmd() & cmd::HCRESET != 0 {
            if timeout.is_expired() {
                log::warn!("UHCI: HCRESET did not self-clear");
                break;
            }
            core::hint::spin_loop();
        }

        // Exactly 1 ms frames.
        regs.write_sofmod(64);
        regs.write_frame_list_base(self.frame_list.phys());
        regs.write_intr(intr::ALLOWED);

        let stale = regs.read_cmd();
        if stale != 0 {
            log::warn!("UHCI: previous command register value {:#x}", stale);
        }

        regs.write_cmd(cmd::RUN_STOP | cmd::CONFIGURE | cmd::MAX_PACKET_64);
        log::info!("UHCI: controller started");
    }

    fn lists(&self) -> [&TransferList; 4] {
        [
            &self.transfers_interrupt,
            &self.transfers_control_slow,
            &self.transfers_control_full,
            &self.transfers_bulk_full,
        ]
    }

    fn list_for(&self, props: &EndpointProps) -> Result<&TransferList> {
        match props.transfer_type {
            TransferType::Control if props.speed == UsbSpeed::Low => {
                Ok(&self.transfers_control_slow)
            }
            TransferType::Control => Ok(&self.transfers_control_full),
            TransferType::Bulk => Ok(&self.transfers_bulk_full),
            TransferType::Interrupt => Ok(&self.transfers_interrupt),
            TransferType::Isochronous => Err(UsbError::NotSupported),
        }
    }

    /// Hardware failure handling: abort everything, then either retry the
    /// hardware or give up after too many strikes.
    fn handle_hw_failure(&self) {
        log::error!("UHCI: hardware failure");
        for list in self.lists() {
            list.abort_all();
        }
        let failures = self.hw_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < ALLOWED_HW_FAILURES {
            self.init_hw();
        } else {
            log::error!("UHCI: too many hardware failures, controller is gone");
            self.gone.store(true, Ordering::Release);
        }
    }
}

impl HostController for Uhci {
    type Endpoint = UhciEndpoint;
    type Batch = UhciBatch;

    fn used_interrupts(&self) -> u32 {
        (sts::USED_INTERRUPTS | sts::NM_INTERRUPTS) as u32
    }

    fn status(&self) -> u32 {
        let status = self.regs.read_status();
        self.regs.write_status(status);
        status as u32
    }

    fn interrupt(&self, status: u32) {
        let status = status as u16;

        if status & (sts::INTERRUPT | sts::ERROR_INTERRUPT) != 0 {
            for list in self.lists() {
                list.check_finished();
            }
        }

        if status & sts::RESUME != 0 {
            log::error!("UHCI: resume interrupt not supported");
        }

        if status & sts::NM_INTERRUPTS != 0 {
            self.handle_hw_failure();
        }
    }

    fn endpoint_create(&self, props: EndpointProps) -> Result<Arc<UhciEndpoint>> {
        // Admission check: the endpoint must map to a schedule queue.
        self.list_for(&props)?;
        Ok(UhciEndpoint::new(props))
    }

    fn endpoint_register(&self, ep: &Arc<UhciEndpoint>) -> Result<()> {
        ep.base.set_online();
        Ok(())
    }

    /// Offline the endpoint and cancel its in-flight batch.
    ///
    /// The batch gets a short grace period to complete naturally. After
    /// unlinking, the controller may still hold a cached pointer for up to
    /// a frame or two; the extra wait drains it before the TD memory is
    /// reused.
    fn endpoint_unregister(&self, ep: &Arc<UhciEndpoint>) {
        ep.base.set_offline();

        let timeout = Timeout::from_ms(10);
        while ep.base.has_active() && !timeout.is_expired() {
            core::hint::spin_loop();
        }

        let Ok(list) = self.list_for(&ep.base.props) else {
            return;
        };
        if let Some(mut batch) = list.remove_endpoint(ep) {
            delay_ms(20);
            batch.base.fail(UsbError::Interrupted);
        }
    }

    fn batch_create(
        &self,
        ep: &Arc<UhciEndpoint>,
        dir: Direction,
        setup: [u8; SETUP_PACKET_SIZE],
        buffer: DmaBuffer,
        size: usize,
        on_complete: CompletionCallback,
    ) -> Result<Box<UhciBatch>> {
        let base = TransferBatch::new(ep.base.props.target, dir, setup, buffer, size, on_complete);
        Ok(UhciBatch::new(ep.clone(), base))
    }

    fn batch_schedule(&self, mut batch: Box<UhciBatch>) -> Result<()> {
        if self.gone.load(Ordering::Acquire) {
            batch.base.fail(UsbError::Io);
            return Err(UsbError::Io);
        }

        if batch.base.target.address == self.rh.address() {
            self.rh.schedule(batch);
            return Ok(());
        }

        if let Err(err) = batch.prepare() {
            batch.base.fail(err);
            return Err(err);
        }

        let list = self.list_for(&batch.ep.base.props)?;
        list.add_batch(batch)
    }

    fn rh_address(&self) -> u8 {
        self.rh.address()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::testing::FakeSpace;
    use crate::usb::Target;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc as StdArc;

    pub(crate) fn make_endpoint(
        transfer_type: TransferType,
        dir: Direction,
        mps: u16,
    ) -> Arc<UhciEndpoint> {
        let ep = UhciEndpoint::new(EndpointProps::new(
            Target {
                address: 5,
                endpoint: 2,
            },
            dir,
            transfer_type,
            UsbSpeed::Full,
            mps,
        ));
        ep.base.set_online();
        ep
    }

    pub(crate) fn make_batch_with_callback(
        ep: Arc<UhciEndpoint>,
        size: usize,
        on_complete: CompletionCallback,
    ) -> Box<UhciBatch> {
        let buffer = DmaBuffer::alloc(size.max(1), 16).unwrap();
        let base = TransferBatch::new(
            ep.base.props.target,
            ep.base.props.direction,
            [0; SETUP_PACKET_SIZE],
            buffer,
            size,
            on_complete,
        );
        let mut batch = UhciBatch::new(ep, base);
        batch.prepare().unwrap();
        batch
    }

    pub(crate) fn make_batch_on(ep: Arc<UhciEndpoint>, size: usize) -> Box<UhciBatch> {
        make_batch_with_callback(ep, size, Box::new(|_| {}))
    }

    fn make_hc() -> (StdArc<FakeSpace>, Uhci) {
        let space = StdArc::new(FakeSpace::new(0x20));
        let hc = Uhci::new(space.clone(), 0, None).unwrap();
        (space, hc)
    }

    #[test]
    fn frame_list_points_at_interrupt_queue() {
        let (_space, hc) = make_hc();
        let expected = link::qh(hc.transfers_interrupt.head_phys());
        let frames = hc.frame_list.as_ptr() as *const u32;
        for i in [0usize, 1, 511, 1023] {
            assert_eq!(u32::from_le(unsafe { frames.add(i).read() }), expected);
        }
    }

    #[test]
    fn batches_complete_through_the_interrupt_path() {
        let (_space, hc) = make_hc();
        let ep = make_endpoint(TransferType::Bulk, Direction::In, 64);
        hc.endpoint_register(&ep).unwrap();

        let finished = StdArc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let buffer = DmaBuffer::alloc(64, 16).unwrap();
        let batch = hc
            .batch_create(
                &ep,
                Direction::In,
                [0; SETUP_PACKET_SIZE],
                buffer,
                64,
                Box::new(move |b| {
                    assert_eq!(b.error, Ok(()));
                    assert_eq!(b.transferred_size, 64);
                    counter.fetch_add(1, StdOrdering::SeqCst);
                }),
            )
            .unwrap();
        hc.batch_schedule(batch).unwrap();

        // Nothing happened yet: the TD is still active.
        hc.interrupt(sts::INTERRUPT as u32);
        assert_eq!(finished.load(StdOrdering::SeqCst), 0);

        // Retire the single TD as if the hardware had run it.
        ep.base.with_active(|b| {
            let batch = b.unwrap();
            let td = &batch.test_tds()[0];
            td.force_status(td.raw_status() & !hw::td_status::ACTIVE & !hw::td_status::ACTLEN_MASK | 63);
        });
        hc.interrupt(sts::INTERRUPT as u32);
        assert_eq!(finished.load(StdOrdering::SeqCst), 1);
        assert!(!ep.base.has_active());
    }

    #[test]
    fn root_hub_requests_are_routed_to_the_emulator() {
        let (_space, hc) = make_hc();
        let rh_addr = hc.rh_address();
        let ep = UhciEndpoint::new(EndpointProps::new(
            Target {
                address: rh_addr,
                endpoint: 0,
            },
            Direction::In,
            TransferType::Control,
            UsbSpeed::Full,
            64,
        ));
        ep.base.set_online();

        let finished = StdArc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        // GET_DESCRIPTOR(DEVICE): answered from the virtual hub.
        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let buffer = DmaBuffer::alloc(18, 16).unwrap();
        let batch = hc
            .batch_create(
                &ep,
                Direction::In,
                setup,
                buffer,
                18,
                Box::new(move |b| {
                    assert_eq!(b.error, Ok(()));
                    assert_eq!(b.transferred_size, 18);
                    let data = unsafe { b.buffer.as_slice() };
                    assert_eq!(data[4], 0x09);
                    counter.fetch_add(1, StdOrdering::SeqCst);
                }),
            )
            .unwrap();
        hc.batch_schedule(batch).unwrap();
        assert_eq!(finished.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn unregister_interrupts_inflight_batch() {
        let (_space, hc) = make_hc();
        let ep = make_endpoint(TransferType::Bulk, Direction::In, 64);
        hc.endpoint_register(&ep).unwrap();

        let finished = StdArc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let buffer = DmaBuffer::alloc(1024, 16).unwrap();
        let batch = hc
            .batch_create(
                &ep,
                Direction::In,
                [0; SETUP_PACKET_SIZE],
                buffer,
                1024,
                Box::new(move |b| {
                    assert_eq!(b.error, Err(UsbError::Interrupted));
                    assert_eq!(b.transferred_size, 0);
                    counter.fetch_add(1, StdOrdering::SeqCst);
                }),
            )
            .unwrap();
        hc.batch_schedule(batch).unwrap();

        hc.endpoint_unregister(&ep);
        assert_eq!(finished.load(StdOrdering::SeqCst), 1);
        assert!(hc.transfers_bulk_full.hw_chain().is_empty());
        // Scheduling on the offline endpoint now fails.
        let buffer = DmaBuffer::alloc(8, 16).unwrap();
        let batch = hc
            .batch_create(
                &ep,
                Direction::In,
                [0; SETUP_PACKET_SIZE],
                buffer,
                8,
                Box::new(|b| {
                    assert_eq!(b.error, Err(UsbError::Offline));
                }),
            )
            .unwrap();
        assert_eq!(hc.batch_schedule(batch), Err(UsbError::Offline));
    }
}
