//! EHCI (USB 2.0) host controller driver.
//!
//! EHCI splits its registers into a capability block and an operational
//! block `caplength` bytes further, runs control/bulk queue heads on a
//! circular async schedule and interrupt queue heads off a 1024-entry
//! periodic frame list. Removing a queue head requires the async-advance
//! doorbell handshake before its memory may be touched again.
//!
//! # References
//! - Enhanced Host Controller Interface Specification, revision 1.0

pub mod batch;
pub mod endpoint_list;
pub mod hw;
pub mod regs;
pub mod rh;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::batch::{CompletionCallback, TransferBatch};
use crate::bus::{AddressAllocator, HostController};
use crate::dma::DmaBuffer;
use crate::endpoint::{Endpoint, EndpointProps};
use crate::error::{Result, UsbError};
use crate::io::PciConfig;
use crate::time::{delay_us, Timeout};
use crate::usb::{Direction, TransferType, SETUP_PACKET_SIZE};

use batch::EhciBatch;
use endpoint_list::EndpointList;
use hw::{link, Qh};
use regs::{
    cmd, hccparams, intr, legacy, rd, rd16, rd32, rd8, set_bits, sts, wr, EhciCapRegs, EhciOpRegs,
};
use rh::EhciRh;

const USED_INTERRUPTS: u32 =
    intr::IRQ | intr::ERR_IRQ | intr::PORT_CHANGE | intr::ASYNC_ADVANCE | intr::HOST_ERROR;

const FRAME_LIST_COUNT: usize = 1024;

/// Per-endpoint EHCI state: the generic endpoint plus its queue head.
pub struct EhciEndpoint {
    pub base: Endpoint<EhciBatch>,
    dma: DmaBuffer,
}

impl EhciEndpoint {
    pub fn new(props: EndpointProps) -> Result<Arc<EhciEndpoint>> {
        let dma = DmaBuffer::alloc(core::mem::size_of::<Qh>(), 32)?;
        Ok(Arc::new(EhciEndpoint {
            base: Endpoint::new(props),
            dma,
        }))
    }

    pub fn qh(&self) -> &Qh {
        unsafe { &*(self.dma.as_ptr() as *const Qh) }
    }

    pub fn qh_phys(&self) -> u32 {
        self.dma.phys()
    }
}

pub struct Ehci {
    caps: *const EhciCapRegs,
    op: *const EhciOpRegs,
    periodic_list: DmaBuffer,
    /// CONTROL and BULK schedule ring.
    async_list: EndpointList,
    /// INTERRUPT schedule.
    int_list: EndpointList,
    /// Endpoints with a committed batch, scanned on completion/error
    /// interrupts.
    pending: Mutex<Vec<Arc<EhciEndpoint>>>,
    /// Async-advance acknowledgement from the interrupt path.
    doorbell: AtomicBool,
    rh: EhciRh,
    addresses: AddressAllocator,
}

unsafe impl Send for Ehci {}
unsafe impl Sync for Ehci {}

impl Ehci {
    /// Build the driver structures over the controller's MMIO range and
    /// take the hardware away from the BIOS. [`Ehci::start`] then resets
    /// and runs it.
    pub fn new(mmio_base: *mut u8, pci: Option<&dyn PciConfig>) -> Result<Ehci> {
        let caps = mmio_base as *const EhciCapRegs;
        let caplength = rd8(&unsafe { &*caps }.caplength) as usize;
        let op = unsafe { mmio_base.add(caplength) } as *const EhciOpRegs;

        log::info!(
            "EHCI: version {:x}, operational registers at +{:#x}",
            rd16(&unsafe { &*caps }.hciversion),
            caplength
        );

        if let Some(pci) = pci {
            let eecp =
                (rd32(&unsafe { &*caps }.hccparams) >> hccparams::EECP_SHIFT) & hccparams::EECP_MASK;
            disable_legacy(pci, eecp as u16);
        }

        let async_list = EndpointList::new("async")?;
        // The async schedule must be a ring: every horizontal pointer
        // valid, the head marked for reclamation.
        async_list.chain(&async_list);

        let int_list = EndpointList::new("int")?;

        let periodic_list = DmaBuffer::alloc(FRAME_LIST_COUNT * 4, 4096)?;
        let entry = link::qh(int_list.head_phys());
        let frames = periodic_list.as_mut_ptr() as *mut u32;
        for i in 0..FRAME_LIST_COUNT {
            unsafe { frames.add(i).write_volatile(entry.to_le()) };
        }

        let addresses = AddressAllocator::new();
        let rh = EhciRh::new(unsafe { &*caps }, op);
        rh.set_address(addresses.device_enumerate()?);

        Ok(Ehci {
            caps,
            op,
            periodic_list,
            async_list,
            int_list,
            pending: Mutex::new(Vec::new()),
            doorbell: AtomicBool::new(false),
            rh,
            addresses,
        })
    }

    fn op(&self) -> &EhciOpRegs {
        unsafe { &*self.op }
    }

    pub fn capabilities(&self) -> &EhciCapRegs {
        unsafe { &*self.caps }
    }

    pub fn roothub(&self) -> &EhciRh {
        &self.rh
    }

    pub fn addresses(&self) -> &AddressAllocator {
        &self.addresses
    }

    /// Hardware initialization sequence (EHCI spec 4.1).
    pub fn start(&self) {
        let op = self.op();

        // Resetting a running controller is undefined; halt it first.
        if rd(&op.usbsts) & sts::HC_HALTED == 0 {
            wr(&op.usbintr, 0);
            wr(&op.usbsts, sts::ALL_IRQS);
            wr(&op.usbcmd, 0);
            let timeout = Timeout::from_ms(100);
            while rd(&op.usbsts) & sts::HC_HALTED == 0 && !timeout.is_expired() {
                delay_us(1);
            }
            log::info!("EHCI: controller stopped");
        }

        set_bits(&op.usbcmd, cmd::HCRESET);
        let timeout = Timeout::from_ms(100);
        while rd(&op.usbcmd) & cmd::HCRESET != 0 {
            if timeout.is_expired() {
                log::warn!("EHCI: controller reset did not complete");
                break;
            }
            delay_us(1);
        }

        // 32-bit mode: all structures live in the low 4 GiB.
        wr(&op.ctrldssegment, 0);

        let periodic_phys = self.periodic_list.phys();
        debug_assert_eq!(periodic_phys & !regs::PERIODIC_LIST_BASE_MASK, 0);
        wr(&op.periodiclistbase, periodic_phys);
        set_bits(&op.usbcmd, cmd::PERIODIC_ENABLE);

        let async_phys = self.async_list.head_phys();
        debug_assert_eq!(async_phys & !regs::ASYNC_LIST_MASK, 0);
        wr(&op.asynclistaddr, async_phys);
        set_bits(&op.usbcmd, cmd::ASYNC_ENABLE);

        set_bits(&op.usbcmd, cmd::RUN);
        wr(&op.configflag, 1);

        // Clear stale status, then enable exactly the interrupts handled
        // by `interrupt`.
        wr(&op.usbsts, rd(&op.usbsts));
        wr(&op.usbintr, USED_INTERRUPTS);
        log::info!("EHCI: controller started");
    }

    fn list_for(&self, transfer_type: TransferType) -> Result<&EndpointList> {
        match transfer_type {
            TransferType::Control | TransferType::Bulk => Ok(&self.async_list),
            TransferType::Interrupt => Ok(&self.int_list),
            TransferType::Isochronous => Err(UsbError::NotSupported),
        }
    }

    /// Ring the async-advance doorbell and wait for the controller to
    /// acknowledge that it has dropped all cached queue-head pointers.
    ///
    /// The acknowledgement normally arrives through the interrupt path;
    /// the register poll covers embedders that run polled.
    fn wait_for_async_advance(&self) {
        let op = self.op();
        self.doorbell.store(false, Ordering::Release);
        set_bits(&op.usbcmd, cmd::ASYNC_DOORBELL);

        let timeout = Timeout::from_ms(100);
        loop {
            if self.doorbell.swap(false, Ordering::AcqRel) {
                break;
            }
            if rd(&op.usbsts) & sts::ASYNC_ADVANCE != 0 {
                wr(&op.usbsts, sts::ASYNC_ADVANCE);
                break;
            }
            if timeout.is_expired() {
                log::warn!("EHCI: async advance doorbell timed out");
                break;
            }
            core::hint::spin_loop();
        }
    }

    /// Completion/error interrupt: finish the done batches.
    fn scan_pending(&self) {
        let mut finished: Vec<Box<EhciBatch>> = Vec::new();
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
                batch.ep.qh().set_toggle(0);
            }
            batch.base.finish();
        }
    }
}

/// BIOS hand-off: walk to the Legacy Support capability in PCI config
/// space, flip the OS-owned semaphore and silence the SMI traps
/// (EHCI spec 5.1).
fn disable_legacy(pci: &dyn PciConfig, eecp: u16) {
    if eecp == 0 {
        return;
    }

    let legsup = match pci.read32(eecp + legacy::USBLEGSUP_OFFSET) {
        Ok(v) => v,
        Err(err) => {
            log::error!("EHCI: failed to read USBLEGSUP: {}", err);
            return;
        }
    };
    log::debug!("EHCI: USBLEGSUP {:#010x}", legsup);

    if pci.write8(eecp + legacy::OS_OWNED_BYTE, 1).is_err() {
        log::error!("EHCI: failed to request OS ownership");
        return;
    }

    // BIOS gets at most a millisecond to let go.
    let timeout = Timeout::from_ms(1);
    let mut owned = pci
        .read32(eecp + legacy::USBLEGSUP_OFFSET)
        .map(|v| v & legacy::USBLEGSUP_BIOS_OWNED != 0)
        .unwrap_or(false);
    while owned && !timeout.is_expired() {
        delay_us(10);
        owned = pci
            .read32(eecp + legacy::USBLEGSUP_OFFSET)
            .map(|v| v & legacy::USBLEGSUP_BIOS_OWNED != 0)
            .unwrap_or(false);
    }
    if owned {
        log::warn!("EHCI: BIOS refused to release the controller, forcing");
        let _ = pci.write32(eecp + legacy::USBLEGSUP_OFFSET, legacy::USBLEGSUP_OS_OWNED);
    }

    if legsup as u8 == legacy::CAP_ID_LEGSUP {
        // Zero the SMI enables; the top three bits are write-1-to-clear
        // status flags.
        if pci
            .write32(eecp + legacy::USBLEGCTLSTS_OFFSET, legacy::USBLEGCTLSTS_CLEAR)
            .is_err()
        {
            log::error!("EHCI: failed to clear USBLEGCTLSTS");
        }
    }
}

impl HostController for Ehci {
    type Endpoint = EhciEndpoint;
    type Batch = EhciBatch;

    fn used_interrupts(&self) -> u32 {
        USED_INTERRUPTS
    }

    fn status(&self) -> u32 {
        let op = self.op();
        let status = rd(&op.usbsts);
        wr(&op.usbsts, status);
        status
    }

    fn interrupt(&self, status: u32) {
        if status & sts::PORT_CHANGE != 0 {
            self.rh.interrupt();
        }

        if status & sts::ASYNC_ADVANCE != 0 {
            self.doorbell.store(true, Ordering::Release);
        }

        if status & (sts::IRQ | sts::ERR_IRQ) != 0 {
            self.scan_pending();
        }

        if status & sts::HOST_ERROR != 0 {
            // Not recoverable from here; the embedder decides whether to
            // tear the controller down.
            log::error!("EHCI: host system error");
        }
    }

    fn endpoint_create(&self, props: EndpointProps) -> Result<Arc<EhciEndpoint>> {
        self.list_for(props.transfer_type)?;
        EhciEndpoint::new(props)
    }

    fn endpoint_register(&self, ep: &Arc<EhciEndpoint>) -> Result<()> {
        ep.qh().init(Some(&ep.base.props));
        let list = self.list_for(ep.base.props.transfer_type)?;
        list.append_ep(ep);
        ep.base.set_online();
        Ok(())
    }

    /// Unlink the queue head and cancel its in-flight batch. The doorbell
    /// handshake is what makes reusing the queue head and TD memory safe:
    /// until the controller acknowledges the advance it may still hold
    /// cached pointers into them.
    fn endpoint_unregister(&self, ep: &Arc<EhciEndpoint>) {
        ep.base.set_offline();

        let timeout = Timeout::from_ms(10);
        while ep.base.has_active() && !timeout.is_expired() {
            core::hint::spin_loop();
        }

        if let Ok(list) = self.list_for(ep.base.props.transfer_type) {
            list.remove_ep(ep);
        }
        self.wait_for_async_advance();

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
        ep: &Arc<EhciEndpoint>,
        dir: Direction,
        setup: [u8; SETUP_PACKET_SIZE],
        buffer: DmaBuffer,
        size: usize,
        on_complete: CompletionCallback,
    ) -> Result<Box<EhciBatch>> {
        let base = TransferBatch::new(ep.base.props.target, dir, setup, buffer, size, on_complete);
        Ok(EhciBatch::new(ep.clone(), base))
    }

    fn batch_schedule(&self, mut batch: Box<EhciBatch>) -> Result<()> {
        if batch.base.target.address == self.rh.address() {
            return self.rh.schedule(batch);
        }

        if let Err(err) = batch.prepare() {
            batch.base.fail(err);
            return Err(err);
        }

        let ep = batch.ep.clone();
        let mut pending = self.pending.lock();
        if let Err((err, mut batch)) = ep.base.activate(batch) {
            drop(pending);
            batch.base.fail(err);
            return Err(err);
        }
        ep.base
            .with_active(|b| b.expect("batch just activated").commit());
        pending.push(ep.clone());
        Ok(())
    }

    fn rh_address(&self) -> u8 {
        self.rh.address()
    }
}
