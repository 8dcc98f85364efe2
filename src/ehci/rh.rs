//! EHCI root hub.
//!
//! High-speed-only ports with companion hand-off: devices that do not
//! enumerate at high speed are released to the companion UHCI/OHCI
//! controller through the port-owner bit. Reset and resume changes are
//! latched in software because the hardware forgets them with the pulse.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::error::{Result, UsbError};
use crate::hub::{characteristics, feature, HubDescriptor, HubOps, PortStatus, VirtHub, MAX_PORTS};
use crate::time::{delay_ms, Timeout};
use crate::usb::{SetupPacket, UsbSpeed};

use super::batch::EhciBatch;
use super::regs::{hcsparams, portsc, rd, wr, EhciCapRegs, EhciOpRegs};
use super::EhciEndpoint;

pub struct EhciRh {
    op: *const EhciOpRegs,
    hub: VirtHub,
    port_count: usize,
    /// Per-port power switching present (HCSPARAMS.PPC).
    power_switched: bool,
    /// Port indicator LEDs present.
    indicators: bool,
    reset_changed: [AtomicBool; MAX_PORTS],
    resume_changed: [AtomicBool; MAX_PORTS],
    /// The parked status-change endpoint; at most one batch waits here.
    status_change_ep: Mutex<Option<Arc<EhciEndpoint>>>,
}

unsafe impl Send for EhciRh {}
unsafe impl Sync for EhciRh {}

impl EhciRh {
    pub fn new(caps: &EhciCapRegs, op: *const EhciOpRegs) -> EhciRh {
        let params = super::regs::rd32(&caps.hcsparams);
        let port_count = (params & hcsparams::N_PORTS_MASK) as usize;
        let power_switched = params & hcsparams::PPC != 0;
        log::info!(
            "EHCI rh: {} ports, {}",
            port_count,
            if power_switched {
                "per-port power switching"
            } else {
                "no power switching"
            }
        );

        EhciRh {
            op,
            hub: VirtHub::new(UsbSpeed::High),
            port_count: port_count.min(MAX_PORTS),
            power_switched,
            indicators: params & hcsparams::INDICATORS != 0,
            reset_changed: [const { AtomicBool::new(false) }; MAX_PORTS],
            resume_changed: [const { AtomicBool::new(false) }; MAX_PORTS],
            status_change_ep: Mutex::new(None),
        }
    }

    fn op(&self) -> &EhciOpRegs {
        unsafe { &*self.op }
    }

    pub fn address(&self) -> u8 {
        self.hub.address()
    }

    pub fn set_address(&self, address: u8) {
        self.hub.set_address(address);
    }

    fn read_port(&self, port: usize) -> u32 {
        rd(&self.op().portsc[port])
    }

    /// Read-modify-write that cannot eat a pending change bit.
    fn update_port(&self, port: usize, f: impl FnOnce(u32) -> u32) {
        let value = self.read_port(port) & !portsc::WC_MASK;
        wr(&self.op().portsc[port], f(value));
    }

    /// Execute a batch against the emulated hub. A quiet status-change
    /// pipe parks the batch for the next port-change interrupt.
    pub fn schedule(&self, mut batch: Box<EhciBatch>) -> Result<()> {
        let size = batch.base.size;
        let data = unsafe { &mut batch.base.buffer.as_mut_slice()[..size] };

        let result = match batch.base.target.endpoint {
            0 => {
                let setup = SetupPacket::from_bytes(&batch.base.setup);
                self.hub.control_request(self, &setup, data)
            }
            _ => self.hub.status_change_request(self, data),
        };

        match result {
            Err(UsbError::Again) => {
                let ep = batch.ep.clone();
                let mut parked = self.status_change_ep.lock();
                if let Err((err, mut batch)) = ep.base.activate(batch) {
                    drop(parked);
                    batch.base.fail(err);
                    return Err(err);
                }
                debug_assert!(parked.is_none());
                *parked = Some(ep);
            }
            Ok(transferred) => {
                batch.base.transferred_size = transferred;
                batch.base.finish();
            }
            Err(err) => batch.base.fail(err),
        }
        Ok(())
    }

    /// Port-change interrupt: answer the parked status-change batch from
    /// the current port state.
    pub fn interrupt(&self) {
        let Some(ep) = self.status_change_ep.lock().take() else {
            return;
        };
        let Some(mut batch) = ep.base.deactivate() else {
            return;
        };

        let size = batch.base.size;
        let data = unsafe { &mut batch.base.buffer.as_mut_slice()[..size] };
        match self.hub.status_change_request(self, data) {
            Ok(transferred) => {
                batch.base.transferred_size = transferred;
                batch.base.finish();
            }
            Err(err) => batch.base.fail(err),
        }
    }

    /// Drive the 50 ms reset pulse and check the outcome.
    ///
    /// A port that is not enabled when the reset ends holds a full-speed
    /// device; ownership goes to the companion controller and the change
    /// is still reported so the hub driver re-reads the port.
    fn port_reset(&self, port: usize) {
        self.update_port(port, |v| (v & !portsc::ENABLED) | portsc::RESET);
        delay_ms(50);
        self.update_port(port, |v| v & !portsc::RESET);

        let timeout = Timeout::from_ms(10);
        while self.read_port(port) & portsc::RESET != 0 && !timeout.is_expired() {
            core::hint::spin_loop();
        }

        if self.read_port(port) & portsc::ENABLED == 0 {
            log::info!(
                "EHCI rh: port {} not enabled after reset, releasing to companion",
                port
            );
            self.update_port(port, |v| v | portsc::PORT_OWNER);
        }
        self.reset_changed[port].store(true, Ordering::Release);
        self.interrupt();
    }

    /// Host-driven resume: 20 ms of resume signalling, then the port
    /// returns to running.
    fn port_resume(&self, port: usize) {
        if self.read_port(port) & portsc::SUSPEND == 0 {
            return;
        }
        self.update_port(port, |v| v | portsc::RESUME);
        delay_ms(20);
        self.update_port(port, |v| v & !portsc::RESUME);
        self.resume_changed[port].store(true, Ordering::Release);
        self.interrupt();
    }
}

impl HubOps for EhciRh {
    fn port_count(&self) -> usize {
        self.port_count
    }

    fn hub_descriptor(&self) -> HubDescriptor {
        let mut chars = characteristics::TT_THINK_TIME_32;
        chars |= if self.power_switched {
            characteristics::POWER_PER_PORT | characteristics::OC_PER_PORT
        } else {
            characteristics::POWER_NONE | characteristics::OC_NONE
        };
        if self.indicators {
            chars |= characteristics::PORT_INDICATORS;
        }
        HubDescriptor {
            port_count: self.port_count as u8,
            characteristics: chars,
            power_good_time: 50,
            max_current: 0,
        }
    }

    fn hub_status(&self) -> u32 {
        // EHCI root hubs report neither global over-current nor local
        // power loss.
        0
    }

    fn port_status(&self, port: usize) -> PortStatus {
        let reg = self.read_port(port);
        let mut status = PortStatus::empty();

        let pairs = [
            (portsc::CONNECT, PortStatus::CONNECTION),
            (portsc::ENABLED, PortStatus::ENABLE),
            (portsc::SUSPEND, PortStatus::SUSPEND),
            (portsc::OC_ACTIVE, PortStatus::OVER_CURRENT),
            (portsc::RESET, PortStatus::RESET),
            (portsc::PORT_POWER, PortStatus::POWER),
            (portsc::CONNECT_CHANGE, PortStatus::C_CONNECTION),
            (portsc::ENABLE_CHANGE, PortStatus::C_ENABLE),
            (portsc::OC_CHANGE, PortStatus::C_OVER_CURRENT),
        ];
        for (bit, flag) in pairs {
            if reg & bit != 0 {
                status |= flag;
            }
        }

        // A K-state line means a low-speed device awaiting hand-off;
        // everything this controller runs is high speed unless a
        // companion owns the port.
        if reg & portsc::LINE_STATUS_MASK == portsc::LINE_STATUS_K {
            status |= PortStatus::LOW_SPEED;
        } else if reg & portsc::PORT_OWNER == 0 {
            status |= PortStatus::HIGH_SPEED;
        }
        if reg & portsc::TEST_MASK != 0 {
            status |= PortStatus::TEST;
        }
        if reg & portsc::INDICATOR_MASK != 0 {
            status |= PortStatus::INDICATOR;
        }
        if self.resume_changed[port].load(Ordering::Acquire) {
            status |= PortStatus::C_SUSPEND;
        }
        if self.reset_changed[port].load(Ordering::Acquire) {
            status |= PortStatus::C_RESET;
        }
        status
    }

    fn clear_hub_feature(&self, _feature: u16) -> Result<()> {
        // No local power, no global over-current: nothing is clearable.
        Err(UsbError::Stall)
    }

    fn clear_port_feature(&self, port: usize, feature_: u16) -> Result<()> {
        match feature_ {
            feature::PORT_POWER => {
                self.update_port(port, |v| v & !portsc::PORT_POWER);
                Ok(())
            }
            feature::PORT_ENABLE => {
                self.update_port(port, |v| v & !portsc::ENABLED);
                Ok(())
            }
            feature::PORT_SUSPEND => {
                self.port_resume(port);
                Ok(())
            }
            feature::C_PORT_CONNECTION => {
                self.update_port(port, |v| v | portsc::CONNECT_CHANGE);
                Ok(())
            }
            feature::C_PORT_ENABLE => {
                self.update_port(port, |v| v | portsc::CONNECT_CHANGE);
                Ok(())
            }
            feature::C_PORT_OVER_CURRENT => {
                self.update_port(port, |v| v | portsc::OC_CHANGE);
                Ok(())
            }
            feature::C_PORT_SUSPEND => {
                self.resume_changed[port].store(false, Ordering::Release);
                Ok(())
            }
            feature::C_PORT_RESET => {
                self.reset_changed[port].store(false, Ordering::Release);
                Ok(())
            }
            _ => Err(UsbError::Stall),
        }
    }

    fn set_port_feature(&self, port: usize, feature_: u16) -> Result<()> {
        match feature_ {
            feature::PORT_ENABLE => {
                self.update_port(port, |v| v | portsc::ENABLED);
                Ok(())
            }
            feature::PORT_SUSPEND => {
                self.update_port(port, |v| v | portsc::SUSPEND);
                Ok(())
            }
            feature::PORT_RESET => {
                self.port_reset(port);
                Ok(())
            }
            feature::PORT_POWER => {
                self.update_port(port, |v| v | portsc::PORT_POWER);
                Ok(())
            }
            _ => Err(UsbError::Stall),
        }
    }

    fn status_change(&self) -> u16 {
        let mut mask = 0u16;
        for port in 0..self.port_count {
            let reg = self.read_port(port);
            let changed = reg & portsc::WC_MASK != 0
                || self.reset_changed[port].load(Ordering::Acquire)
                || self.resume_changed[port].load(Ordering::Acquire);
            if !changed {
                continue;
            }
            // A fresh low-speed connect goes straight to the companion
            // controller and is never reported upward.
            if reg & portsc::CONNECT_CHANGE != 0
                && reg & portsc::LINE_STATUS_MASK == portsc::LINE_STATUS_K
            {
                self.update_port(port, |v| v | portsc::PORT_OWNER);
                continue;
            }
            mask |= 1 << (port + 1);
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::leak_op_regs;
    use super::*;
    use tock_registers::registers::ReadOnly;

    fn make_caps(hcs: u32) -> &'static EhciCapRegs {
        let caps = Box::leak(Box::new(unsafe { core::mem::zeroed::<EhciCapRegs>() }));
        let hcs_reg = &caps.hcsparams as *const ReadOnly<u32> as *mut u32;
        unsafe { hcs_reg.write_volatile(hcs.to_le()) };
        caps
    }

    fn make_rh(hcs: u32) -> (&'static EhciOpRegs, EhciRh) {
        let op = leak_op_regs();
        let caps = make_caps(hcs);
        (op, EhciRh::new(caps, op))
    }

    #[test]
    fn port_status_reports_high_speed_unless_owned() {
        let (op, rh) = make_rh(2 | hcsparams::PPC);
        wr(&op.portsc[0], portsc::CONNECT | portsc::ENABLED | portsc::PORT_POWER);
        let status = rh.port_status(0);
        assert!(status.contains(PortStatus::CONNECTION));
        assert!(status.contains(PortStatus::HIGH_SPEED));
        assert!(!status.contains(PortStatus::LOW_SPEED));

        wr(&op.portsc[0], portsc::CONNECT | portsc::PORT_OWNER);
        assert!(!rh.port_status(0).contains(PortStatus::HIGH_SPEED));

        wr(&op.portsc[0], portsc::CONNECT | portsc::LINE_STATUS_K);
        assert!(rh.port_status(0).contains(PortStatus::LOW_SPEED));
    }

    #[test]
    fn successful_reset_latches_change_and_keeps_ownership() {
        let (op, rh) = make_rh(2 | hcsparams::PPC);
        // Enabled bit high after the pulse: a high-speed device.
        wr(&op.portsc[0], portsc::CONNECT | portsc::ENABLED | portsc::PORT_POWER);
        rh.set_port_feature(0, feature::PORT_RESET).unwrap();

        let reg = rd(&op.portsc[0]);
        assert_eq!(reg & portsc::RESET, 0);
        assert_eq!(reg & portsc::PORT_OWNER, 0);
        assert!(rh.port_status(0).contains(PortStatus::C_RESET));
        assert_eq!(rh.status_change(), 0b10);
    }

    #[test]
    fn failed_reset_hands_port_to_companion() {
        let (op, rh) = make_rh(2 | hcsparams::PPC);
        // Port stays disabled: full-speed device.
        wr(&op.portsc[1], portsc::CONNECT | portsc::PORT_POWER);
        rh.set_port_feature(1, feature::PORT_RESET).unwrap();
        assert_ne!(rd(&op.portsc[1]) & portsc::PORT_OWNER, 0);
        // The reset change is still latched for the hub driver.
        assert!(rh.port_status(1).contains(PortStatus::C_RESET));
    }

    #[test]
    fn low_speed_connect_is_silently_released() {
        let (op, rh) = make_rh(2 | hcsparams::PPC);
        wr(
            &op.portsc[0],
            portsc::CONNECT | portsc::CONNECT_CHANGE | portsc::LINE_STATUS_K,
        );
        // Change is swallowed and the companion owns the port now.
        assert_eq!(rh.status_change(), 0);
        assert_ne!(rd(&op.portsc[0]) & portsc::PORT_OWNER, 0);
    }

    #[test]
    fn clear_port_enable_change_keeps_original_behavior() {
        let (op, rh) = make_rh(1 | hcsparams::PPC);
        rh.clear_port_feature(0, feature::C_PORT_ENABLE).unwrap();
        // The write goes to the connect-change bit.
        assert_ne!(rd(&op.portsc[0]) & portsc::CONNECT_CHANGE, 0);
        assert_eq!(rd(&op.portsc[0]) & portsc::ENABLE_CHANGE, 0);
    }

    #[test]
    fn descriptor_reflects_power_switching() {
        let (_op, rh) = make_rh(4 | hcsparams::PPC | hcsparams::INDICATORS);
        let desc = rh.hub_descriptor();
        assert_eq!(desc.port_count, 4);
        assert_ne!(desc.characteristics & characteristics::POWER_PER_PORT, 0);
        assert_ne!(desc.characteristics & characteristics::PORT_INDICATORS, 0);

        let (_op, rh) = make_rh(4);
        let desc = rh.hub_descriptor();
        assert_ne!(desc.characteristics & characteristics::POWER_NONE, 0);
    }

    #[test]
    fn suspend_resume_cycle_latches_change() {
        let (op, rh) = make_rh(1 | hcsparams::PPC);
        wr(&op.portsc[0], portsc::CONNECT | portsc::ENABLED | portsc::SUSPEND);
        rh.clear_port_feature(0, feature::PORT_SUSPEND).unwrap();
        assert_eq!(rd(&op.portsc[0]) & portsc::RESUME, 0);
        assert!(rh.port_status(0).contains(PortStatus::C_SUSPEND));
        rh.clear_port_feature(0, feature::C_PORT_SUSPEND).unwrap();
        assert!(!rh.port_status(0).contains(PortStatus::C_SUSPEND));
    }
}
