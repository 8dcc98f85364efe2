//! UHCI root hub.
//!
//! UHCI has two root ports and no port-change interrupt, so the emulated
//! hub answers its status-change pipe by polling the port registers at the
//! pipe's polling interval instead of parking the batch.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, UsbError};
use crate::hub::{characteristics, feature, HubDescriptor, HubOps, PortStatus, VirtHub};
use crate::time::{delay_ms, delay_us, Timeout};
use crate::usb::{SetupPacket, UsbSpeed};

use super::batch::UhciBatch;
use super::regs::{portsc, UhciRegs, PORT_COUNT};

/// Poll cadence of the status-change pipe, matching its bInterval.
const STATUS_CHANGE_POLL_MS: u64 = 255;

pub struct UhciRh {
    regs: UhciRegs,
    hub: VirtHub,
    reset_changed: [AtomicBool; PORT_COUNT],
    resume_changed: [AtomicBool; PORT_COUNT],
}

impl UhciRh {
    pub fn new(regs: UhciRegs) -> UhciRh {
        UhciRh {
            regs,
            hub: VirtHub::new(UsbSpeed::Full),
            reset_changed: [AtomicBool::new(false), AtomicBool::new(false)],
            resume_changed: [AtomicBool::new(false), AtomicBool::new(false)],
        }
    }

    pub fn address(&self) -> u8 {
        self.hub.address()
    }

    pub fn set_address(&self, address: u8) {
        self.hub.set_address(address);
    }

    /// Execute a batch against the emulated hub. Control requests finish
    /// immediately; the status-change pipe polls until a change appears.
    pub fn schedule(&self, mut batch: Box<UhciBatch>) {
        let size = batch.base.size;
        let data = unsafe { &mut batch.base.buffer.as_mut_slice()[..size] };

        let result = match batch.base.target.endpoint {
            0 => {
                let setup = SetupPacket::from_bytes(&batch.base.setup);
                self.hub.control_request(self, &setup, data)
            }
            _ => loop {
                match self.hub.status_change_request(self, data) {
                    Err(UsbError::Again) => delay_ms(STATUS_CHANGE_POLL_MS),
                    other => break other,
                }
            },
        };

        match result {
            Ok(transferred) => {
                batch.base.transferred_size = transferred;
                batch.base.error = Ok(());
                batch.base.finish();
            }
            Err(err) => batch.base.fail(err),
        }
    }

    /// Reset-and-enable pulse on one port.
    ///
    /// The driver owns the reset bit on UHCI: drive it for 50 ms, drop it,
    /// then enable the port. Some parts raise a spurious connect change
    /// after reset, so the change bits are cleared along with the enable
    /// write.
    fn port_reset_enable(&self, port: usize) {
        let status = self.regs.read_port(port) & !portsc::WC_BITS;
        self.regs.write_port(port, status | portsc::IN_RESET);
        delay_ms(50);
        let status = self.regs.read_port(port) & !portsc::WC_BITS;
        self.regs.write_port(port, status & !portsc::IN_RESET);

        let timeout = Timeout::from_ms(10);
        while self.regs.read_port(port) & portsc::IN_RESET != 0 && !timeout.is_expired() {
            core::hint::spin_loop();
        }
        delay_us(10);

        let status = self.regs.read_port(port) & !portsc::WC_BITS;
        self.regs
            .write_port(port, status | portsc::ENABLED | portsc::CONNECTED_CHANGED);
        self.reset_changed[port].store(true, Ordering::Release);
        log::debug!("UHCI rh: port {} reset complete", port);
    }

    /// Host-driven resume: drive the resume bit for 20 ms, then release
    /// the port from suspend.
    fn port_resume(&self, port: usize) {
        let status = self.regs.read_port(port) & !portsc::WC_BITS;
        if status & portsc::SUSPEND == 0 {
            return;
        }
        self.regs.write_port(port, status | portsc::RESUME);
        delay_ms(20);
        let status = self.regs.read_port(port) & !portsc::WC_BITS;
        self.regs
            .write_port(port, status & !(portsc::RESUME | portsc::SUSPEND));
        self.resume_changed[port].store(true, Ordering::Release);
    }
}

impl HubOps for UhciRh {
    fn port_count(&self) -> usize {
        PORT_COUNT
    }

    fn hub_descriptor(&self) -> HubDescriptor {
        HubDescriptor {
            port_count: PORT_COUNT as u8,
            characteristics: characteristics::POWER_NONE | characteristics::OC_NONE,
            power_good_time: 50,
            max_current: 0,
        }
    }

    fn hub_status(&self) -> u32 {
        // No local power source, no global over-current reporting.
        0
    }

    fn port_status(&self, port: usize) -> PortStatus {
        let reg = self.regs.read_port(port);
        let mut status = PortStatus::empty();

        let pairs = [
            (portsc::CONNECTED, PortStatus::CONNECTION),
            (portsc::ENABLED, PortStatus::ENABLE),
            (portsc::SUSPEND, PortStatus::SUSPEND),
            (portsc::IN_RESET, PortStatus::RESET),
            (portsc::LOW_SPEED, PortStatus::LOW_SPEED),
            (portsc::CONNECTED_CHANGED, PortStatus::C_CONNECTION),
            (portsc::ENABLED_CHANGED, PortStatus::C_ENABLE),
        ];
        for (bit, flag) in pairs {
            if reg & bit != 0 {
                status |= flag;
            }
        }
        // Ports are always powered, there is no switching.
        status |= PortStatus::POWER;
        if self.reset_changed[port].load(Ordering::Acquire) {
            status |= PortStatus::C_RESET;
        }
        if self.resume_changed[port].load(Ordering::Acquire) {
            status |= PortStatus::C_SUSPEND;
        }
        status
    }

    fn clear_hub_feature(&self, feature_: u16) -> Result<()> {
        match feature_ {
            feature::C_HUB_OVER_CURRENT => Ok(()),
            _ => Err(UsbError::Stall),
        }
    }

    fn clear_port_feature(&self, port: usize, feature_: u16) -> Result<()> {
        let status = self.regs.read_port(port) & !portsc::WC_BITS;
        match feature_ {
            feature::PORT_ENABLE => {
                self.regs.write_port(port, status & !portsc::ENABLED);
                Ok(())
            }
            feature::PORT_SUSPEND => {
                self.port_resume(port);
                Ok(())
            }
            feature::PORT_POWER => Ok(()),
            feature::C_PORT_CONNECTION => {
                self.regs
                    .write_port(port, status | portsc::CONNECTED_CHANGED);
                Ok(())
            }
            feature::C_PORT_ENABLE => {
                self.regs.write_port(port, status | portsc::ENABLED_CHANGED);
                Ok(())
            }
            feature::C_PORT_RESET => {
                self.reset_changed[port].store(false, Ordering::Release);
                Ok(())
            }
            feature::C_PORT_SUSPEND => {
                self.resume_changed[port].store(false, Ordering::Release);
                Ok(())
            }
            _ => Err(UsbError::Stall),
        }
    }

    fn set_port_feature(&self, port: usize, feature_: u16) -> Result<()> {
        let status = self.regs.read_port(port) & !portsc::WC_BITS;
        match feature_ {
            feature::PORT_RESET => {
                self.port_reset_enable(port);
                Ok(())
            }
            feature::PORT_ENABLE => {
                self.regs.write_port(port, status | portsc::ENABLED);
                Ok(())
            }
            feature::PORT_SUSPEND => {
                self.regs.write_port(port, status | portsc::SUSPEND);
                Ok(())
            }
            feature::PORT_POWER => Ok(()),
            _ => Err(UsbError::Stall),
        }
    }

    fn status_change(&self) -> u16 {
        let mut mask = 0u16;
        for port in 0..PORT_COUNT {
            let reg = self.regs.read_port(port);
            if reg & portsc::WC_BITS != 0
                || self.reset_changed[port].load(Ordering::Acquire)
                || self.resume_changed[port].load(Ordering::Acquire)
            {
                mask |= 1 << (port + 1);
            }
        }
        mask
    }
}
