//! OHCI root hub.
//!
//! OHCI designed its root-hub registers after the hub class: the port
//! status words translate almost bit for bit and the hardware latches the
//! change bits itself, so no software latches are needed. Status-change
//! batches park on the hub until the next root-hub status change
//! interrupt.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{Result, UsbError};
use crate::hub::{characteristics, feature, HubDescriptor, HubOps, PortStatus, VirtHub};
use crate::usb::{SetupPacket, UsbSpeed};

use super::batch::OhciBatch;
use super::regs::{rd, rh_desc_a, rh_desc_b, rh_port_status as rhps, rh_status, wr, OhciRegs};
use super::OhciEndpoint;

pub struct OhciRh {
    regs: *const OhciRegs,
    hub: VirtHub,
    port_count: usize,
    /// The parked status-change endpoint; at most one batch waits here.
    status_change_ep: Mutex<Option<Arc<OhciEndpoint>>>,
}

unsafe impl Send for OhciRh {}
unsafe impl Sync for OhciRh {}

impl OhciRh {
    pub fn new(regs: *const OhciRegs) -> OhciRh {
        let port_count =
            (rd(&unsafe { &*regs }.rh_desc_a) & rh_desc_a::NDP_MASK) as usize;
        log::info!("OHCI rh: {} ports", port_count);
        OhciRh {
            regs,
            hub: VirtHub::new(UsbSpeed::Full),
            port_count: port_count.min(crate::hub::MAX_PORTS),
            status_change_ep: Mutex::new(None),
        }
    }

    fn regs(&self) -> &OhciRegs {
        unsafe { &*self.regs }
    }

    pub fn address(&self) -> u8 {
        self.hub.address()
    }

    pub fn set_address(&self, address: u8) {
        self.hub.set_address(address);
    }

    /// Select per-port power switching and per-port over-current
    /// reporting in the root hub descriptor registers.
    pub fn init_power_switching(&self) {
        let regs = self.regs();
        let mut desc_a = rd(&regs.rh_desc_a);
        desc_a &= !(rh_desc_a::NPS | rh_desc_a::NOCP);
        desc_a |= rh_desc_a::PSM | rh_desc_a::OCPM;
        wr(&regs.rh_desc_a, desc_a);

        // Give every port its own power-control bit.
        let mut desc_b = rd(&regs.rh_desc_b);
        desc_b |= ((1u32 << self.port_count) - 1) << rh_desc_b::PPCM_SHIFT;
        wr(&regs.rh_desc_b, desc_b);
    }

    /// Execute a batch against the emulated hub. A quiet status-change
    /// pipe parks the batch for [`OhciRh::interrupt`] to finish.
    pub fn schedule(&self, mut batch: Box<OhciBatch>) -> Result<()> {
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

    /// Root-hub status change interrupt: complete the parked batch from
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
}

impl HubOps for OhciRh {
    fn port_count(&self) -> usize {
        self.port_count
    }

    fn hub_descriptor(&self) -> HubDescriptor {
        let desc_a = rd(&self.regs().rh_desc_a);

        let mut chars = if desc_a & rh_desc_a::NPS != 0 {
            characteristics::POWER_NONE
        } else if desc_a & rh_desc_a::PSM != 0 {
            characteristics::POWER_PER_PORT
        } else {
            characteristics::POWER_GANGED
        };
        if desc_a & rh_desc_a::DT != 0 {
            chars |= characteristics::COMPOUND_DEVICE;
        }
        chars |= if desc_a & rh_desc_a::NOCP != 0 {
            characteristics::OC_NONE
        } else if desc_a & rh_desc_a::OCPM != 0 {
            characteristics::OC_PER_PORT
        } else {
            characteristics::OC_GLOBAL
        };

        HubDescriptor {
            port_count: self.port_count as u8,
            characteristics: chars,
            power_good_time: (desc_a >> rh_desc_a::POTPGT_SHIFT) as u8,
            max_current: 0,
        }
    }

    fn hub_status(&self) -> u32 {
        // Over-current indicator and its change bit line up with the hub
        // status word already.
        rd(&self.regs().rh_status) & (rh_status::OCI | rh_status::CCIC)
    }

    fn port_status(&self, port: usize) -> PortStatus {
        let reg = rd(&self.regs().rh_port_status[port]);
        // The register was modeled on the wPortStatus/wPortChange pair;
        // masking off the command view is all the translation needed.
        PortStatus::from_bits_truncate(reg & (rhps::STATUS_MASK | rhps::CHANGE_MASK))
    }

    fn clear_hub_feature(&self, feature_: u16) -> Result<()> {
        match feature_ {
            feature::C_HUB_OVER_CURRENT => {
                wr(&self.regs().rh_status, rh_status::CCIC);
                Ok(())
            }
            _ => Err(UsbError::Stall),
        }
    }

    fn clear_port_feature(&self, port: usize, feature_: u16) -> Result<()> {
        let regs = self.regs();
        let port_reg = &regs.rh_port_status[port];
        match feature_ {
            feature::PORT_ENABLE => {
                wr(port_reg, rhps::CCS);
                Ok(())
            }
            feature::PORT_SUSPEND => {
                wr(port_reg, rhps::POCI);
                Ok(())
            }
            feature::PORT_POWER => {
                let desc_a = rd(&regs.rh_desc_a);
                if desc_a & rh_desc_a::NPS != 0 {
                    return Err(UsbError::Stall);
                }
                if desc_a & rh_desc_a::PSM == 0 {
                    wr(&regs.rh_status, rh_status::LPS);
                } else {
                    wr(port_reg, rhps::LSDA);
                }
                Ok(())
            }
            feature::C_PORT_CONNECTION
            | feature::C_PORT_ENABLE
            | feature::C_PORT_SUSPEND
            | feature::C_PORT_OVER_CURRENT
            | feature::C_PORT_RESET => {
                // Change bit positions equal the feature selectors.
                wr(port_reg, 1 << feature_);
                Ok(())
            }
            _ => Err(UsbError::Stall),
        }
    }

    fn set_port_feature(&self, port: usize, feature_: u16) -> Result<()> {
        let regs = self.regs();
        let port_reg = &regs.rh_port_status[port];
        match feature_ {
            feature::PORT_ENABLE => {
                wr(port_reg, rhps::PES);
                Ok(())
            }
            feature::PORT_SUSPEND => {
                wr(port_reg, rhps::PSS);
                Ok(())
            }
            // The controller runs the timed reset itself and latches the
            // reset-change bit when the pulse completes.
            feature::PORT_RESET => {
                wr(port_reg, rhps::PRS);
                Ok(())
            }
            feature::PORT_POWER => {
                let desc_a = rd(&regs.rh_desc_a);
                if desc_a & rh_desc_a::NPS != 0 {
                    return Ok(());
                }
                if desc_a & rh_desc_a::PSM == 0 {
                    wr(&regs.rh_status, rh_status::LPSC);
                } else {
                    wr(port_reg, rhps::PPS);
                }
                Ok(())
            }
            _ => Err(UsbError::Stall),
        }
    }

    fn status_change(&self) -> u16 {
        let regs = self.regs();
        let mut mask = 0u16;
        if rd(&regs.rh_status) & rh_status::CCIC != 0 {
            mask |= 1;
        }
        for port in 0..self.port_count {
            if rd(&regs.rh_port_status[port]) & rhps::CHANGE_MASK != 0 {
                mask |= 1 << (port + 1);
            }
        }
        mask
    }
}
