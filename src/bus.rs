//! The outward bus contract.
//!
//! The enumeration layer above drives a controller exclusively through
//! [`HostController`]; the shared [`AddressAllocator`] backs the
//! device-enumerate/device-gone operations all three personalities delegate
//! to.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::Mutex;

use crate::batch::CompletionCallback;
use crate::dma::DmaBuffer;
use crate::endpoint::EndpointProps;
use crate::error::{Result, UsbError};
use crate::usb::{Direction, SETUP_PACKET_SIZE};

/// Address of an unconfigured device.
pub const DEFAULT_ADDRESS: u8 = 0;

/// Operations a host controller exposes to the bus layer.
///
/// The associated types are the personality's endpoint and batch wrappers;
/// the bus layer treats them as opaque handles.
pub trait HostController {
    type Endpoint;
    type Batch;

    /// Interrupt-status bits the controller wants delivered. The embedder
    /// arms its interrupt ack path (mask, write-1-to-clear, accept) with
    /// exactly these.
    fn used_interrupts(&self) -> u32;

    /// Fetch pending interrupt status from the hardware and acknowledge it.
    fn status(&self) -> u32;

    /// Handle one hardware interrupt whose latched-and-cleared status bits
    /// are `status`.
    fn interrupt(&self, status: u32);

    fn endpoint_create(&self, props: EndpointProps) -> Result<Arc<Self::Endpoint>>;

    /// Link the endpoint into the matching schedule list and put it online.
    fn endpoint_register(&self, ep: &Arc<Self::Endpoint>) -> Result<()>;

    /// Take the endpoint offline, cancel any in-flight batch and unlink its
    /// queue head, observing the personality's quiescence protocol before
    /// the DMA backing may be reused.
    fn endpoint_unregister(&self, ep: &Arc<Self::Endpoint>);

    fn batch_create(
        &self,
        ep: &Arc<Self::Endpoint>,
        dir: Direction,
        setup: [u8; SETUP_PACKET_SIZE],
        buffer: DmaBuffer,
        size: usize,
        on_complete: CompletionCallback,
    ) -> Result<Box<Self::Batch>>;

    /// Hand the batch to the hardware (or to the root-hub emulator when the
    /// target address is the emulated hub's).
    fn batch_schedule(&self, batch: Box<Self::Batch>) -> Result<()>;

    /// Address the emulated root hub answers on.
    fn rh_address(&self) -> u8;
}

/// USB 2.0 bus address bookkeeping, shared by all personalities.
///
/// 128 addresses, address 0 reserved for unconfigured devices.
pub struct AddressAllocator {
    used: Mutex<u128>,
}

impl AddressAllocator {
    pub const fn new() -> AddressAllocator {
        // Address 0 is permanently taken.
        AddressAllocator {
            used: Mutex::new(1),
        }
    }

    /// Assign the lowest free address to a newly enumerated device.
    pub fn device_enumerate(&self) -> Result<u8> {
        let mut used = self.used.lock();
        for addr in 1u8..128 {
            let bit = 1u128 << addr;
            if *used & bit == 0 {
                *used |= bit;
                return Ok(addr);
            }
        }
        Err(UsbError::Busy)
    }

    /// Release the address of a detached device.
    pub fn device_gone(&self, address: u8) {
        if address == DEFAULT_ADDRESS || address >= 128 {
            return;
        }
        let mut used = self.used.lock();
        *used &= !(1u128 << address);
    }

    pub fn is_used(&self, address: u8) -> bool {
        address < 128 && *self.used.lock() & (1u128 << address) != 0
    }
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_start_at_one_and_recycle() {
        let alloc = AddressAllocator::new();
        assert_eq!(alloc.device_enumerate().unwrap(), 1);
        assert_eq!(alloc.device_enumerate().unwrap(), 2);
        alloc.device_gone(1);
        assert_eq!(alloc.device_enumerate().unwrap(), 1);
        assert!(alloc.is_used(2));
        assert!(!alloc.is_used(3));
    }

    #[test]
    fn address_zero_is_never_handed_out() {
        let alloc = AddressAllocator::new();
        alloc.device_gone(0);
        assert_eq!(alloc.device_enumerate().unwrap(), 1);
        assert!(alloc.is_used(0));
    }

    #[test]
    fn exhaustion_reports_busy() {
        let alloc = AddressAllocator::new();
        for _ in 1..128 {
            alloc.device_enumerate().unwrap();
        }
        assert_eq!(alloc.device_enumerate(), Err(UsbError::Busy));
    }
}
