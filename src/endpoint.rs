//! Generic endpoint object.
//!
//! Each personality wraps [`Endpoint`] with its own queue-head state; the
//! shared part owns the online/offline flag and the single-flight batch
//! slot. At most one batch is ever in flight per endpoint, enforced here.

use alloc::boxed::Box;

use spin::Mutex;

use crate::error::UsbError;
use crate::usb::{Direction, Target, TransferType, UsbSpeed};

/// Transaction-translator coordinates for a full/low-speed endpoint hanging
/// off a high-speed hub (EHCI split transactions).
#[derive(Debug, Clone, Copy)]
pub struct Tt {
    pub hub_address: u8,
    pub port: u8,
}

/// Immutable endpoint characteristics fixed at registration.
#[derive(Debug, Clone, Copy)]
pub struct EndpointProps {
    pub target: Target,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub speed: UsbSpeed,
    pub max_packet_size: u16,
    /// High-bandwidth multiplier; 1 for everything this stack schedules.
    pub packets_per_uframe: u8,
    pub tt: Option<Tt>,
}

impl EndpointProps {
    /// Convenience for the common single-transaction endpoint.
    pub fn new(
        target: Target,
        direction: Direction,
        transfer_type: TransferType,
        speed: UsbSpeed,
        max_packet_size: u16,
    ) -> EndpointProps {
        EndpointProps {
            target,
            direction,
            transfer_type,
            speed,
            max_packet_size,
            packets_per_uframe: 1,
            tt: None,
        }
    }
}

struct State<B> {
    online: bool,
    active: Option<Box<B>>,
}

/// Endpoint lifecycle and single-flight enforcement, generic over the
/// personality's batch type.
pub struct Endpoint<B> {
    pub props: EndpointProps,
    state: Mutex<State<B>>,
}

impl<B> Endpoint<B> {
    pub fn new(props: EndpointProps) -> Endpoint<B> {
        Endpoint {
            props,
            state: Mutex::new(State {
                online: false,
                active: None,
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().online
    }

    pub fn set_online(&self) {
        self.state.lock().online = true;
    }

    /// Take the endpoint offline. New activations fail from here on; an
    /// already active batch stays active until deactivated.
    pub fn set_offline(&self) {
        self.state.lock().online = false;
    }

    /// Make `batch` the endpoint's active transfer.
    ///
    /// Fails with `Offline` when the endpoint is unregistered and `Busy`
    /// when another batch is in flight; the batch is handed back so the
    /// caller can fail it properly.
    pub fn activate(&self, batch: Box<B>) -> Result<(), (UsbError, Box<B>)> {
        let mut state = self.state.lock();
        if !state.online {
            return Err((UsbError::Offline, batch));
        }
        if state.active.is_some() {
            return Err((UsbError::Busy, batch));
        }
        state.active = Some(batch);
        Ok(())
    }

    /// Detach and return the active batch, if any.
    pub fn deactivate(&self) -> Option<Box<B>> {
        self.state.lock().active.take()
    }

    pub fn has_active(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Run `f` with a view of the active batch while it stays attached.
    /// Used by the completion scan, which must not detach the batch until
    /// the personality's predicate says it is done.
    pub fn with_active<R>(&self, f: impl FnOnce(Option<&mut B>) -> R) -> R {
        let mut state = self.state.lock();
        f(state.active.as_deref_mut())
    }
}
