//! Error taxonomy surfaced by the host controller drivers.

use core::fmt;

/// Errors reported on transfer completion and at schedule time.
///
/// The per-personality status decoders map hardware condition codes onto
/// this set; see the `hw` modules for the exact tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Endpoint returned STALL, or the controller halted it on a toggle
    /// mismatch. Cleared by the class driver via CLEAR_FEATURE.
    Stall,
    /// CRC failure or missing handshake (device unplugged mid-transfer,
    /// bad cable).
    BadChecksum,
    /// Bit stuffing violation, babble, or an unexpected PID.
    Io,
    /// Data buffer over- or underrun.
    Overflow,
    /// The device keeps NAKing. Internal; data transfers never surface it,
    /// only the root hub's status-change pipe uses it to park a batch.
    Again,
    /// Transfer was cancelled because its endpoint was unregistered.
    Interrupted,
    /// The operation is not supported (isochronous transfers).
    NotSupported,
    /// DMA memory could not be allocated.
    NoMemory,
    /// A bounded wait on the hardware expired.
    Timeout,
    /// The endpoint already has a batch in flight.
    Busy,
    /// The endpoint is offline (being unregistered).
    Offline,
    /// Malformed request parameters.
    BadArgument,
}

impl UsbError {
    pub fn as_str(self) -> &'static str {
        match self {
            UsbError::Stall => "endpoint stalled",
            UsbError::BadChecksum => "checksum error",
            UsbError::Io => "I/O error",
            UsbError::Overflow => "buffer overrun",
            UsbError::Again => "try again",
            UsbError::Interrupted => "interrupted",
            UsbError::NotSupported => "not supported",
            UsbError::NoMemory => "out of DMA memory",
            UsbError::Timeout => "hardware timeout",
            UsbError::Busy => "endpoint busy",
            UsbError::Offline => "endpoint offline",
            UsbError::BadArgument => "bad argument",
        }
    }
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = core::result::Result<T, UsbError>;
