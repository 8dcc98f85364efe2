//! Access helpers for words shared with the controller over DMA.
//!
//! Descriptor fields are little-endian on the bus regardless of the host,
//! and the controller may read them concurrently with the CPU, so every
//! access is volatile and byte-order converted in one place.

use core::sync::atomic::{fence, Ordering};

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;

/// One 32-bit descriptor word in device-visible memory.
pub type Le32 = ReadWrite<u32>;

#[inline]
pub fn rd<R: Readable<T = u32>>(reg: &R) -> u32 {
    u32::from_le(reg.get())
}

#[inline]
pub fn wr(reg: &Le32, val: u32) {
    reg.set(val.to_le());
}

#[inline]
pub fn set_bits(reg: &Le32, bits: u32) {
    wr(reg, rd(reg) | bits);
}

#[inline]
pub fn clr_bits(reg: &Le32, bits: u32) {
    wr(reg, rd(reg) & !bits);
}

/// Order all previous descriptor stores before the next one.
///
/// Used before the store that publishes a structure to the controller (the
/// activating status write, or a link-pointer update).
#[inline]
pub fn write_barrier() {
    fence(Ordering::SeqCst);
}
