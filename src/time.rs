//! Bounded waits and busy-wait delays.
//!
//! Hardware hand-off sequences need millisecond-scale pauses and every
//! register poll must be bounded, so nothing here ever sleeps a task; the
//! embedder decides what runs while a driver spins.

#[cfg(not(test))]
use core::sync::atomic::{AtomicU64, Ordering};

/// TSC ticks per microsecond. A sane default for the poll loops even when
/// the embedder never calibrates; delays are then merely inaccurate.
#[cfg(not(test))]
static TICKS_PER_US: AtomicU64 = AtomicU64::new(1000);

/// Set the timestamp-counter frequency, in ticks per microsecond.
#[cfg(not(test))]
pub fn calibrate(ticks_per_us: u64) {
    TICKS_PER_US.store(ticks_per_us.max(1), Ordering::Relaxed);
}

#[cfg(all(not(test), target_arch = "x86_64"))]
fn now_ticks() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(all(not(test), target_arch = "x86"))]
fn now_ticks() -> u64 {
    unsafe { core::arch::x86::_rdtsc() }
}

#[cfg(all(not(test), not(any(target_arch = "x86_64", target_arch = "x86"))))]
fn now_ticks() -> u64 {
    // No cheap monotonic counter on this target; a relaxed software tick
    // keeps the poll loops terminating.
    static FALLBACK: AtomicU64 = AtomicU64::new(0);
    FALLBACK.fetch_add(1, Ordering::Relaxed)
}

#[cfg(not(test))]
fn ticks_per_us() -> u64 {
    TICKS_PER_US.load(Ordering::Relaxed)
}

#[cfg(test)]
fn now_ticks() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

#[cfg(test)]
fn ticks_per_us() -> u64 {
    1
}

/// A deadline for register polling.
pub struct Timeout {
    deadline: u64,
}

impl Timeout {
    pub fn from_ms(ms: u64) -> Timeout {
        Timeout::from_us(ms * 1000)
    }

    pub fn from_us(us: u64) -> Timeout {
        Timeout {
            deadline: now_ticks().wrapping_add(us.saturating_mul(ticks_per_us())),
        }
    }

    pub fn is_expired(&self) -> bool {
        // Wrapping comparison keeps this correct across a TSC rollover.
        now_ticks().wrapping_sub(self.deadline) < (1 << 63)
    }
}

/// Busy-wait for at least `us` microseconds.
pub fn delay_us(us: u64) {
    let timeout = Timeout::from_us(us);
    while !timeout.is_expired() {
        core::hint::spin_loop();
    }
}

/// Busy-wait for at least `ms` milliseconds.
pub fn delay_ms(ms: u64) {
    delay_us(ms * 1000);
}
