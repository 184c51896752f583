//! # Time-Stamp Counter
//!
//! TSC read, PIT-referenced calibration, and TSC-based busy-wait delays.
//! The calibrated frequency is published once per boot; CPUs with the
//! invariant-TSC feature share a stable rate across power states.

use core::sync::atomic::{AtomicU64, Ordering};

use super::pit;

/// Calibrated TSC frequency in Hz. A conservative default covers the
/// window before calibration runs.
static TSC_FREQUENCY_HZ: AtomicU64 = AtomicU64::new(2_000_000_000);

/// Read the time-stamp counter.
#[inline]
pub fn read_tsc() -> u64 {
    let (lo, hi): (u32, u32);
    unsafe {
        core::arch::asm!(
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nostack, preserves_flags),
        );
    }
    ((hi as u64) << 32) | (lo as u64)
}

/// Publish the calibrated TSC frequency.
pub fn set_tsc_frequency(freq_hz: u64) {
    TSC_FREQUENCY_HZ.store(freq_hz, Ordering::SeqCst);
}

/// Current (calibrated or default) TSC frequency in Hz.
pub fn tsc_frequency() -> u64 {
    TSC_FREQUENCY_HZ.load(Ordering::Relaxed)
}

/// Calibrate the TSC against the PIT reference.
///
/// Measures TSC ticks across a 10 ms PIT wait and publishes the derived
/// frequency. Returns the frequency in Hz.
pub fn calibrate() -> u64 {
    const CALIBRATION_MS: u64 = 10;

    let start = read_tsc();
    pit::wait_ms(CALIBRATION_MS as u32);
    let end = read_tsc();

    let ticks = end.wrapping_sub(start);
    let freq = ticks * (1000 / CALIBRATION_MS);
    if freq != 0 {
        set_tsc_frequency(freq);
        log::debug!("TSC: calibrated to {} MHz", freq / 1_000_000);
    }
    freq
}

/// Convert microseconds to TSC ticks at the calibrated rate.
#[inline]
pub fn us_to_ticks(us: u64) -> u64 {
    (us * tsc_frequency()) / 1_000_000
}

/// Busy-wait for `us` microseconds on the TSC.
pub fn delay_us(us: u64) {
    let ticks = us_to_ticks(us);
    let start = read_tsc();
    while read_tsc().wrapping_sub(start) < ticks {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsc_monotonic() {
        let a = read_tsc();
        let b = read_tsc();
        assert!(b >= a);
    }

    #[test]
    fn test_us_conversion() {
        set_tsc_frequency(1_000_000_000); // 1 GHz
        assert_eq!(us_to_ticks(1), 1_000);
        assert_eq!(us_to_ticks(1_000), 1_000_000);
        set_tsc_frequency(2_000_000_000);
    }
}
