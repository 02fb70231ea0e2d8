//! Cycle-counter clock and calibrated frequency measurement.
//!
//! All runtime deadlines (handshake retransmission, pacing) are expressed in
//! TSC cycles and converted to wall time with the frequency measured once at
//! Nexus creation.

use std::time::{Duration, Instant};

/// Read the CPU cycle counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::sync::OnceLock;
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Measure the TSC frequency in GHz (cycles per nanosecond).
///
/// Spins for a fixed wall-time window and compares elapsed cycles against the
/// monotonic clock. The result is cached by the Nexus.
pub fn measure_rdtsc_freq() -> f64 {
    const CALIBRATION_WINDOW: Duration = Duration::from_millis(10);

    let wall_start = Instant::now();
    let tsc_start = rdtsc();
    while wall_start.elapsed() < CALIBRATION_WINDOW {
        std::hint::spin_loop();
    }
    let cycles = rdtsc().wrapping_sub(tsc_start);
    let nanos = wall_start.elapsed().as_nanos() as f64;

    let freq_ghz = cycles as f64 / nanos;
    // TSC-less fallbacks report nanoseconds directly, which measures as 1 GHz.
    assert!(
        freq_ghz > 0.1 && freq_ghz < 10.0,
        "implausible TSC frequency: {freq_ghz} GHz"
    );
    freq_ghz
}

/// Convert a cycle count to seconds.
#[inline]
pub fn to_sec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1_000_000_000.0)
}

/// Convert a cycle count to milliseconds.
#[inline]
pub fn to_ms(cycles: u64, freq_ghz: f64) -> f64 {
    to_sec(cycles, freq_ghz) * 1_000.0
}

/// Convert microseconds to cycles.
#[inline]
pub fn us_to_cycles(us: f64, freq_ghz: f64) -> u64 {
    (us * freq_ghz * 1_000.0) as u64
}

/// Convert nanoseconds to cycles.
#[inline]
pub fn ns_to_cycles(ns: f64, freq_ghz: f64) -> u64 {
    (ns * freq_ghz) as u64
}

/// Convert a cycle count to nanoseconds.
#[inline]
pub fn to_ns(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / freq_ghz
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdtsc_monotone() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn test_freq_plausible() {
        let freq = measure_rdtsc_freq();
        assert!(freq > 0.1 && freq < 10.0);
    }

    #[test]
    fn test_conversions() {
        let freq = 2.0; // 2 GHz
        assert_eq!(us_to_cycles(1.0, freq), 2_000);
        assert_eq!(ns_to_cycles(100.0, freq), 200);
        let ms = to_ms(2_000_000, freq);
        assert!((ms - 1.0).abs() < 1e-9);
    }
}
