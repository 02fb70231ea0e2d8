//! Congestion control seam.
//!
//! The endpoint asks the controller for a transmission deadline per outgoing
//! data packet and feeds it RTT samples from completed requests. The pacing
//! wheel enforces the deadlines; controllers only choose them.

use crate::timing::ns_to_cycles;

/// Per-session congestion controller.
pub trait CongestionControl: Send {
    /// Pick the transmission deadline for the next data packet.
    fn on_tx(&mut self, now_tsc: u64) -> u64;

    /// Feed an RTT sample, in nanoseconds.
    fn on_rtt(&mut self, sample_ns: u64);
}

/// No pacing: every packet is due immediately.
pub struct Unpaced;

impl CongestionControl for Unpaced {
    #[inline]
    fn on_tx(&mut self, now_tsc: u64) -> u64 {
        now_tsc
    }

    fn on_rtt(&mut self, _sample_ns: u64) {}
}

// Timely parameters (SIGCOMM 2015), RTT thresholds in microseconds.
const TIMELY_T_LOW_US: f64 = 30.0;
const TIMELY_T_HIGH_US: f64 = 500.0;
const TIMELY_ALPHA: f64 = 0.875;
const TIMELY_BETA: f64 = 0.8;
const TIMELY_DELTA_GBPS: f64 = 0.5;
const TIMELY_MIN_RTT_US: f64 = 10.0;
const TIMELY_UPDATE_INTERVAL: u32 = 16;

/// Minimum rate Timely will pace down to, in Gbps.
pub const TIMELY_MIN_RATE_GBPS: f64 = 0.1;

/// RTT-gradient congestion control.
///
/// Adjusts the sending rate from RTT variation and spaces packet deadlines at
/// `cycles_per_pkt = freq * mtu_bits / rate`, carrying a rolling next-TX
/// timestamp so bursts never collapse the spacing.
pub struct Timely {
    freq_ghz: f64,
    mtu: usize,
    rate_gbps: f64,
    max_rate_gbps: f64,
    next_tx_tsc: u64,
    prev_rtt_us: f64,
    rtt_grad: f64,
    min_rtt_us: f64,
    samples_since_update: u32,
}

impl Timely {
    /// Create a controller starting at the link rate.
    pub fn new(freq_ghz: f64, mtu: usize, link_rate_gbps: f64) -> Self {
        Self {
            freq_ghz,
            mtu,
            rate_gbps: link_rate_gbps,
            max_rate_gbps: link_rate_gbps,
            next_tx_tsc: 0,
            prev_rtt_us: 0.0,
            rtt_grad: 0.0,
            min_rtt_us: f64::MAX,
            samples_since_update: 0,
        }
    }

    /// Current sending rate in Gbps.
    #[inline]
    pub fn rate_gbps(&self) -> f64 {
        self.rate_gbps
    }

    fn cycles_per_pkt(&self) -> u64 {
        let ns_per_pkt = (self.mtu as f64 * 8.0) / self.rate_gbps;
        ns_to_cycles(ns_per_pkt, self.freq_ghz).max(1)
    }
}

impl CongestionControl for Timely {
    fn on_tx(&mut self, now_tsc: u64) -> u64 {
        let deadline = now_tsc.max(self.next_tx_tsc);
        self.next_tx_tsc = deadline + self.cycles_per_pkt();
        deadline
    }

    fn on_rtt(&mut self, sample_ns: u64) {
        let rtt_us = sample_ns as f64 / 1_000.0;
        if rtt_us < self.min_rtt_us {
            self.min_rtt_us = rtt_us;
        }
        let min_rtt_us = self.min_rtt_us.max(TIMELY_MIN_RTT_US);

        self.samples_since_update += 1;
        if self.samples_since_update < TIMELY_UPDATE_INTERVAL {
            return;
        }
        self.samples_since_update = 0;

        let prev_rtt_us = self.prev_rtt_us;
        self.prev_rtt_us = rtt_us;
        if prev_rtt_us == 0.0 {
            return;
        }

        let rtt_diff = rtt_us - prev_rtt_us;
        self.rtt_grad = TIMELY_ALPHA * self.rtt_grad + (1.0 - TIMELY_ALPHA) * rtt_diff;

        let new_rate = if rtt_us < TIMELY_T_LOW_US {
            self.rate_gbps + TIMELY_DELTA_GBPS
        } else if rtt_us > TIMELY_T_HIGH_US {
            self.rate_gbps * TIMELY_BETA
        } else {
            let normalized_grad = self.rtt_grad / min_rtt_us;
            if normalized_grad <= 0.0 {
                self.rate_gbps + TIMELY_DELTA_GBPS
            } else {
                self.rate_gbps * (1.0 - normalized_grad * TIMELY_BETA)
            }
        };

        self.rate_gbps = new_rate.clamp(TIMELY_MIN_RATE_GBPS, self.max_rate_gbps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpaced_deadline_is_now() {
        let mut cc = Unpaced;
        assert_eq!(cc.on_tx(12345), 12345);
    }

    #[test]
    fn test_timely_spacing() {
        let mut cc = Timely::new(2.0, 1024, 10.0);
        let gap = cc.cycles_per_pkt();

        let d0 = cc.on_tx(1_000);
        let d1 = cc.on_tx(1_000);
        let d2 = cc.on_tx(1_000);
        assert_eq!(d0, 1_000);
        assert_eq!(d1, d0 + gap);
        assert_eq!(d2, d1 + gap);

        // A late caller is never scheduled in the past.
        let d3 = cc.on_tx(d2 + 100 * gap);
        assert_eq!(d3, d2 + 100 * gap);
    }

    #[test]
    fn test_timely_additive_increase() {
        let mut cc = Timely::new(2.0, 1024, 40.0);
        cc.rate_gbps = 10.0;

        // Two full update cycles at low RTT; the first only seeds prev_rtt.
        for _ in 0..(2 * TIMELY_UPDATE_INTERVAL) {
            cc.on_rtt(5_000); // 5 us
        }
        assert!(cc.rate_gbps() > 10.0);
    }

    #[test]
    fn test_timely_multiplicative_decrease() {
        let mut cc = Timely::new(2.0, 1024, 40.0);
        for _ in 0..(2 * TIMELY_UPDATE_INTERVAL) {
            cc.on_rtt(600_000); // 600 us, above T_HIGH
        }
        assert!(cc.rate_gbps() < 40.0);
    }

    #[test]
    fn test_timely_rate_clamped() {
        let mut cc = Timely::new(2.0, 1024, 40.0);
        for _ in 0..(64 * TIMELY_UPDATE_INTERVAL) {
            cc.on_rtt(600_000);
        }
        assert!(cc.rate_gbps() >= TIMELY_MIN_RATE_GBPS);

        for _ in 0..(1024 * TIMELY_UPDATE_INTERVAL) {
            cc.on_rtt(5_000);
        }
        assert!(cc.rate_gbps() <= 40.0);
    }
}
