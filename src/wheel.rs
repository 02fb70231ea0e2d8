//! Pacing timing wheel.
//!
//! A congestion controller picks a transmission deadline for every outgoing
//! data packet; the wheel holds the packet until that deadline passes, then
//! releases it into a FIFO ready queue for the transport. The wheel enforces
//! deadlines only — it never computes rates.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::timing::us_to_cycles;
use crate::transport::TxPkt;

/// Initial per-slot queue capacity, in entries.
const WSLOT_CHUNK: usize = 8;

/// Parameters for building a wheel.
#[derive(Debug, Clone)]
pub struct WheelArgs {
    /// MTU in bytes; with `min_rate_gbps` and `session_credits` this sizes
    /// the horizon.
    pub mtu: usize,
    /// Measured TSC frequency in GHz.
    pub freq_ghz: f64,
    /// Width of one wheel slot in microseconds.
    pub wslot_width_us: f64,
    /// Minimum supported pacing rate in Gbps.
    pub min_rate_gbps: f64,
    /// Packets a session may have in flight; the horizon covers one full
    /// credit window of MTU-sized packets at the minimum rate.
    pub session_credits: usize,
}

/// The pacing wheel: a ring of slots, each a FIFO of deferred packets.
pub struct TimingWheel {
    slots: Vec<VecDeque<TxPkt>>,
    num_slots: usize,
    wslot_width_tsc: u64,
    /// Timestamp at which `current_slot` begins.
    base_tsc: u64,
    current_slot: usize,
    /// Packets whose deadline has passed, in release order.
    pub ready_queue: VecDeque<TxPkt>,
}

impl TimingWheel {
    /// Create a wheel whose slot ring starts at `start_tsc`.
    pub fn new(args: &WheelArgs, start_tsc: u64) -> Self {
        let wslot_width_tsc = us_to_cycles(args.wslot_width_us, args.freq_ghz).max(1);

        // Horizon: one credit window of MTU packets at the minimum rate,
        // rounded up to a power of two slots.
        let horizon_ns =
            args.session_credits as f64 * (args.mtu as f64 * 8.0) / args.min_rate_gbps;
        let wslot_width_ns = args.wslot_width_us * 1_000.0;
        let num_slots = ((horizon_ns / wslot_width_ns).ceil() as usize)
            .max(2)
            .next_power_of_two();

        Self {
            slots: (0..num_slots)
                .map(|_| VecDeque::with_capacity(WSLOT_CHUNK))
                .collect(),
            num_slots,
            wslot_width_tsc,
            base_tsc: start_tsc,
            current_slot: 0,
            ready_queue: VecDeque::new(),
        }
    }

    /// Number of slots in the ring.
    #[inline]
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Cycles per wheel slot.
    #[inline]
    pub fn wslot_width_tsc(&self) -> u64 {
        self.wslot_width_tsc
    }

    /// Total coverage of the ring in cycles.
    #[inline]
    pub fn horizon_tsc(&self) -> u64 {
        self.num_slots as u64 * self.wslot_width_tsc
    }

    /// Number of packets still waiting in the ring.
    pub fn pending(&self) -> usize {
        self.slots.iter().map(|s| s.len()).sum()
    }

    /// Defer `pkt` until `deadline_tsc`.
    ///
    /// Deadlines at or before `now_tsc` go straight to the ready queue.
    /// Deadlines beyond the ring's coverage fail with `WheelHorizon`.
    pub fn insert(&mut self, pkt: TxPkt, deadline_tsc: u64, now_tsc: u64) -> Result<()> {
        if deadline_tsc <= now_tsc {
            self.ready_queue.push_back(pkt);
            return Ok(());
        }
        let horizon_tsc = now_tsc + self.horizon_tsc();
        if deadline_tsc > horizon_tsc {
            return Err(Error::WheelHorizon {
                deadline_tsc,
                horizon_tsc,
            });
        }
        let idx = ((deadline_tsc.saturating_sub(self.base_tsc) / self.wslot_width_tsc)
            as usize)
            % self.num_slots;
        self.slots[idx].push_back(pkt);
        Ok(())
    }

    /// Release every packet whose slot has expired by `now_tsc`.
    ///
    /// Walks from the current slot through the slot containing `now_tsc`,
    /// appending each slot's packets to the ready queue in FIFO order, then
    /// re-bases the ring on the slot containing `now_tsc`. A `now_tsc` behind
    /// the ring base is a no-op.
    pub fn reap(&mut self, now_tsc: u64) {
        if now_tsc < self.base_tsc {
            return;
        }
        let delta = ((now_tsc - self.base_tsc) / self.wslot_width_tsc) as usize;
        let to_drain = (delta + 1).min(self.num_slots);
        for i in 0..to_drain {
            let idx = (self.current_slot + i) % self.num_slots;
            self.ready_queue.append(&mut self.slots[idx]);
        }
        self.current_slot = (self.current_slot + delta) % self.num_slots;
        self.base_tsc += delta as u64 * self.wslot_width_tsc;
    }

    /// Move all ready packets into `out`.
    pub fn drain_ready(&mut self, out: &mut Vec<TxPkt>) {
        out.extend(self.ready_queue.drain(..));
    }
}
