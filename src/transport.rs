//! Transport seam.
//!
//! The runtime drives wire-level TX/RX through the [`Transport`] trait, passed
//! to the endpoint at construction as an interface table. Concrete adapters
//! (RDMA UD, DPDK, ...) live outside this crate; [`SimNet`] provides an
//! in-process adapter used by the test suite.
//!
//! Transports are reliable and ordered per sender/receiver pair; the runtime
//! performs no data-plane retransmission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::error::{Error, Result};

/// Opaque memory-registration handle returned by [`Transport`] hooks.
pub type MemRegHandle = u64;

/// Memory registration hook: `(ptr, len) -> handle`.
pub type MemRegFn = Arc<dyn Fn(*mut u8, usize) -> MemRegHandle + Send + Sync>;

/// Memory deregistration hook.
pub type MemDeregFn = Arc<dyn Fn(MemRegHandle) + Send + Sync>;

/// Serialized routing information exchanged through session management.
pub const ROUTE_BYTES_LEN: usize = 32;
pub type RouteBytes = [u8; ROUTE_BYTES_LEN];

/// A resolved route, cheap to copy into every TX descriptor.
pub type RouteToken = u64;

/// An outgoing packet: resolved route, completion tag, and wire bytes.
///
/// A zero tag requests no completion; nonzero tags are echoed back through
/// [`Transport::poll_tx`] once the packet has left the adapter.
#[derive(Debug)]
pub struct TxPkt {
    pub route: RouteToken,
    pub tag: u64,
    pub bytes: Vec<u8>,
}

/// An incoming packet.
#[derive(Debug)]
pub struct RxPkt {
    pub bytes: Vec<u8>,
}

/// TX completion for a tagged packet.
#[derive(Debug, Clone, Copy)]
pub struct TxCompletion {
    pub tag: u64,
}

/// Wire-level transport adapter.
pub trait Transport {
    /// Largest single packet this transport carries.
    fn mtu(&self) -> usize;

    /// Serialized routing info for this endpoint, advertised to peers.
    fn local_route(&self) -> RouteBytes;

    /// Resolve a peer's advertised routing info into a route token.
    fn resolve_route(&mut self, remote: &RouteBytes) -> Result<RouteToken>;

    /// Submit a burst of packets. Non-blocking.
    fn tx_burst(&mut self, pkts: Vec<TxPkt>) -> Result<()>;

    /// Drain TX completions for tagged packets.
    fn poll_tx(&mut self, out: &mut Vec<TxCompletion>);

    /// Poll for received packets. Non-blocking.
    fn rx_burst(&mut self, out: &mut Vec<RxPkt>);

    /// Force out any batched doorbells.
    fn tx_flush(&mut self);

    /// Memory registration hooks for the buffer allocator.
    fn reg_funcs(&self) -> (MemRegFn, MemDeregFn);
}

// ---------------------------------------------------------------------------
// In-process simulated transport
// ---------------------------------------------------------------------------

struct SimNetInner {
    ports: HashMap<u64, Sender<Vec<u8>>>,
}

/// An in-process packet fabric connecting [`SimTransport`] endpoints.
///
/// Delivery is reliable and ordered per sender/receiver pair (backed by one
/// channel per receiving endpoint).
#[derive(Clone)]
pub struct SimNet {
    inner: Arc<Mutex<SimNetInner>>,
    next_id: Arc<AtomicU64>,
}

impl SimNet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimNetInner {
                ports: HashMap::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attach a new endpoint to the fabric.
    pub fn attach(&self, mtu: usize) -> SimTransport {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.inner.lock().unwrap().ports.insert(id, tx);
        SimTransport {
            net: self.clone(),
            id,
            mtu,
            rx,
            completions: Vec::new(),
        }
    }

    fn deliver(&self, dest: u64, bytes: Vec<u8>) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.ports.get(&dest) {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint's view of a [`SimNet`].
pub struct SimTransport {
    net: SimNet,
    id: u64,
    mtu: usize,
    rx: Receiver<Vec<u8>>,
    completions: Vec<TxCompletion>,
}

impl SimTransport {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Transport for SimTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn local_route(&self) -> RouteBytes {
        let mut route = [0u8; ROUTE_BYTES_LEN];
        route[..8].copy_from_slice(&self.id.to_le_bytes());
        route
    }

    fn resolve_route(&mut self, remote: &RouteBytes) -> Result<RouteToken> {
        let id = u64::from_le_bytes(remote[..8].try_into().unwrap());
        if id == 0 {
            return Err(Error::Resolve("zero sim route".into()));
        }
        Ok(id)
    }

    fn tx_burst(&mut self, pkts: Vec<TxPkt>) -> Result<()> {
        for pkt in pkts {
            debug_assert!(pkt.bytes.len() <= self.mtu);
            // Lost peers swallow packets, like a real wire.
            let _ = self.net.deliver(pkt.route, pkt.bytes);
            if pkt.tag != 0 {
                self.completions.push(TxCompletion { tag: pkt.tag });
            }
        }
        Ok(())
    }

    fn poll_tx(&mut self, out: &mut Vec<TxCompletion>) {
        out.append(&mut self.completions);
    }

    fn rx_burst(&mut self, out: &mut Vec<RxPkt>) {
        while let Ok(bytes) = self.rx.try_recv() {
            out.push(RxPkt { bytes });
        }
    }

    fn tx_flush(&mut self) {}

    fn reg_funcs(&self) -> (MemRegFn, MemDeregFn) {
        // The simulated fabric copies packet bytes; registration is a no-op.
        (Arc::new(|_, _| 0), Arc::new(|_| {}))
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.net.inner.lock().unwrap().ports.remove(&self.id);
    }
}
