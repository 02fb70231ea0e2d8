//! Process-wide Nexus.
//!
//! One Nexus per process: it measures the TSC frequency once, owns the UDP
//! bootstrap socket for session management, and holds the immutable request
//! handler table shared by all endpoints. There are no implicit globals; the
//! Nexus is constructed explicitly and passed to each endpoint.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::rpc::{ReqHandle, RpcContext};
use crate::sm::{SmPkt, SM_PKT_SIZE};
use crate::timing::measure_rdtsc_freq;

/// How a request handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Runs inline on the endpoint thread; must not issue nested requests.
    FgTerminal,
    /// Runs inline on the endpoint thread; may issue nested requests.
    FgNonterminal,
    /// Runs on a background worker thread.
    Background,
}

/// Request handler function.
///
/// Invoked with a context for nested operations and the request handle; the
/// handler must enqueue a response for the handle exactly once, now or later.
pub type ReqHandlerFn = Arc<dyn Fn(&dyn RpcContext, ReqHandle) + Send + Sync>;

/// One registered handler.
#[derive(Clone)]
pub struct HandlerEntry {
    pub kind: HandlerKind,
    pub func: ReqHandlerFn,
}

type SmInbox = Sender<(SmPkt, SocketAddr)>;

/// Process-wide registry: frequency, SM socket, handler table.
pub struct Nexus {
    freq_ghz: f64,
    hostname: String,
    sm_port: u16,
    socket: UdpSocket,
    drain_lock: Mutex<[u8; 2048]>,
    inboxes: Mutex<HashMap<u8, SmInbox>>,
    handlers: Mutex<HashMap<u8, HandlerEntry>>,
}

impl Nexus {
    /// Create the Nexus, binding the SM socket to `hostname:sm_port`.
    ///
    /// Pass port 0 to bind an ephemeral port (useful in tests); the bound
    /// port is available through [`Nexus::sm_port`].
    pub fn new(hostname: &str, sm_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((hostname, sm_port))?;
        socket.set_nonblocking(true)?;
        let sm_port = socket.local_addr()?.port();
        let freq_ghz = measure_rdtsc_freq();

        Ok(Self {
            freq_ghz,
            hostname: hostname.to_string(),
            sm_port,
            socket,
            drain_lock: Mutex::new([0u8; 2048]),
            inboxes: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// Measured TSC frequency in GHz.
    #[inline]
    pub fn freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    /// Hostname the SM socket is bound to.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Bound SM UDP port.
    pub fn sm_port(&self) -> u16 {
        self.sm_port
    }

    /// Register a handler for a request type.
    ///
    /// The table is write-once per type: a second registration fails with
    /// `HandlerExists`.
    pub fn register_handler<F>(&self, req_type: u8, kind: HandlerKind, func: F) -> Result<()>
    where
        F: Fn(&dyn RpcContext, ReqHandle) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().unwrap();
        match handlers.entry(req_type) {
            Entry::Occupied(_) => Err(Error::HandlerExists(req_type)),
            Entry::Vacant(e) => {
                e.insert(HandlerEntry {
                    kind,
                    func: Arc::new(func),
                });
                Ok(())
            }
        }
    }

    /// Look up the handler for a request type.
    pub(crate) fn handler(&self, req_type: u8) -> Option<HandlerEntry> {
        self.handlers.lock().unwrap().get(&req_type).cloned()
    }

    /// Attach an endpoint, returning its SM inbox.
    ///
    /// Endpoint ids must be unique within the process; reuse is a
    /// programming error.
    pub(crate) fn register_endpoint(&self, ep_id: u8) -> Receiver<(SmPkt, SocketAddr)> {
        let mut inboxes = self.inboxes.lock().unwrap();
        assert!(
            !inboxes.contains_key(&ep_id),
            "endpoint id {ep_id} already attached to this Nexus"
        );
        let (tx, rx) = unbounded();
        inboxes.insert(ep_id, tx);
        rx
    }

    /// Detach an endpoint.
    pub(crate) fn unregister_endpoint(&self, ep_id: u8) {
        self.inboxes.lock().unwrap().remove(&ep_id);
    }

    /// Drain the SM socket and demultiplex packets into endpoint inboxes.
    ///
    /// Whichever endpoint ticks first drains for everyone; contention simply
    /// skips the drain for this tick.
    pub(crate) fn drain_sm(&self) {
        let mut buf = match self.drain_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        loop {
            let (len, from) = match self.socket.recv_from(&mut *buf) {
                Ok(x) => x,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("sm socket error: {e}");
                    break;
                }
            };
            if len < SM_PKT_SIZE {
                warn!("short sm packet from {from}, dropping");
                continue;
            }
            let Some(pkt) = SmPkt::from_bytes(&buf[..len]) else {
                warn!("unparsable sm packet from {from}, dropping");
                continue;
            };
            let inboxes = self.inboxes.lock().unwrap();
            match inboxes.get(&pkt.dest_ep_id()) {
                Some(inbox) => {
                    let _ = inbox.send((pkt, from));
                }
                None => {
                    warn!("sm packet for unknown endpoint {} from {from}", pkt.dest_ep_id());
                }
            }
        }
    }

    /// Send a session management packet.
    pub(crate) fn send_sm(&self, pkt: &SmPkt, dest: SocketAddr) -> Result<()> {
        trace!("sm tx {:?} -> {dest}", pkt.pkt_type);
        self.socket.send_to(&pkt.serialize(), dest)?;
        Ok(())
    }
}
