//! Sessions and session slots.
//!
//! A session is a logical bidirectional RPC channel between two endpoints.
//! Client sessions own a fixed window of slots, one per in-flight request;
//! server sessions mirror the window to track requests being served.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::buffer::MsgBuffer;
use crate::cc::CongestionControl;
use crate::rpc::Continuation;
use crate::sm::SmEndpoint;
use crate::transport::{RouteToken, TxPkt};

/// Handle to a session, scoped to the endpoint that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u16);

impl SessionHandle {
    /// The local session number.
    #[inline]
    pub fn session_num(&self) -> u16 {
        self.0
    }
}

/// Which side of the channel this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// Session lifecycle state.
///
/// Transitions are monotone along a successful handshake; `Error` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect request sent, awaiting the response.
    ConnectInProgress,
    /// Handshake complete; requests may flow.
    Connected,
    /// Destroyed before the connect handshake finished; still retrying the
    /// connect so the peer's session can be torn down cleanly.
    DisconnectWaitForConnect,
    /// Disconnect request sent, awaiting the response.
    DisconnectInProgress,
    /// Torn down.
    Disconnected,
    /// Handshake failed.
    Error,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::ConnectInProgress => "connect-in-progress",
            SessionState::Connected => "connected",
            SessionState::DisconnectWaitForConnect => "disconnect-wait-for-connect",
            SessionState::DisconnectInProgress => "disconnect-in-progress",
            SessionState::Disconnected => "disconnected",
            SessionState::Error => "error",
        }
    }

    /// States whose handshake packets are retransmitted on timeout.
    pub fn needs_retry(&self) -> bool {
        matches!(
            self,
            SessionState::ConnectInProgress
                | SessionState::DisconnectWaitForConnect
                | SessionState::DisconnectInProgress
        )
    }
}

/// Slot lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SSlotState {
    /// Available for a new request.
    Free,
    /// Request packets not yet fully handed to the transport (stalled on
    /// credits).
    TxInProgress,
    /// All request packets submitted; awaiting the response.
    AwaitingResp,
    /// Response complete; the slot frees when the response handle is
    /// released.
    RespReceived,
}

/// Client-side bookkeeping for one in-flight request.
pub(crate) struct ClientInfo {
    pub req_type: u8,
    pub cont: Option<Continuation>,
    pub tag: u64,
    /// User's request buffer, held until the continuation fires.
    pub req_msgbuf: Option<MsgBuffer>,
    pub req_num_pkts: u16,
    /// TSC at first transmission, for RTT samples.
    pub tx_ts: u64,
    /// Credits consumed by this request's packets so far.
    pub credits_consumed: u16,
    /// Set once credits came back (explicit return or response completion).
    pub credits_returned: bool,
    /// Response reassembly buffer.
    pub resp: Option<MsgBuffer>,
    pub resp_size: usize,
    pub resp_num_pkts: u16,
    pub resp_pkts_rcvd: u16,
}

/// Server-side bookkeeping for one request being served.
pub(crate) struct ServerInfo {
    pub req_type: u8,
    /// Reassembled request, runtime-owned until the response is enqueued.
    pub req_msgbuf: Option<MsgBuffer>,
    pub req_size: usize,
    pub req_num_pkts: u16,
    pub req_pkts_rcvd: u16,
    /// Response buffer being transmitted.
    pub resp_msgbuf: Option<MsgBuffer>,
    /// The response buffer was handler-allocated; freed after TX completes.
    pub resp_dyn: bool,
    pub resp_num_pkts: u16,
    pub resp_comps_rcvd: u16,
}

pub(crate) enum SlotInfo {
    Idle,
    Client(ClientInfo),
    Server(ServerInfo),
}

/// A session slot: one in-flight RPC.
pub struct SSlot {
    pub index: usize,
    pub state: SSlotState,
    /// Request number of the current occupant; strided by the window size so
    /// reused slots reject stale packets by exact match.
    pub req_num: u64,
    generation: u64,
    pub(crate) info: SlotInfo,
}

impl SSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: SSlotState::Free,
            req_num: 0,
            generation: 0,
            info: SlotInfo::Idle,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == SSlotState::Free
    }

    /// Return the slot to `Free`, bumping the generation for the next use.
    pub(crate) fn reset(&mut self) {
        self.state = SSlotState::Free;
        self.info = SlotInfo::Idle;
        self.generation += 1;
    }

    pub(crate) fn client(&mut self) -> &mut ClientInfo {
        match &mut self.info {
            SlotInfo::Client(c) => c,
            _ => unreachable!("slot {} is not a client slot", self.index),
        }
    }

    pub(crate) fn server(&mut self) -> &mut ServerInfo {
        match &mut self.info {
            SlotInfo::Server(s) => s,
            _ => unreachable!("slot {} is not a server slot", self.index),
        }
    }
}

/// A data packet stalled on credits, waiting in session order.
pub(crate) struct StalledPkt {
    pub sslot_idx: usize,
    pub pkt: TxPkt,
}

/// One logical RPC channel.
pub struct Session {
    pub role: SessionRole,
    pub state: SessionState,
    pub local_session_num: u16,
    /// Peer-assigned session number; filled by the connect handshake.
    pub remote_session_num: u16,
    /// Our descriptor as advertised in handshakes.
    pub local_ep: SmEndpoint,
    /// Peer descriptor; partial on a client until the handshake completes.
    pub remote_ep: SmEndpoint,
    /// Resolved SM address of the peer's bootstrap socket.
    pub remote_sm_addr: Option<SocketAddr>,
    /// Resolved transport route to the peer.
    pub route: Option<RouteToken>,
    pub slots: Vec<SSlot>,
    /// Data packets this session may still inject.
    pub credits: usize,
    pub(crate) stallq: VecDeque<StalledPkt>,
    pub(crate) cc: Box<dyn CongestionControl>,
    /// RPCs whose continuations were dropped by a teardown.
    pub(crate) aborted_rpcs: usize,
    req_window: usize,
}

impl Session {
    pub(crate) fn new(
        role: SessionRole,
        state: SessionState,
        local_session_num: u16,
        local_ep: SmEndpoint,
        remote_ep: SmEndpoint,
        req_window: usize,
        credits: usize,
        cc: Box<dyn CongestionControl>,
    ) -> Self {
        let mut local_ep = local_ep;
        local_ep.session_num = local_session_num;
        Self {
            role,
            state,
            local_session_num,
            remote_session_num: 0,
            local_ep,
            remote_ep,
            remote_sm_addr: None,
            route: None,
            slots: (0..req_window).map(SSlot::new).collect(),
            credits,
            stallq: VecDeque::new(),
            cc,
            aborted_rpcs: 0,
            req_window,
        }
    }

    /// Drop every in-flight RPC without firing its continuation.
    pub(crate) fn drain_slots(&mut self) {
        self.stallq.clear();
        for slot in &mut self.slots {
            if !slot.is_free() {
                slot.reset();
                self.aborted_rpcs += 1;
            }
        }
    }

    #[inline]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle(self.local_session_num)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    #[inline]
    pub fn req_window(&self) -> usize {
        self.req_window
    }

    /// Find a free slot index.
    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_free())
    }

    /// Claim a free slot, assigning its strided request number.
    pub(crate) fn claim_slot(&mut self, idx: usize) -> u64 {
        let w = self.req_window as u64;
        let slot = &mut self.slots[idx];
        debug_assert!(slot.is_free());
        slot.req_num = idx as u64 + w * slot.generation;
        slot.req_num
    }

    /// Locate the occupied slot for a request number; stale numbers miss.
    pub fn slot_for_req(&self, req_num: u64) -> Option<usize> {
        let idx = (req_num % self.req_window as u64) as usize;
        let slot = &self.slots[idx];
        if !slot.is_free() && slot.req_num == req_num {
            Some(idx)
        } else {
            None
        }
    }

    /// Occupied slot for an *incoming* request number, claiming the slot if
    /// it is free (server side). Stale numbers return `None`.
    pub(crate) fn server_slot_for_req(&mut self, req_num: u64) -> Option<usize> {
        let idx = (req_num % self.req_window as u64) as usize;
        let slot = &mut self.slots[idx];
        if slot.is_free() {
            // New request in this slot position.
            if req_num < slot.req_num {
                return None; // stale resend of a completed request
            }
            slot.req_num = req_num;
            Some(idx)
        } else if slot.req_num == req_num {
            Some(idx)
        } else {
            None
        }
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_free()).count()
    }

    pub fn active_slots(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }
}

/// Table of sessions, indexed by local session number.
pub struct SessionTable {
    sessions: Vec<Option<Session>>,
    next_session_num: u16,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: (0..max_sessions).map(|_| None).collect(),
            next_session_num: 0,
        }
    }

    /// Allocate a session number, round-robin over the table.
    pub fn alloc_session_num(&mut self) -> Option<u16> {
        let start = self.next_session_num as usize;
        for i in 0..self.sessions.len() {
            let idx = (start + i) % self.sessions.len();
            if self.sessions[idx].is_none() {
                self.next_session_num = ((idx + 1) % self.sessions.len()) as u16;
                return Some(idx as u16);
            }
        }
        None
    }

    pub fn insert(&mut self, session: Session) {
        let idx = session.local_session_num as usize;
        debug_assert!(self.sessions[idx].is_none());
        self.sessions[idx] = Some(session);
    }

    pub fn get(&self, num: u16) -> Option<&Session> {
        self.sessions.get(num as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, num: u16) -> Option<&mut Session> {
        self.sessions.get_mut(num as usize).and_then(|s| s.as_mut())
    }

    pub fn remove(&mut self, num: u16) -> Option<Session> {
        self.sessions.get_mut(num as usize).and_then(|s| s.take())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().filter_map(|s| s.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cc::Unpaced;

    fn test_session(window: usize) -> Session {
        let ep = SmEndpoint::new("localhost", 1, 0).unwrap();
        Session::new(
            SessionRole::Client,
            SessionState::Connected,
            0,
            ep,
            ep,
            window,
            32,
            Box::new(Unpaced),
        )
    }

    #[test]
    fn test_window_accounting() {
        let mut sess = test_session(8);
        assert_eq!(sess.free_slots() + sess.active_slots(), 8);

        let idx = sess.find_free_slot().unwrap();
        sess.claim_slot(idx);
        sess.slots[idx].state = SSlotState::AwaitingResp;
        assert_eq!(sess.free_slots(), 7);
        assert_eq!(sess.free_slots() + sess.active_slots(), 8);

        sess.slots[idx].reset();
        assert_eq!(sess.free_slots(), 8);
    }

    #[test]
    fn test_req_num_strided_and_stale_rejected() {
        let mut sess = test_session(8);

        let idx = sess.find_free_slot().unwrap();
        let first = sess.claim_slot(idx);
        sess.slots[idx].state = SSlotState::AwaitingResp;
        assert_eq!(sess.slot_for_req(first), Some(idx));

        sess.slots[idx].reset();
        let second = sess.claim_slot(idx);
        sess.slots[idx].state = SSlotState::AwaitingResp;

        assert_eq!(second, first + 8);
        // A response for the previous occupant no longer matches.
        assert_eq!(sess.slot_for_req(first), None);
        assert_eq!(sess.slot_for_req(second), Some(idx));
    }

    #[test]
    fn test_table_round_robin() {
        let mut table = SessionTable::new(4);
        for expect in 0..4 {
            let num = table.alloc_session_num().unwrap();
            assert_eq!(num, expect);
            let mut sess = test_session(2);
            sess.local_session_num = num;
            sess.local_ep.session_num = num;
            table.insert(sess);
        }
        assert!(table.alloc_session_num().is_none());

        table.remove(2);
        assert_eq!(table.alloc_session_num(), Some(2));
    }
}
