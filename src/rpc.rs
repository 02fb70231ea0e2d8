//! The RPC endpoint.
//!
//! An `Rpc` is single-threaded cooperative: all of its state is touched only
//! by its owner thread inside [`Rpc::progress`], which never blocks. Request
//! handlers and continuations run on that thread (or defer through the
//! background pool) and may issue nested operations on the same endpoint.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver};
use tracing::{debug, trace, warn};

use crate::background::{self, BgCompletion, BgPool, BgWork};
use crate::buffer::{MsgAllocator, MsgBuffer};
use crate::cc::{CongestionControl, Timely, Unpaced};
use crate::config::RpcConfig;
use crate::error::{Error, RejectReason, Result};
use crate::nexus::{HandlerEntry, HandlerKind, Nexus};
use crate::packet::{PktHdr, PktType, PKT_HDR_SIZE};
use crate::session::{
    ClientInfo, ServerInfo, Session, SessionHandle, SessionRole, SessionState, SlotInfo,
    SSlotState, SessionTable, StalledPkt,
};
use crate::sm::{SmEndpoint, SmEventKind, SmHandler, SmNotification, SmPkt, SmPktType};
use crate::timing::{rdtsc, to_ms, to_ns};
use crate::transport::{RxPkt, Transport, TxCompletion, TxPkt};
use crate::wheel::{TimingWheel, WheelArgs};

/// Continuation invoked when a response arrives: `(context, response, tag)`.
///
/// The continuation must release the response handle exactly once; the slot
/// stays occupied until it does.
pub type Continuation = Box<dyn FnOnce(&dyn RpcContext, RespHandle, u64) + Send>;

/// Operations available to request handlers and continuations.
///
/// On the endpoint thread this is the endpoint itself; on background workers
/// it is a proxy that defers every endpoint mutation back to the owner
/// thread.
pub trait RpcContext {
    /// Allocate a message buffer.
    fn alloc_msg_buffer(&self, max_size: usize) -> Result<MsgBuffer>;

    /// Free a message buffer.
    fn free_msg_buffer(&self, buf: MsgBuffer);

    /// Start an asynchronous request on a connected session.
    fn enqueue_request(
        &self,
        session: SessionHandle,
        req_type: u8,
        req_msgbuf: MsgBuffer,
        cont: Continuation,
        tag: u64,
    ) -> Result<()>;

    /// Send the response for a request handle. Must be called exactly once
    /// per handle, now or later.
    fn enqueue_response(&self, req: ReqHandle);

    /// Release a response handle, returning its slot to the window.
    fn release_response(&self, resp: RespHandle);

    /// True when running on a background worker thread.
    fn in_background(&self) -> bool;
}

/// Server-side handle for one received request.
///
/// Carries the runtime-owned request buffer and a preallocated response
/// buffer. Handlers either write into `pre_resp_msgbuf`, or allocate
/// `dyn_resp_msgbuf` and clear `prealloc_used`; the runtime frees whichever
/// buffer was used once its transmission completes.
pub struct ReqHandle {
    session_num: u16,
    sslot_idx: usize,
    req_num: u64,
    req_type: u8,
    req_msgbuf: MsgBuffer,
    /// MTU-sized response buffer, runtime-allocated.
    pub pre_resp_msgbuf: MsgBuffer,
    /// Handler-allocated response buffer for larger responses.
    pub dyn_resp_msgbuf: Option<MsgBuffer>,
    /// Clear when responding through `dyn_resp_msgbuf`.
    pub prealloc_used: bool,
}

impl ReqHandle {
    /// The received request payload.
    #[inline]
    pub fn req_msgbuf(&self) -> &MsgBuffer {
        &self.req_msgbuf
    }

    /// The session this request arrived on.
    #[inline]
    pub fn session(&self) -> SessionHandle {
        SessionHandle(self.session_num)
    }

    /// The request type.
    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }
}

/// Client-side handle for one received response.
pub struct RespHandle {
    session_num: u16,
    req_num: u64,
    resp_msgbuf: MsgBuffer,
    req_msgbuf: Option<MsgBuffer>,
}

impl RespHandle {
    /// The response payload. Valid until the handle is released.
    #[inline]
    pub fn resp_msgbuf(&self) -> &MsgBuffer {
        &self.resp_msgbuf
    }

    /// Reclaim the request buffer passed to `enqueue_request`. Buffers left
    /// in the handle are freed on release.
    pub fn take_req_msgbuf(&mut self) -> Option<MsgBuffer> {
        self.req_msgbuf.take()
    }
}

/// One handshake awaiting a reply.
#[derive(Debug, Clone, Copy)]
struct SmRecord {
    session_num: u16,
    start_tsc: u64,
    last_send_tsc: u64,
}

/// Destination slot of a tagged response transmission.
#[derive(Debug, Clone, Copy)]
struct RespTxRef {
    session_num: u16,
    sslot_idx: usize,
    req_num: u64,
}

/// An RPC endpoint: sessions, request window engine, pacing wheel, SM driver.
pub struct Rpc {
    nexus: Arc<Nexus>,
    id: u8,
    config: RpcConfig,
    freq_ghz: f64,
    mtu: usize,
    local_ep: SmEndpoint,
    transport: RefCell<Box<dyn Transport>>,
    allocator: Arc<MsgAllocator>,
    sessions: RefCell<SessionTable>,
    sm_inbox: Receiver<(SmPkt, SocketAddr)>,
    sm_handler: RefCell<SmHandler>,
    sm_retry: RefCell<Vec<SmRecord>>,
    wheel: RefCell<TimingWheel>,
    bg_pool: Option<BgPool>,
    bg_comp_rx: Receiver<BgCompletion>,
    pending_tx: RefCell<HashMap<u64, RespTxRef>>,
    next_tx_tag: Cell<u64>,
}

impl Rpc {
    /// Create an endpoint attached to `nexus`.
    ///
    /// `id` must be unique among the endpoints of this Nexus; `sm_handler`
    /// receives session management notifications.
    pub fn new(
        nexus: Arc<Nexus>,
        id: u8,
        transport: Box<dyn Transport>,
        sm_handler: SmHandler,
        config: RpcConfig,
    ) -> Result<Self> {
        let mtu = transport.mtu();
        let (reg, dereg) = transport.reg_funcs();
        let allocator = Arc::new(MsgAllocator::new(reg, dereg));

        let mut local_ep = SmEndpoint::new(nexus.hostname(), nexus.sm_port(), id)?;
        local_ep.route = transport.local_route();

        let wheel = TimingWheel::new(
            &WheelArgs {
                mtu,
                freq_ghz: nexus.freq_ghz(),
                wslot_width_us: config.wslot_width_us,
                min_rate_gbps: config.min_rate_gbps,
                session_credits: config.session_credits,
            },
            rdtsc(),
        );

        let (bg_comp_tx, bg_comp_rx) = unbounded();
        let bg_pool = (config.num_bg_threads > 0)
            .then(|| BgPool::new(config.num_bg_threads, allocator.clone(), bg_comp_tx));

        let sm_inbox = nexus.register_endpoint(id);
        let freq_ghz = nexus.freq_ghz();

        Ok(Self {
            nexus,
            id,
            freq_ghz,
            mtu,
            local_ep,
            transport: RefCell::new(transport),
            allocator,
            sessions: RefCell::new(SessionTable::new(config.max_sessions)),
            sm_inbox,
            sm_handler: RefCell::new(sm_handler),
            sm_retry: RefCell::new(Vec::new()),
            wheel: RefCell::new(wheel),
            bg_pool,
            bg_comp_rx,
            pending_tx: RefCell::new(HashMap::new()),
            next_tx_tag: Cell::new(1),
            config,
        })
    }

    /// This endpoint's id within the Nexus.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Transport MTU in bytes.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// The endpoint configuration.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Number of sessions in the table (both roles).
    pub fn active_sessions(&self) -> usize {
        self.sessions.borrow().active_count()
    }

    /// Live message buffers handed out by this endpoint's allocator.
    pub fn outstanding_buffers(&self) -> usize {
        self.allocator.outstanding()
    }

    /// True when called from a background worker thread.
    pub fn in_background(&self) -> bool {
        background::in_background()
    }

    /// Change a buffer's data size within its allocated capacity.
    pub fn resize_msg_buffer(&self, buf: &mut MsgBuffer, new_size: usize) -> Result<()> {
        buf.resize(new_size)
    }

    fn make_cc(&self) -> Box<dyn CongestionControl> {
        if self.config.enable_pacing {
            Box::new(Timely::new(
                self.freq_ghz,
                self.mtu,
                self.config.link_rate_gbps,
            ))
        } else {
            Box::new(Unpaced)
        }
    }

    #[inline]
    fn payload_per_pkt(&self) -> usize {
        self.mtu - PKT_HDR_SIZE
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Open a client session to a remote endpoint.
    ///
    /// Sends the connect request and returns immediately; the outcome arrives
    /// through the SM handler.
    pub fn open_session(
        &self,
        remote_hostname: &str,
        remote_sm_port: u16,
        remote_ep_id: u8,
    ) -> Result<SessionHandle> {
        let remote_sm_addr = (remote_hostname, remote_sm_port)
            .to_socket_addrs()
            .map_err(|_| Error::Resolve(remote_hostname.to_string()))?
            .next()
            .ok_or_else(|| Error::Resolve(remote_hostname.to_string()))?;

        let connect_req;
        let session_num;
        {
            let mut sessions = self.sessions.borrow_mut();
            session_num = sessions
                .alloc_session_num()
                .ok_or(Error::NoMem("session table full"))?;

            let remote_ep = SmEndpoint::new(remote_hostname, remote_sm_port, remote_ep_id)?;
            let mut sess = Session::new(
                SessionRole::Client,
                SessionState::ConnectInProgress,
                session_num,
                self.local_ep,
                remote_ep,
                self.config.req_window,
                self.config.session_credits,
                self.make_cc(),
            );
            sess.remote_sm_addr = Some(remote_sm_addr);
            connect_req = SmPkt::connect_req(sess.local_ep, sess.remote_ep);
            sessions.insert(sess);
        }

        self.nexus.send_sm(&connect_req, remote_sm_addr)?;
        let now = rdtsc();
        self.sm_retry.borrow_mut().push(SmRecord {
            session_num,
            start_tsc: now,
            last_send_tsc: now,
        });
        debug!(
            "session {session_num}: connect to {remote_hostname}:{remote_sm_port}/ep{remote_ep_id}"
        );
        Ok(SessionHandle(session_num))
    }

    /// Start tearing down a client session.
    ///
    /// In-flight RPCs are dropped without firing their continuations; the
    /// failure is surfaced through the disconnect notification.
    pub fn destroy_session(&self, handle: SessionHandle) -> Result<()> {
        let num = handle.session_num();
        let disconnect_req;
        let dest;
        {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions
                .get_mut(num)
                .ok_or(Error::SessionDisconnected(num))?;
            if sess.role != SessionRole::Client {
                return Err(Error::SessionState {
                    session_num: num,
                    state: "server-role",
                });
            }
            match sess.state {
                SessionState::ConnectInProgress => {
                    // Keep retrying the connect; the disconnect follows once
                    // the peer answers.
                    sess.state = SessionState::DisconnectWaitForConnect;
                    sess.drain_slots();
                    debug!("session {num}: destroy before connect completed");
                    return Ok(());
                }
                SessionState::Connected => {
                    sess.state = SessionState::DisconnectInProgress;
                    sess.drain_slots();
                    disconnect_req = SmPkt::disconnect_req(sess.local_ep, sess.remote_ep);
                    dest = sess.remote_sm_addr.expect("connected session has SM address");
                }
                state => {
                    return Err(Error::SessionState {
                        session_num: num,
                        state: state.name(),
                    })
                }
            }
        }

        self.nexus.send_sm(&disconnect_req, dest)?;
        let now = rdtsc();
        self.sm_retry.borrow_mut().push(SmRecord {
            session_num: num,
            start_tsc: now,
            last_send_tsc: now,
        });
        debug!("session {num}: disconnect requested");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Request path
    // -----------------------------------------------------------------------

    fn enqueue_request_inner(
        &self,
        handle: SessionHandle,
        req_type: u8,
        req_msgbuf: MsgBuffer,
        cont: Continuation,
        tag: u64,
    ) -> Result<()> {
        let msg_size = req_msgbuf.len();
        if msg_size > self.config.max_msg_size {
            return Err(Error::MsgTooLarge {
                size: msg_size,
                max: self.config.max_msg_size,
            });
        }

        let num = handle.session_num();
        let mut immediate = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions
                .get_mut(num)
                .ok_or(Error::SessionDisconnected(num))?;
            if sess.role != SessionRole::Client || !sess.is_connected() {
                return Err(Error::SessionState {
                    session_num: num,
                    state: sess.state.name(),
                });
            }
            let idx = sess.find_free_slot().ok_or(Error::NoSlot)?;
            let req_num = sess.claim_slot(idx);
            let num_pkts = PktHdr::calc_num_pkts(msg_size, self.mtu);

            let pkts = self.build_data_pkts(
                req_type,
                msg_size,
                sess.remote_session_num,
                req_num,
                req_msgbuf.as_slice(),
                true,
                sess.route.expect("connected session has route"),
            );

            let slot = &mut sess.slots[idx];
            slot.state = SSlotState::TxInProgress;
            slot.info = SlotInfo::Client(ClientInfo {
                req_type,
                cont: Some(cont),
                tag,
                req_msgbuf: Some(req_msgbuf),
                req_num_pkts: num_pkts,
                tx_ts: rdtsc(),
                credits_consumed: 0,
                credits_returned: false,
                resp: None,
                resp_size: 0,
                resp_num_pkts: 0,
                resp_pkts_rcvd: 0,
            });
            trace!("session {num}: request {req_num} type {req_type}, {num_pkts} pkts");

            let now = rdtsc();
            self.submit_data_pkts(sess, idx, pkts, now, &mut immediate);
        }
        self.tx_now(immediate);
        Ok(())
    }

    /// Serialize a message into wire packets.
    #[allow(clippy::too_many_arguments)]
    fn build_data_pkts(
        &self,
        req_type: u8,
        msg_size: usize,
        dest_session_num: u16,
        req_num: u64,
        payload: &[u8],
        is_req: bool,
        route: u64,
    ) -> Vec<TxPkt> {
        let per_pkt = self.payload_per_pkt();
        let num_pkts = PktHdr::calc_num_pkts(msg_size, self.mtu);
        (0..num_pkts)
            .map(|pkt_num| {
                let pkt_type = match (is_req, num_pkts, pkt_num) {
                    (true, 1, _) => PktType::SmallReq,
                    (false, 1, _) => PktType::SmallResp,
                    (true, _, 0) => PktType::BigReqFirst,
                    (true, _, _) => PktType::BigReqLater,
                    (false, _, 0) => PktType::BigRespFirst,
                    (false, _, _) => PktType::BigRespLater,
                };
                let hdr = PktHdr::new(req_type, msg_size, dest_session_num, pkt_type, pkt_num, req_num);
                let start = pkt_num as usize * per_pkt;
                let end = (start + per_pkt).min(payload.len());
                let chunk = &payload[start..end];

                let mut bytes = vec![0u8; PKT_HDR_SIZE + chunk.len()];
                hdr.write_to(&mut bytes);
                bytes[PKT_HDR_SIZE..].copy_from_slice(chunk);
                TxPkt {
                    route,
                    tag: 0,
                    bytes,
                }
            })
            .collect()
    }

    /// Submit a client slot's packets, honoring credits and pacing.
    ///
    /// Packets that cannot get a credit wait in the session's stall queue in
    /// submission order.
    fn submit_data_pkts(
        &self,
        sess: &mut Session,
        sslot_idx: usize,
        pkts: Vec<TxPkt>,
        now: u64,
        immediate: &mut Vec<TxPkt>,
    ) {
        for pkt in pkts {
            if sess.credits == 0 || !sess.stallq.is_empty() {
                sess.stallq.push_back(StalledPkt { sslot_idx, pkt });
                continue;
            }
            sess.credits -= 1;
            sess.slots[sslot_idx].client().credits_consumed += 1;
            self.pace_or_queue(sess, pkt, now, immediate);
        }
        self.update_submit_state(sess, sslot_idx);
    }

    /// Release stalled packets while credits remain.
    fn drain_stallq(&self, sess: &mut Session, now: u64, immediate: &mut Vec<TxPkt>) {
        let mut touched = Vec::new();
        while sess.credits > 0 {
            let Some(stalled) = sess.stallq.pop_front() else {
                break;
            };
            sess.credits -= 1;
            sess.slots[stalled.sslot_idx].client().credits_consumed += 1;
            touched.push(stalled.sslot_idx);
            self.pace_or_queue(sess, stalled.pkt, now, immediate);
        }
        touched.dedup();
        for idx in touched {
            self.update_submit_state(sess, idx);
        }
    }

    fn update_submit_state(&self, sess: &mut Session, sslot_idx: usize) {
        let slot = &mut sess.slots[sslot_idx];
        if slot.state == SSlotState::TxInProgress {
            let client = slot.client();
            if client.credits_consumed == client.req_num_pkts {
                slot.state = SSlotState::AwaitingResp;
            }
        }
    }

    /// Route one packet through the pacing wheel, or queue it for immediate
    /// transmission when pacing is off.
    fn pace_or_queue(
        &self,
        sess: &mut Session,
        pkt: TxPkt,
        now: u64,
        immediate: &mut Vec<TxPkt>,
    ) {
        if !self.config.enable_pacing {
            immediate.push(pkt);
            return;
        }
        let mut wheel = self.wheel.borrow_mut();
        // Clamp the controller's deadline to the wheel's coverage; a rate
        // collapse must slow the session, not lose packets.
        let max_deadline = now + wheel.horizon_tsc() - wheel.wslot_width_tsc();
        let deadline = sess.cc.on_tx(now).min(max_deadline);
        let inserted = wheel.insert(pkt, deadline, now);
        debug_assert!(inserted.is_ok());
    }

    fn tx_now(&self, pkts: Vec<TxPkt>) {
        if pkts.is_empty() {
            return;
        }
        if let Err(e) = self.transport.borrow_mut().tx_burst(pkts) {
            warn!("tx_burst failed: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Response path (server side)
    // -----------------------------------------------------------------------

    fn enqueue_response_inner(&self, req: ReqHandle) {
        let ReqHandle {
            session_num,
            sslot_idx,
            req_num,
            req_type,
            req_msgbuf,
            pre_resp_msgbuf,
            dyn_resp_msgbuf,
            prealloc_used,
        } = req;

        let (resp_msgbuf, resp_dyn) = if !prealloc_used {
            match dyn_resp_msgbuf {
                Some(buf) => (buf, true),
                None => {
                    warn!("response for request {req_num} cleared prealloc_used without dyn_resp_msgbuf");
                    return;
                }
            }
        } else {
            (pre_resp_msgbuf, false)
        };

        let mut immediate = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(session_num) else {
                // Session torn down while the handler ran.
                trace!("response for request {req_num} on dead session {session_num}, dropped");
                return;
            };
            let slot = &mut sess.slots[sslot_idx];
            if slot.req_num != req_num || slot.state != SSlotState::AwaitingResp {
                trace!("response for stale request {req_num}, dropped");
                return;
            }

            let msg_size = resp_msgbuf.len();
            let num_pkts = PktHdr::calc_num_pkts(msg_size, self.mtu);
            let mut pkts = self.build_data_pkts(
                req_type,
                msg_size,
                sess.remote_session_num,
                req_num,
                resp_msgbuf.as_slice(),
                false,
                sess.route.expect("connected session has route"),
            );

            // Tag every response packet so TX completions can free the
            // response buffer and the slot.
            for pkt in &mut pkts {
                let tag = self.next_tx_tag.get();
                self.next_tx_tag.set(tag + 1);
                pkt.tag = tag;
                self.pending_tx.borrow_mut().insert(
                    tag,
                    RespTxRef {
                        session_num,
                        sslot_idx,
                        req_num,
                    },
                );
            }

            let server = slot.server();
            server.resp_msgbuf = Some(resp_msgbuf);
            server.resp_dyn = resp_dyn;
            server.resp_num_pkts = num_pkts;
            server.resp_comps_rcvd = 0;
            slot.state = SSlotState::TxInProgress;
            trace!("session {session_num}: response {req_num}, {num_pkts} pkts");

            let now = rdtsc();
            for pkt in pkts {
                // Responses return window space to the peer; they are paced
                // but never gated on credits.
                self.pace_or_queue(sess, pkt, now, &mut immediate);
            }
        }
        // The request buffer is runtime-owned and dies with the response
        // enqueue. An unused preallocated buffer (dyn path) dies here too.
        drop(req_msgbuf);
        self.tx_now(immediate);
    }

    /// Apply one TX completion for a tagged response packet.
    fn finish_resp_tx(&self, comp: TxCompletion) {
        let Some(txref) = self.pending_tx.borrow_mut().remove(&comp.tag) else {
            return;
        };
        let mut sessions = self.sessions.borrow_mut();
        let Some(sess) = sessions.get_mut(txref.session_num) else {
            return;
        };
        let slot = &mut sess.slots[txref.sslot_idx];
        if slot.req_num != txref.req_num || slot.state != SSlotState::TxInProgress {
            return;
        }
        let server = slot.server();
        server.resp_comps_rcvd += 1;
        if server.resp_comps_rcvd == server.resp_num_pkts {
            // Frees the response buffer, preallocated or dynamic.
            slot.reset();
        }
    }

    // -----------------------------------------------------------------------
    // Data-plane RX
    // -----------------------------------------------------------------------

    fn process_data_pkt(&self, bytes: &[u8]) {
        let hdr = match PktHdr::from_bytes(bytes) {
            Ok(hdr) => hdr,
            Err(e) => {
                warn!("dropping invalid data packet: {e}");
                return;
            }
        };
        let payload = &bytes[PKT_HDR_SIZE..];
        match hdr.pkt_type {
            PktType::SmallReq | PktType::BigReqFirst | PktType::BigReqLater => {
                self.handle_req_pkt(&hdr, payload)
            }
            PktType::SmallResp | PktType::BigRespFirst | PktType::BigRespLater => {
                self.handle_resp_pkt(&hdr, payload)
            }
            PktType::CreditReturn => self.handle_credit_return(&hdr),
        }
    }

    fn handle_req_pkt(&self, hdr: &PktHdr, payload: &[u8]) {
        let per_pkt = self.payload_per_pkt();
        let mut dispatch: Option<(HandlerEntry, ReqHandle)> = None;
        let mut credit_return: Option<TxPkt> = None;
        {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(hdr.dest_session_num) else {
                warn!("request for unknown session {}", hdr.dest_session_num);
                return;
            };
            if sess.role != SessionRole::Server || !sess.is_connected() {
                warn!(
                    "request on session {} in state {}",
                    hdr.dest_session_num,
                    sess.state.name()
                );
                return;
            }
            if hdr.msg_size > self.config.max_msg_size {
                warn!("oversized request ({} bytes), dropped", hdr.msg_size);
                return;
            }
            let Some(idx) = sess.server_slot_for_req(hdr.req_num) else {
                trace!("stale request packet {}, dropped", hdr.req_num);
                return;
            };
            let remote_session_num = sess.remote_session_num;
            let route = sess.route.expect("connected session has route");

            let slot = &mut sess.slots[idx];
            if slot.is_free() {
                // First packet of a new request in this slot.
                let Ok(mut buf) = self.allocator.alloc(hdr.msg_size.max(1)) else {
                    warn!("no memory for {}-byte request, dropped", hdr.msg_size);
                    slot.reset();
                    return;
                };
                let _ = buf.resize(hdr.msg_size);
                slot.state = SSlotState::AwaitingResp;
                slot.info = SlotInfo::Server(ServerInfo {
                    req_type: hdr.req_type,
                    req_msgbuf: Some(buf),
                    req_size: hdr.msg_size,
                    req_num_pkts: PktHdr::calc_num_pkts(hdr.msg_size, self.mtu),
                    req_pkts_rcvd: 0,
                    resp_msgbuf: None,
                    resp_dyn: false,
                    resp_num_pkts: 0,
                    resp_comps_rcvd: 0,
                });
            }

            let server = slot.server();
            let offset = hdr.pkt_num as usize * per_pkt;
            if let Some(buf) = server.req_msgbuf.as_mut() {
                let end = (offset + payload.len()).min(buf.len());
                if offset < end {
                    buf.as_mut_slice()[offset..end]
                        .copy_from_slice(&payload[..end - offset]);
                }
            }
            server.req_pkts_rcvd += 1;

            if server.req_pkts_rcvd == server.req_num_pkts {
                let req_type = server.req_type;
                let Some(entry) = self.nexus.handler(req_type) else {
                    warn!("no handler for request type {req_type}, request dropped");
                    slot.reset();
                    return;
                };
                let req_msgbuf = server.req_msgbuf.take().expect("request buffer present");
                let Ok(pre_resp) = self.allocator.alloc(per_pkt) else {
                    warn!("no memory for response buffer, request dropped");
                    slot.reset();
                    return;
                };
                let req = ReqHandle {
                    session_num: hdr.dest_session_num,
                    sslot_idx: idx,
                    req_num: hdr.req_num,
                    req_type,
                    req_msgbuf,
                    pre_resp_msgbuf: pre_resp,
                    dyn_resp_msgbuf: None,
                    prealloc_used: true,
                };

                if entry.kind == HandlerKind::Background {
                    // The response may be a long time coming; hand the
                    // window space back to the client immediately.
                    let cr = PktHdr::new(
                        req_type,
                        0,
                        remote_session_num,
                        PktType::CreditReturn,
                        0,
                        hdr.req_num,
                    );
                    let mut bytes = vec![0u8; PKT_HDR_SIZE];
                    cr.write_to(&mut bytes);
                    credit_return = Some(TxPkt {
                        route,
                        tag: 0,
                        bytes,
                    });
                }
                dispatch = Some((entry, req));
            }
        }

        if let Some(pkt) = credit_return {
            self.tx_now(vec![pkt]);
        }
        if let Some((entry, req)) = dispatch {
            match (entry.kind, &self.bg_pool) {
                (HandlerKind::Background, Some(pool)) => {
                    pool.submit(BgWork {
                        handler: entry.func,
                        req,
                    });
                }
                (HandlerKind::Background, None) => {
                    warn!("background handler with no worker threads; running inline");
                    (entry.func)(self, req);
                }
                _ => (entry.func)(self, req),
            }
        }
    }

    fn handle_resp_pkt(&self, hdr: &PktHdr, payload: &[u8]) {
        let per_pkt = self.payload_per_pkt();
        let mut fire: Option<(Continuation, RespHandle, u64)> = None;
        let mut immediate = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(hdr.dest_session_num) else {
                trace!("response for unknown session {}", hdr.dest_session_num);
                return;
            };
            if sess.role != SessionRole::Client {
                warn!("response on server session {}", hdr.dest_session_num);
                return;
            }
            if hdr.msg_size > self.config.max_msg_size {
                warn!("oversized response ({} bytes), dropped", hdr.msg_size);
                return;
            }
            let Some(idx) = sess.slot_for_req(hdr.req_num) else {
                trace!("stale response packet {}, dropped", hdr.req_num);
                return;
            };
            let slot = &mut sess.slots[idx];
            if !matches!(
                slot.state,
                SSlotState::AwaitingResp | SSlotState::TxInProgress
            ) {
                trace!("duplicate response packet {}, dropped", hdr.req_num);
                return;
            }

            let client = slot.client();
            if client.resp.is_none() {
                let Ok(mut buf) = self.allocator.alloc(hdr.msg_size.max(1)) else {
                    warn!("no memory for {}-byte response, dropped", hdr.msg_size);
                    return;
                };
                let _ = buf.resize(hdr.msg_size);
                client.resp = Some(buf);
                client.resp_size = hdr.msg_size;
                client.resp_num_pkts = PktHdr::calc_num_pkts(hdr.msg_size, self.mtu);
                client.resp_pkts_rcvd = 0;
            }

            let offset = hdr.pkt_num as usize * per_pkt;
            if let Some(buf) = client.resp.as_mut() {
                let end = (offset + payload.len()).min(buf.len());
                if offset < end {
                    buf.as_mut_slice()[offset..end]
                        .copy_from_slice(&payload[..end - offset]);
                }
            }
            client.resp_pkts_rcvd += 1;

            if client.resp_pkts_rcvd == client.resp_num_pkts {
                let rtt_cycles = rdtsc().saturating_sub(client.tx_ts);
                let consumed = client.credits_consumed as usize;
                let already_returned = client.credits_returned;
                client.credits_returned = true;

                let cont = client.cont.take().expect("continuation fires once");
                let tag = client.tag;
                let resp_msgbuf = client.resp.take().expect("response buffer present");
                let req_msgbuf = client.req_msgbuf.take();
                slot.state = SSlotState::RespReceived;

                sess.cc.on_rtt(to_ns(rtt_cycles, self.freq_ghz) as u64);
                if !already_returned {
                    sess.credits += consumed;
                }
                let now = rdtsc();
                self.drain_stallq(sess, now, &mut immediate);

                fire = Some((
                    cont,
                    RespHandle {
                        session_num: hdr.dest_session_num,
                        req_num: hdr.req_num,
                        resp_msgbuf,
                        req_msgbuf,
                    },
                    tag,
                ));
            }
        }
        self.tx_now(immediate);
        if let Some((cont, resp, tag)) = fire {
            cont(self, resp, tag);
        }
    }

    fn handle_credit_return(&self, hdr: &PktHdr) {
        let mut immediate = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(hdr.dest_session_num) else {
                return;
            };
            if sess.role != SessionRole::Client {
                return;
            }
            let Some(idx) = sess.slot_for_req(hdr.req_num) else {
                return;
            };
            let client = sess.slots[idx].client();
            if client.credits_returned {
                return;
            }
            client.credits_returned = true;
            let consumed = client.credits_consumed as usize;
            sess.credits += consumed;
            trace!(
                "session {}: {consumed} credits returned early for request {}",
                hdr.dest_session_num,
                hdr.req_num
            );
            let now = rdtsc();
            self.drain_stallq(sess, now, &mut immediate);
        }
        self.tx_now(immediate);
    }

    fn release_response_inner(&self, resp: RespHandle) {
        let mut sessions = self.sessions.borrow_mut();
        if let Some(sess) = sessions.get_mut(resp.session_num) {
            if let Some(idx) = sess.slot_for_req(resp.req_num) {
                let slot = &mut sess.slots[idx];
                assert_eq!(
                    slot.state,
                    SSlotState::RespReceived,
                    "release_response on a slot with no delivered response"
                );
                slot.reset();
            }
        }
        // Response buffer (and any unclaimed request buffer) freed here.
    }

    // -----------------------------------------------------------------------
    // Session management processing
    // -----------------------------------------------------------------------

    fn notify_sm(&self, session_num: u16, kind: SmEventKind, error: Option<Error>) {
        let note = SmNotification {
            session_num,
            kind,
            error,
        };
        (self.sm_handler.borrow_mut())(&note);
    }

    fn remove_retry(&self, session_num: u16) {
        self.sm_retry
            .borrow_mut()
            .retain(|r| r.session_num != session_num);
    }

    fn process_sm_pkt(&self, pkt: SmPkt, from: SocketAddr) {
        match pkt.pkt_type {
            SmPktType::ConnectReq => self.sm_connect_req(pkt, from),
            SmPktType::ConnectResp => self.sm_connect_resp(pkt),
            SmPktType::DisconnectReq => self.sm_disconnect_req(pkt, from),
            SmPktType::DisconnectResp => self.sm_disconnect_resp(pkt),
        }
    }

    fn sm_connect_req(&self, pkt: SmPkt, from: SocketAddr) {
        let reply;
        {
            let mut sessions = self.sessions.borrow_mut();

            // Duplicate connect requests are answered idempotently: same
            // session, byte-identical response.
            let existing = sessions
                .iter()
                .find(|s| s.role == SessionRole::Server && s.remote_ep.same_client(&pkt.client))
                .map(|s| s.local_ep);
            if let Some(local_ep) = existing {
                reply = pkt.accept_resp(SmPktType::ConnectResp, local_ep);
            } else {
                let route = match self.transport.borrow_mut().resolve_route(&pkt.client.route) {
                    Ok(route) => route,
                    Err(_) => {
                        warn!("unresolvable route in connect request from {from}");
                        let _ = self
                            .nexus
                            .send_sm(&pkt.reject_resp(RejectReason::VersionMismatch), from);
                        return;
                    }
                };
                let Some(session_num) = sessions.alloc_session_num() else {
                    debug!("session table full, rejecting connect from {from}");
                    let _ = self
                        .nexus
                        .send_sm(&pkt.reject_resp(RejectReason::ResourceExhausted), from);
                    return;
                };
                let mut sess = Session::new(
                    SessionRole::Server,
                    SessionState::Connected,
                    session_num,
                    self.local_ep,
                    pkt.client,
                    self.config.req_window,
                    self.config.session_credits,
                    self.make_cc(),
                );
                sess.remote_session_num = pkt.client.session_num;
                sess.remote_sm_addr = Some(from);
                sess.route = Some(route);
                reply = pkt.accept_resp(SmPktType::ConnectResp, sess.local_ep);
                debug!(
                    "session {session_num}: accepted connect from {:?}",
                    pkt.client
                );
                sessions.insert(sess);
            }
        }
        let _ = self.nexus.send_sm(&reply, from);
    }

    fn sm_connect_resp(&self, pkt: SmPkt) {
        let num = pkt.client.session_num;
        let mut notify: Option<(SmEventKind, Option<Error>)> = None;
        let mut disconnect_req: Option<(SmPkt, SocketAddr)> = None;
        {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(num) else {
                trace!("connect response for unknown session {num}");
                return;
            };
            match (sess.state, pkt.accept) {
                (SessionState::ConnectInProgress, true) => {
                    match self.transport.borrow_mut().resolve_route(&pkt.server.route) {
                        Ok(route) => {
                            sess.remote_ep = pkt.server;
                            sess.remote_session_num = pkt.server.session_num;
                            sess.route = Some(route);
                            sess.state = SessionState::Connected;
                            debug!("session {num}: connected to {:?}", pkt.server);
                            notify = Some((SmEventKind::Connected, None));
                        }
                        Err(e) => {
                            sess.state = SessionState::Error;
                            notify = Some((SmEventKind::ConnectFailed, Some(e)));
                        }
                    }
                    self.remove_retry(num);
                }
                (SessionState::ConnectInProgress, false) => {
                    let reason = pkt
                        .reject_reason
                        .unwrap_or(RejectReason::ResourceExhausted);
                    sess.state = SessionState::Error;
                    debug!("session {num}: connect rejected ({reason:?})");
                    self.remove_retry(num);
                    notify = Some((SmEventKind::ConnectFailed, Some(Error::SmRejected(reason))));
                }
                (SessionState::DisconnectWaitForConnect, true) => {
                    // The connect went through after the user already gave up
                    // on the session; follow with the disconnect.
                    sess.remote_ep = pkt.server;
                    sess.remote_session_num = pkt.server.session_num;
                    sess.state = SessionState::DisconnectInProgress;
                    let dest = sess.remote_sm_addr.expect("session has SM address");
                    disconnect_req =
                        Some((SmPkt::disconnect_req(sess.local_ep, sess.remote_ep), dest));
                    let now = rdtsc();
                    for rec in self.sm_retry.borrow_mut().iter_mut() {
                        if rec.session_num == num {
                            rec.start_tsc = now;
                            rec.last_send_tsc = now;
                        }
                    }
                    debug!("session {num}: connect completed during teardown");
                }
                (SessionState::DisconnectWaitForConnect, false) => {
                    // Peer never had the session; teardown is already done.
                    sess.state = SessionState::Disconnected;
                    self.remove_retry(num);
                    sessions.remove(num);
                    notify = Some((SmEventKind::Disconnected, None));
                }
                _ => {
                    trace!("duplicate connect response for session {num}, ignored");
                }
            }
        }
        if let Some((pkt, dest)) = disconnect_req {
            let _ = self.nexus.send_sm(&pkt, dest);
        }
        if let Some((kind, error)) = notify {
            self.notify_sm(num, kind, error);
        }
    }

    fn sm_disconnect_req(&self, pkt: SmPkt, from: SocketAddr) {
        let reply;
        {
            let mut sessions = self.sessions.borrow_mut();
            let found = sessions
                .iter()
                .find(|s| s.role == SessionRole::Server && s.remote_ep.same_client(&pkt.client))
                .map(|s| (s.local_session_num, s.local_ep));
            match found {
                Some((num, local_ep)) => {
                    sessions.remove(num);
                    debug!("session {num}: torn down by {:?}", pkt.client);
                    reply = pkt.accept_resp(SmPktType::DisconnectResp, local_ep);
                }
                None => {
                    // Duplicate disconnect; answer it anyway.
                    reply = pkt.accept_resp(SmPktType::DisconnectResp, pkt.server);
                }
            }
        }
        let _ = self.nexus.send_sm(&reply, from);
    }

    fn sm_disconnect_resp(&self, pkt: SmPkt) {
        let num = pkt.client.session_num;
        let mut notify: Option<Option<Error>> = None;
        {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(num) else {
                return;
            };
            if sess.state != SessionState::DisconnectInProgress {
                trace!("unexpected disconnect response for session {num}, ignored");
                return;
            }
            sess.state = SessionState::Disconnected;
            let aborted = sess.aborted_rpcs;
            self.remove_retry(num);
            sessions.remove(num);
            debug!("session {num}: disconnected ({aborted} RPCs aborted)");
            notify = Some((aborted > 0).then(|| Error::SessionDisconnected(num)));
        }
        if let Some(error) = notify {
            self.notify_sm(num, SmEventKind::Disconnected, error);
        }
    }

    /// Scan the retry set: retransmit overdue handshakes, fail hopeless ones.
    ///
    /// Records added during this tick are left for the next one; no record is
    /// retransmitted twice per tick.
    fn scan_sm_retry(&self) {
        let now = rdtsc();
        let snapshot_len = self.sm_retry.borrow().len();
        let mut notifications: Vec<(u16, SmEventKind, Option<Error>)> = Vec::new();
        let mut expired: Vec<u16> = Vec::new();

        for i in 0..snapshot_len {
            let rec = self.sm_retry.borrow()[i];
            let num = rec.session_num;
            let total_ms = to_ms(now.saturating_sub(rec.start_tsc), self.freq_ghz);
            let since_send_ms = to_ms(now.saturating_sub(rec.last_send_tsc), self.freq_ghz);

            let mut resend: Option<(SmPkt, SocketAddr)> = None;
            {
                let mut sessions = self.sessions.borrow_mut();
                let Some(sess) = sessions.get_mut(num) else {
                    expired.push(num);
                    continue;
                };
                debug_assert!(sess.state.needs_retry());

                if total_ms > self.config.sm_timeout_ms as f64 {
                    let was_connecting = sess.state == SessionState::ConnectInProgress;
                    if was_connecting {
                        sess.state = SessionState::Error;
                        warn!("session {num}: connect timed out");
                        notifications.push((
                            num,
                            SmEventKind::ConnectFailed,
                            Some(Error::SmTimeout(num)),
                        ));
                    } else {
                        sess.state = SessionState::Disconnected;
                        warn!("session {num}: disconnect timed out");
                        sessions.remove(num);
                        notifications.push((
                            num,
                            SmEventKind::Disconnected,
                            Some(Error::SmTimeout(num)),
                        ));
                    }
                    expired.push(num);
                } else if since_send_ms > self.config.sm_retrans_ms as f64 {
                    let dest = sess.remote_sm_addr.expect("session has SM address");
                    let pkt = match sess.state {
                        SessionState::ConnectInProgress
                        | SessionState::DisconnectWaitForConnect => {
                            SmPkt::connect_req(sess.local_ep, sess.remote_ep)
                        }
                        _ => SmPkt::disconnect_req(sess.local_ep, sess.remote_ep),
                    };
                    debug!("session {num}: retransmitting {:?}", pkt.pkt_type);
                    resend = Some((pkt, dest));
                }
            }
            if let Some((pkt, dest)) = resend {
                let _ = self.nexus.send_sm(&pkt, dest);
                self.sm_retry.borrow_mut()[i].last_send_tsc = now;
            }
        }

        if !expired.is_empty() {
            self.sm_retry
                .borrow_mut()
                .retain(|r| !expired.contains(&r.session_num));
        }
        for (num, kind, error) in notifications {
            self.notify_sm(num, kind, error);
        }
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    /// Advance every subsystem once. Non-blocking; always returns.
    pub fn progress(&self) {
        // Data-plane RX: deliver completions to the engine.
        let mut rx: Vec<RxPkt> = Vec::new();
        self.transport.borrow_mut().rx_burst(&mut rx);
        for pkt in &rx {
            self.process_data_pkt(&pkt.bytes);
        }

        // Background completions: finish deferred endpoint mutations.
        while let Ok(comp) = self.bg_comp_rx.try_recv() {
            match comp {
                BgCompletion::Response(req) => self.enqueue_response_inner(req),
                BgCompletion::Request {
                    session,
                    req_type,
                    req_msgbuf,
                    cont,
                    tag,
                } => {
                    if let Err(e) =
                        self.enqueue_request_inner(session, req_type, req_msgbuf, cont, tag)
                    {
                        warn!("deferred request on session {} failed: {e}", session.0);
                    }
                }
                BgCompletion::Release(resp) => self.release_response_inner(resp),
            }
        }

        // Pacing: release due packets to the transport.
        let now = rdtsc();
        let mut due = Vec::new();
        {
            let mut wheel = self.wheel.borrow_mut();
            wheel.reap(now);
            wheel.drain_ready(&mut due);
        }
        self.tx_now(due);
        {
            let mut transport = self.transport.borrow_mut();
            transport.tx_flush();
            let mut comps = Vec::new();
            transport.poll_tx(&mut comps);
            drop(transport);
            for comp in comps {
                self.finish_resp_tx(comp);
            }
        }

        // Session management: drain the bootstrap socket, step the machine.
        self.nexus.drain_sm();
        while let Ok((pkt, from)) = self.sm_inbox.try_recv() {
            self.process_sm_pkt(pkt, from);
        }

        // Retransmit expired handshakes.
        if !self.sm_retry.borrow().is_empty() {
            self.scan_sm_retry();
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Number of handshakes awaiting a peer reply.
    pub fn pending_handshakes(&self) -> usize {
        self.sm_retry.borrow().len()
    }

    /// True if the session's handshake is being retried.
    pub fn in_retry_set(&self, handle: SessionHandle) -> bool {
        self.sm_retry
            .borrow()
            .iter()
            .any(|r| r.session_num == handle.session_num())
    }

    /// Current state of a session, if it still exists.
    pub fn session_state(&self, handle: SessionHandle) -> Option<SessionState> {
        self.sessions
            .borrow()
            .get(handle.session_num())
            .map(|s| s.state)
    }

    /// Free request slots in a session's window.
    pub fn free_slots(&self, handle: SessionHandle) -> Option<usize> {
        self.sessions
            .borrow()
            .get(handle.session_num())
            .map(|s| s.free_slots())
    }

    /// Occupied request slots in a session's window.
    pub fn active_slots(&self, handle: SessionHandle) -> Option<usize> {
        self.sessions
            .borrow()
            .get(handle.session_num())
            .map(|s| s.active_slots())
    }
}

impl RpcContext for Rpc {
    fn alloc_msg_buffer(&self, max_size: usize) -> Result<MsgBuffer> {
        if max_size > self.config.max_msg_size {
            return Err(Error::MsgTooLarge {
                size: max_size,
                max: self.config.max_msg_size,
            });
        }
        self.allocator.alloc(max_size)
    }

    fn free_msg_buffer(&self, buf: MsgBuffer) {
        self.allocator.free(buf);
    }

    fn enqueue_request(
        &self,
        session: SessionHandle,
        req_type: u8,
        req_msgbuf: MsgBuffer,
        cont: Continuation,
        tag: u64,
    ) -> Result<()> {
        self.enqueue_request_inner(session, req_type, req_msgbuf, cont, tag)
    }

    fn enqueue_response(&self, req: ReqHandle) {
        self.enqueue_response_inner(req);
    }

    fn release_response(&self, resp: RespHandle) {
        self.release_response_inner(resp);
    }

    fn in_background(&self) -> bool {
        background::in_background()
    }
}

impl Drop for Rpc {
    fn drop(&mut self) {
        self.nexus.unregister_endpoint(self.id);
    }
}
