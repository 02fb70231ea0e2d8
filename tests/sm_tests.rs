//! Session management tests.
//!
//! These drive the handshake state machine at the wire level: a bare UDP
//! socket plays the peer, so tests can drop, delay, and duplicate individual
//! handshake packets.

mod common;

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pacerpc::sm::{SmEndpoint, SmPkt, SmPktType};
use pacerpc::transport::Transport;
use pacerpc::{
    HandlerKind, RejectReason, ReqHandle, RpcConfig, RpcContext, SessionState, SimNet,
    SimTransport, SmEventKind,
};

use common::{connect, pump_until, TestEndpoint};

const MTU: usize = 1024;

fn fast_sm_config() -> RpcConfig {
    RpcConfig::default().with_sm_retrans_ms(5).with_sm_timeout_ms(5000)
}

/// A scripted handshake peer: a bare UDP socket plus a parked transport
/// attachment so its advertised route resolves.
struct FakePeer {
    socket: UdpSocket,
    transport: SimTransport,
}

impl FakePeer {
    fn new(net: &SimNet) -> Self {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        socket.set_nonblocking(true).unwrap();
        Self {
            socket,
            transport: net.attach(MTU),
        }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    /// Our descriptor as it would appear in handshake replies.
    fn endpoint(&self, ep_id: u8, session_num: u16) -> SmEndpoint {
        let mut ep = SmEndpoint::new("127.0.0.1", self.port(), ep_id).unwrap();
        ep.session_num = session_num;
        ep.route = self.transport.local_route();
        ep
    }

    fn try_recv(&self) -> Option<(SmPkt, std::net::SocketAddr)> {
        let mut buf = [0u8; 2048];
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => SmPkt::from_bytes(&buf[..len]).map(|pkt| (pkt, from)),
            Err(_) => None,
        }
    }

    /// Pump `ep` until this peer receives a packet of `want` type.
    fn recv_pumping(&self, ep: &TestEndpoint, want: SmPktType) -> (SmPkt, std::net::SocketAddr) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            ep.rpc.progress();
            if let Some((pkt, from)) = self.try_recv() {
                if pkt.pkt_type == want {
                    return (pkt, from);
                }
            }
            assert!(Instant::now() < deadline, "never received {want:?}");
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    fn send(&self, pkt: &SmPkt, dest: std::net::SocketAddr) {
        self.socket.send_to(&pkt.serialize(), dest).unwrap();
    }
}

// =============================================================================
// Client-side handshake
// =============================================================================

#[test]
fn test_connect_retransmission_and_duplicate_resp() {
    let net = SimNet::new();
    let peer = FakePeer::new(&net);
    let client = TestEndpoint::new(&net, 0, MTU, fast_sm_config());

    let session = client
        .rpc
        .open_session("127.0.0.1", peer.port(), 7)
        .unwrap();
    assert_eq!(
        client.rpc.session_state(session),
        Some(SessionState::ConnectInProgress)
    );
    assert!(client.rpc.in_retry_set(session));

    // Ignore the first connect request; the client must resend an identical
    // one after the retransmission interval.
    let (first, from) = peer.recv_pumping(&client, SmPktType::ConnectReq);
    let (second, _) = peer.recv_pumping(&client, SmPktType::ConnectReq);
    assert_eq!(first.serialize(), second.serialize());

    // Accept, twice: the duplicate response must be ignored.
    let resp = second.accept_resp(SmPktType::ConnectResp, peer.endpoint(7, 42));
    peer.send(&resp, from);
    peer.send(&resp, from);

    let ok = pump_until(&[&client], Duration::from_secs(5), || {
        client.sm_log.count(session, SmEventKind::Connected) == 1
    });
    assert!(ok, "never connected");
    assert_eq!(
        client.rpc.session_state(session),
        Some(SessionState::Connected)
    );
    assert!(!client.rpc.in_retry_set(session));
    assert_eq!(client.rpc.pending_handshakes(), 0);

    // Exactly one transition, exactly one notification.
    for _ in 0..50 {
        client.rpc.progress();
    }
    assert_eq!(client.sm_log.count(session, SmEventKind::Connected), 1);
}

#[test]
fn test_destroy_during_connect() {
    let net = SimNet::new();
    let peer = FakePeer::new(&net);
    let client = TestEndpoint::new(&net, 0, MTU, fast_sm_config());

    let session = client
        .rpc
        .open_session("127.0.0.1", peer.port(), 7)
        .unwrap();
    client.rpc.destroy_session(session).unwrap();
    assert_eq!(
        client.rpc.session_state(session),
        Some(SessionState::DisconnectWaitForConnect)
    );
    // Still retrying the connect so the peer can be torn down cleanly.
    assert!(client.rpc.in_retry_set(session));

    let (req, from) = peer.recv_pumping(&client, SmPktType::ConnectReq);
    peer.send(
        &req.accept_resp(SmPktType::ConnectResp, peer.endpoint(7, 42)),
        from,
    );

    // The accept flips the session into the disconnect handshake.
    let (dreq, dfrom) = peer.recv_pumping(&client, SmPktType::DisconnectReq);
    assert_eq!(
        client.rpc.session_state(session),
        Some(SessionState::DisconnectInProgress)
    );
    peer.send(
        &dreq.accept_resp(SmPktType::DisconnectResp, peer.endpoint(7, 42)),
        dfrom,
    );

    let ok = pump_until(&[&client], Duration::from_secs(5), || {
        client.sm_log.count(session, SmEventKind::Disconnected) == 1
    });
    assert!(ok, "never disconnected");

    // One disconnect notification, no connect notification, session gone.
    assert_eq!(client.sm_log.count(session, SmEventKind::Connected), 0);
    assert_eq!(client.rpc.session_state(session), None);
    assert_eq!(client.rpc.pending_handshakes(), 0);
}

#[test]
fn test_connect_timeout() {
    let net = SimNet::new();
    let peer = FakePeer::new(&net);
    let config = RpcConfig::default().with_sm_retrans_ms(5).with_sm_timeout_ms(50);
    let client = TestEndpoint::new(&net, 0, MTU, config);

    let session = client
        .rpc
        .open_session("127.0.0.1", peer.port(), 7)
        .unwrap();

    // Count the retransmissions while never answering.
    let mut reqs = 0;
    let ok = pump_until(&[&client], Duration::from_secs(5), || {
        if peer.try_recv().is_some() {
            reqs += 1;
        }
        client.sm_log.count(session, SmEventKind::ConnectFailed) == 1
    });
    assert!(ok, "connect never timed out");
    assert!(reqs >= 2, "expected retransmissions, saw {reqs} requests");
    assert!(client.sm_log.had_error(session, SmEventKind::ConnectFailed));
    assert_eq!(client.rpc.session_state(session), Some(SessionState::Error));
    assert!(!client.rpc.in_retry_set(session));
}

#[test]
fn test_connect_rejected() {
    let net = SimNet::new();
    let peer = FakePeer::new(&net);
    let client = TestEndpoint::new(&net, 0, MTU, fast_sm_config());

    let session = client
        .rpc
        .open_session("127.0.0.1", peer.port(), 7)
        .unwrap();

    let (req, from) = peer.recv_pumping(&client, SmPktType::ConnectReq);
    peer.send(&req.reject_resp(RejectReason::ResourceExhausted), from);

    let ok = pump_until(&[&client], Duration::from_secs(5), || {
        client.sm_log.count(session, SmEventKind::ConnectFailed) == 1
    });
    assert!(ok, "reject never surfaced");
    assert!(client.sm_log.had_error(session, SmEventKind::ConnectFailed));
    assert_eq!(client.rpc.session_state(session), Some(SessionState::Error));
}

// =============================================================================
// Server-side handshake
// =============================================================================

#[test]
fn test_duplicate_connect_req_idempotent() {
    let net = SimNet::new();
    let fake_client = FakePeer::new(&net);
    let server = TestEndpoint::new(&net, 4, MTU, RpcConfig::default());

    let client_ep = fake_client.endpoint(9, 3);
    let server_ep = SmEndpoint::new("127.0.0.1", server.nexus.sm_port(), 4).unwrap();
    let req = SmPkt::connect_req(client_ep, server_ep);
    let dest: std::net::SocketAddr =
        format!("127.0.0.1:{}", server.nexus.sm_port()).parse().unwrap();

    fake_client.send(&req, dest);
    let (resp1, _) = fake_client.recv_pumping(&server, SmPktType::ConnectResp);
    assert!(resp1.accept);
    assert_eq!(server.rpc.active_sessions(), 1);

    // The duplicate request is answered with byte-identical bytes and no
    // second session.
    fake_client.send(&req, dest);
    let (resp2, _) = fake_client.recv_pumping(&server, SmPktType::ConnectResp);
    assert_eq!(resp1.serialize(), resp2.serialize());
    assert_eq!(server.rpc.active_sessions(), 1);

    // Teardown is idempotent the same way.
    let dreq = SmPkt::disconnect_req(client_ep, resp1.server);
    fake_client.send(&dreq, dest);
    let (dresp1, _) = fake_client.recv_pumping(&server, SmPktType::DisconnectResp);
    assert!(dresp1.accept);
    assert_eq!(server.rpc.active_sessions(), 0);

    fake_client.send(&dreq, dest);
    let (dresp2, _) = fake_client.recv_pumping(&server, SmPktType::DisconnectResp);
    assert!(dresp2.accept);
}

// =============================================================================
// Teardown with in-flight RPCs
// =============================================================================

#[test]
fn test_destroy_connected_drains_slots() {
    let net = SimNet::new();
    let server = TestEndpoint::new(&net, 0, MTU, fast_sm_config());
    let client = TestEndpoint::new(&net, 0, MTU, fast_sm_config());

    // A handler that never responds keeps the client slot in flight.
    let parked: Arc<Mutex<Vec<ReqHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let parked_h = parked.clone();
    server
        .nexus
        .register_handler(1, HandlerKind::FgTerminal, move |_ctx, req| {
            parked_h.lock().unwrap().push(req);
        })
        .unwrap();

    let session = connect(&client, &server);

    let fired = Arc::new(AtomicBool::new(false));
    let fired_cl = fired.clone();
    let req = client.rpc.alloc_msg_buffer(64).unwrap();
    client
        .rpc
        .enqueue_request(
            session,
            1,
            req,
            Box::new(move |_ctx, _resp, _tag| {
                fired_cl.store(true, Ordering::SeqCst);
            }),
            0,
        )
        .unwrap();

    // Let the request reach the server.
    pump_until(&[&client, &server], Duration::from_secs(1), || {
        !parked.lock().unwrap().is_empty()
    });
    assert_eq!(client.rpc.active_slots(session), Some(1));

    client.rpc.destroy_session(session).unwrap();
    let ok = pump_until(&[&client, &server], Duration::from_secs(5), || {
        client.sm_log.count(session, SmEventKind::Disconnected) == 1
    });
    assert!(ok, "never disconnected");

    // The aborted RPC surfaces through the notification, not the
    // continuation.
    assert!(!fired.load(Ordering::SeqCst));
    assert!(client.sm_log.had_error(session, SmEventKind::Disconnected));
    assert_eq!(client.rpc.session_state(session), None);
}
