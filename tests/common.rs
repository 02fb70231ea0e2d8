//! Common test utilities for pacerpc integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use pacerpc::{
    Nexus, Rpc, RpcConfig, SessionHandle, SimNet, SmEventKind, SmNotification,
};

/// Install the test log subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// SM notifications recorded by a test endpoint.
#[derive(Clone, Default)]
pub struct SmLog {
    events: Arc<Mutex<Vec<(u16, SmEventKind, bool)>>>,
}

impl SmLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, note: &SmNotification) {
        self.events
            .lock()
            .unwrap()
            .push((note.session_num, note.kind, note.error.is_some()));
    }

    /// Number of notifications of `kind` for `session`.
    pub fn count(&self, session: SessionHandle, kind: SmEventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(num, k, _)| *num == session.session_num() && *k == kind)
            .count()
    }

    /// True if the notification of `kind` carried a diagnostic error.
    pub fn had_error(&self, session: SessionHandle, kind: SmEventKind) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|(num, k, err)| *num == session.session_num() && *k == kind && *err)
    }

    pub fn total(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

/// One simulated process: a Nexus plus a single endpoint.
pub struct TestEndpoint {
    pub nexus: Arc<Nexus>,
    pub rpc: Rpc,
    pub sm_log: SmLog,
}

impl TestEndpoint {
    /// Build an endpoint on `net` with its own Nexus (ephemeral SM port).
    pub fn new(net: &SimNet, ep_id: u8, mtu: usize, config: RpcConfig) -> Self {
        Self::with_nexus(
            Arc::new(Nexus::new("127.0.0.1", 0).expect("bind nexus")),
            net,
            ep_id,
            mtu,
            config,
        )
    }

    /// Build an endpoint on an existing Nexus.
    pub fn with_nexus(
        nexus: Arc<Nexus>,
        net: &SimNet,
        ep_id: u8,
        mtu: usize,
        config: RpcConfig,
    ) -> Self {
        init_tracing();
        let sm_log = SmLog::new();
        let log = sm_log.clone();
        let rpc = Rpc::new(
            nexus.clone(),
            ep_id,
            Box::new(net.attach(mtu)),
            Box::new(move |note| log.record(note)),
            config,
        )
        .expect("create rpc");
        Self { nexus, rpc, sm_log }
    }

    /// Open a session to another test endpoint.
    pub fn open_session_to(&self, peer: &TestEndpoint) -> SessionHandle {
        self.rpc
            .open_session(peer.nexus.hostname(), peer.nexus.sm_port(), peer.rpc.id())
            .expect("open session")
    }
}

/// Tick every endpoint until `pred` holds or `timeout` passes.
pub fn pump_until(
    endpoints: &[&TestEndpoint],
    timeout: Duration,
    mut pred: impl FnMut() -> bool,
) -> bool {
    let start = Instant::now();
    loop {
        for ep in endpoints {
            ep.rpc.progress();
        }
        if pred() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_micros(50));
    }
}

/// Connect `client` to `server`, panicking if the handshake does not finish.
pub fn connect(client: &TestEndpoint, server: &TestEndpoint) -> SessionHandle {
    let session = client.open_session_to(server);
    let ok = pump_until(&[client, server], Duration::from_secs(5), || {
        client.sm_log.count(session, SmEventKind::Connected) == 1
    });
    assert!(ok, "session never connected");
    session
}
