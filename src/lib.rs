//! # pacerpc - paced RPC for datacenter networks
//!
//! A user-space RPC runtime for kernel-bypass transports. Applications
//! register request handlers, open sessions to peers, and submit
//! fixed-window asynchronous request/response exchanges. Each endpoint
//! multiplexes many concurrent RPCs per transport connection, paces packet
//! injection through a timing wheel, and delivers responses via
//! continuations.
//!
//! ## Features
//!
//! - **Sessioned request windows**: a fixed window of concurrent requests
//!   per session, with stale-response rejection on slot reuse
//! - **UDP-bootstrapped session management**: connect/disconnect handshakes
//!   with timeout-driven retransmission
//! - **Credit-based flow control**: bounds in-flight data packets per session
//! - **Paced transmission**: a timing wheel releases packets at deadlines
//!   chosen by a congestion controller (Timely included)
//! - **Foreground and background handlers**: run inline on the endpoint
//!   thread or on a worker pool
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use pacerpc::{HandlerKind, Nexus, Rpc, RpcConfig, SimNet};
//!
//! let nexus = Arc::new(Nexus::new("127.0.0.1", 31850)?);
//! nexus.register_handler(1, HandlerKind::FgTerminal, |ctx, mut req| {
//!     // Echo the request back.
//!     let len = req.req_msgbuf().len();
//!     req.pre_resp_msgbuf.resize(len).unwrap();
//!     let data = req.req_msgbuf().as_slice().to_vec();
//!     req.pre_resp_msgbuf.as_mut_slice().copy_from_slice(&data);
//!     ctx.enqueue_response(req);
//! })?;
//!
//! let net = SimNet::new();
//! let rpc = Rpc::new(
//!     nexus.clone(),
//!     0,
//!     Box::new(net.attach(4096)),
//!     Box::new(|note| println!("sm event: {note:?}")),
//!     RpcConfig::default(),
//! )?;
//!
//! let session = rpc.open_session("remote-host", 31850, 0)?;
//! loop {
//!     rpc.progress();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: endpoint configuration (`RpcConfig`)
//! - [`error`]: error types (`Error`, `RejectReason`)
//! - [`timing`]: TSC clock and calibrated frequency measurement
//! - [`packet`]: data-plane packet header (`PktHdr`)
//! - [`buffer`]: message buffers (`MsgBuffer`, `MsgAllocator`)
//! - [`wheel`]: the pacing timing wheel (`TimingWheel`)
//! - [`cc`]: congestion control seam (`CongestionControl`, `Timely`)
//! - [`transport`]: transport seam (`Transport`) and in-process `SimNet`
//! - [`sm`]: session management wire format and notifications
//! - [`nexus`]: process-wide registry (`Nexus`)
//! - [`session`]: sessions and request slots
//! - [`background`]: background worker pool
//! - [`rpc`]: the endpoint (`Rpc`)

pub mod background;
pub mod buffer;
pub mod cc;
pub mod config;
pub mod error;
pub mod nexus;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod timing;
pub mod transport;
pub mod wheel;

// Re-export main types
pub use buffer::{MsgAllocator, MsgBuffer};
pub use cc::{CongestionControl, Timely, Unpaced};
pub use config::RpcConfig;
pub use error::{Error, RejectReason, Result};
pub use nexus::{HandlerKind, Nexus};
pub use packet::{PktHdr, PktType, PKT_HDR_SIZE};
pub use rpc::{Continuation, ReqHandle, RespHandle, Rpc, RpcContext};
pub use session::{SSlotState, SessionHandle, SessionRole, SessionState};
pub use sm::{SmEventKind, SmHandler, SmNotification};
pub use transport::{RxPkt, SimNet, SimTransport, Transport, TxCompletion, TxPkt};
pub use wheel::{TimingWheel, WheelArgs};
