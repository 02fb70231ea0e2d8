//! Session management wire format and notifications.
//!
//! Handshake packets travel over UDP to the peer's bootstrap port. Each is a
//! fixed-layout little-endian record carrying both endpoint descriptors;
//! there is no version field, so incompatible peers surface as rejected or
//! dropped handshakes.

use crate::error::{Error, RejectReason};
use crate::transport::{RouteBytes, ROUTE_BYTES_LEN};

/// Magic number for session management packets.
pub const SM_MAGIC: u8 = 0x5C;

/// Maximum hostname length carried on the wire, NUL-padded.
pub const SM_HOSTNAME_LEN: usize = 64;

/// Serialized size of one endpoint descriptor.
const SM_ENDPOINT_SIZE: usize = SM_HOSTNAME_LEN + 2 + 1 + 2 + ROUTE_BYTES_LEN;

/// Serialized size of a session management packet.
pub const SM_PKT_SIZE: usize = 4 + 2 * SM_ENDPOINT_SIZE;

/// Session management packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktType {
    ConnectReq = 1,
    ConnectResp = 2,
    DisconnectReq = 3,
    DisconnectResp = 4,
}

impl SmPktType {
    fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(SmPktType::ConnectReq),
            2 => Some(SmPktType::ConnectResp),
            3 => Some(SmPktType::DisconnectReq),
            4 => Some(SmPktType::DisconnectResp),
            _ => None,
        }
    }
}

/// One side of a session: bootstrap identity plus transport routing info.
#[derive(Clone, Copy)]
pub struct SmEndpoint {
    /// NUL-padded hostname.
    pub hostname: [u8; SM_HOSTNAME_LEN],
    /// UDP bootstrap port.
    pub sm_port: u16,
    /// Endpoint id within the peer process.
    pub ep_id: u8,
    /// Session number assigned by this side.
    pub session_num: u16,
    /// Transport routing info, opaque to session management.
    pub route: RouteBytes,
}

impl SmEndpoint {
    /// Create a descriptor. Fails if the hostname does not fit on the wire.
    pub fn new(hostname: &str, sm_port: u16, ep_id: u8) -> crate::error::Result<Self> {
        let bytes = hostname.as_bytes();
        if bytes.is_empty() || bytes.len() > SM_HOSTNAME_LEN {
            return Err(Error::Resolve(hostname.to_string()));
        }
        let mut buf = [0u8; SM_HOSTNAME_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            hostname: buf,
            sm_port,
            ep_id,
            session_num: 0,
            route: [0u8; ROUTE_BYTES_LEN],
        })
    }

    /// The hostname as a string slice.
    pub fn hostname_str(&self) -> &str {
        let end = self
            .hostname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SM_HOSTNAME_LEN);
        std::str::from_utf8(&self.hostname[..end]).unwrap_or("")
    }

    /// Identity used for duplicate-handshake detection on the server.
    pub fn same_client(&self, other: &SmEndpoint) -> bool {
        self.hostname == other.hostname
            && self.ep_id == other.ep_id
            && self.session_num == other.session_num
    }

    fn write_to(&self, dst: &mut [u8]) {
        dst[..SM_HOSTNAME_LEN].copy_from_slice(&self.hostname);
        dst[64..66].copy_from_slice(&self.sm_port.to_le_bytes());
        dst[66] = self.ep_id;
        dst[67..69].copy_from_slice(&self.session_num.to_le_bytes());
        dst[69..69 + ROUTE_BYTES_LEN].copy_from_slice(&self.route);
    }

    fn from_bytes(src: &[u8]) -> Self {
        let mut hostname = [0u8; SM_HOSTNAME_LEN];
        hostname.copy_from_slice(&src[..SM_HOSTNAME_LEN]);
        let mut route = [0u8; ROUTE_BYTES_LEN];
        route.copy_from_slice(&src[69..69 + ROUTE_BYTES_LEN]);
        Self {
            hostname,
            sm_port: u16::from_le_bytes([src[64], src[65]]),
            ep_id: src[66],
            session_num: u16::from_le_bytes([src[67], src[68]]),
            route,
        }
    }
}

impl std::fmt::Debug for SmEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/ep{}/sess{}",
            self.hostname_str(),
            self.sm_port,
            self.ep_id,
            self.session_num
        )
    }
}

/// A session management packet.
#[derive(Debug, Clone, Copy)]
pub struct SmPkt {
    pub pkt_type: SmPktType,
    pub accept: bool,
    pub reject_reason: Option<RejectReason>,
    pub client: SmEndpoint,
    pub server: SmEndpoint,
}

impl SmPkt {
    /// Build a connect request from the client's view of both sides.
    pub fn connect_req(client: SmEndpoint, server: SmEndpoint) -> Self {
        Self {
            pkt_type: SmPktType::ConnectReq,
            accept: false,
            reject_reason: None,
            client,
            server,
        }
    }

    /// Build a disconnect request; mirrors the connect request layout.
    pub fn disconnect_req(client: SmEndpoint, server: SmEndpoint) -> Self {
        Self {
            pkt_type: SmPktType::DisconnectReq,
            accept: false,
            reject_reason: None,
            client,
            server,
        }
    }

    /// Build the accepting response to a request.
    pub fn accept_resp(&self, resp_type: SmPktType, server: SmEndpoint) -> Self {
        Self {
            pkt_type: resp_type,
            accept: true,
            reject_reason: None,
            client: self.client,
            server,
        }
    }

    /// Build a rejecting connect response.
    pub fn reject_resp(&self, reason: RejectReason) -> Self {
        Self {
            pkt_type: SmPktType::ConnectResp,
            accept: false,
            reject_reason: Some(reason),
            client: self.client,
            server: self.server,
        }
    }

    /// Serialize to wire bytes.
    pub fn serialize(&self) -> [u8; SM_PKT_SIZE] {
        let mut buf = [0u8; SM_PKT_SIZE];
        buf[0] = SM_MAGIC;
        buf[1] = self.pkt_type as u8;
        buf[2] = self.accept as u8;
        buf[3] = self.reject_reason.map_or(0, |r| r as u8);
        self.client.write_to(&mut buf[4..4 + SM_ENDPOINT_SIZE]);
        self.server
            .write_to(&mut buf[4 + SM_ENDPOINT_SIZE..4 + 2 * SM_ENDPOINT_SIZE]);
        buf
    }

    /// Parse wire bytes. Returns `None` for short, mismatched, or unknown
    /// packets; callers drop those.
    pub fn from_bytes(src: &[u8]) -> Option<Self> {
        if src.len() < SM_PKT_SIZE || src[0] != SM_MAGIC {
            return None;
        }
        let pkt_type = SmPktType::from_wire(src[1])?;
        let accept = src[2] != 0;
        let reject_reason = if src[3] == 0 {
            None
        } else {
            Some(RejectReason::from_wire(src[3])?)
        };
        Some(Self {
            pkt_type,
            accept,
            reject_reason,
            client: SmEndpoint::from_bytes(&src[4..4 + SM_ENDPOINT_SIZE]),
            server: SmEndpoint::from_bytes(
                &src[4 + SM_ENDPOINT_SIZE..4 + 2 * SM_ENDPOINT_SIZE],
            ),
        })
    }

    /// Endpoint id this packet should be routed to on the receiving process.
    pub fn dest_ep_id(&self) -> u8 {
        match self.pkt_type {
            SmPktType::ConnectReq | SmPktType::DisconnectReq => self.server.ep_id,
            SmPktType::ConnectResp | SmPktType::DisconnectResp => self.client.ep_id,
        }
    }
}

/// What happened to a session, delivered through the endpoint's SM handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventKind {
    /// The connect handshake completed.
    Connected,
    /// The connect handshake failed; the session is dead.
    ConnectFailed,
    /// The session has been torn down.
    Disconnected,
}

/// A session management notification.
#[derive(Debug)]
pub struct SmNotification {
    pub session_num: u16,
    pub kind: SmEventKind,
    /// Diagnostic for failures; `None` on clean transitions.
    pub error: Option<Error>,
}

/// User callback for session management notifications.
pub type SmHandler = Box<dyn FnMut(&SmNotification)>;

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(host: &str, port: u16, id: u8, sess: u16) -> SmEndpoint {
        let mut e = SmEndpoint::new(host, port, id).unwrap();
        e.session_num = sess;
        e
    }

    #[test]
    fn test_sm_pkt_roundtrip() {
        let mut client = ep("client.example", 3100, 2, 7);
        client.route[0] = 0xAA;
        let server = ep("server.example", 3200, 5, 9);

        let pkt = SmPkt::connect_req(client, server);
        let bytes = pkt.serialize();
        let back = SmPkt::from_bytes(&bytes).unwrap();

        assert_eq!(back.pkt_type, SmPktType::ConnectReq);
        assert!(!back.accept);
        assert_eq!(back.client.hostname_str(), "client.example");
        assert_eq!(back.client.session_num, 7);
        assert_eq!(back.client.route[0], 0xAA);
        assert_eq!(back.server.hostname_str(), "server.example");
        assert_eq!(back.dest_ep_id(), 5);
    }

    #[test]
    fn test_resp_routing_and_reject() {
        let client = ep("c", 1, 2, 3);
        let server = ep("s", 4, 5, 6);
        let req = SmPkt::connect_req(client, server);

        let resp = req.reject_resp(RejectReason::ResourceExhausted);
        let back = SmPkt::from_bytes(&resp.serialize()).unwrap();
        assert!(!back.accept);
        assert_eq!(back.reject_reason, Some(RejectReason::ResourceExhausted));
        assert_eq!(back.dest_ep_id(), 2);
    }

    #[test]
    fn test_malformed_dropped() {
        assert!(SmPkt::from_bytes(&[0u8; 10]).is_none());

        let pkt = SmPkt::connect_req(ep("a", 1, 1, 1), ep("b", 2, 2, 2));
        let mut bytes = pkt.serialize();
        bytes[0] = 0x00; // bad magic
        assert!(SmPkt::from_bytes(&bytes).is_none());

        let mut bytes = pkt.serialize();
        bytes[1] = 99; // unknown type
        assert!(SmPkt::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_duplicate_req_identical_bytes() {
        let client = ep("client", 10, 1, 42);
        let server = ep("server", 20, 2, 0);
        let a = SmPkt::connect_req(client, server).serialize();
        let b = SmPkt::connect_req(client, server).serialize();
        assert_eq!(a, b);
    }
}
