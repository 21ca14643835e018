//! SOCKS4/4A protocol parsing
//!
//! Request format:
//! - VN (1 byte, 0x04)
//! - CD (1 byte: CONNECT=1, BIND=2)
//! - DSTPORT (2 bytes, big-endian)
//! - DSTIP (4 bytes; `0.0.0.x` with x != 0 selects the 4A domain form)
//! - USERID, NUL
//! - 4A only: DOMAIN, NUL
//!
//! Reply format: VN=0 (1) + CD (1) + DSTPORT (2) + DSTIP (4)

use std::net::{Ipv4Addr, SocketAddr};

use crate::error::{Result, Socks4Error};

/// Protocol version carried in every request
pub const VERSION4: u8 = 0x04;

/// Version byte of every reply
pub const REPLY_VERSION: u8 = 0x00;

const NUL: u8 = 0x00;

/// SOCKS4 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Outbound TCP connect
    Connect = 0x01,
    /// Inbound TCP bind
    Bind = 0x02,
}

impl TryFrom<u8> for Command {
    type Error = Socks4Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            other => Err(Socks4Error::UnsupportedCommand(other)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect => write!(f, "CONNECT"),
            Command::Bind => write!(f, "BIND"),
        }
    }
}

/// Target address of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Literal IPv4 address (SOCKS4)
    IPv4([u8; 4], u16),
    /// Domain name resolved by the server (SOCKS4A)
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host(), self.port())
    }
}

impl Address {
    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host string (IP or domain)
    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

/// A decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Requested operation
    pub command: Command,
    /// Target host and port
    pub addr: Address,
    /// User id reported by the client, passed through unauthenticated
    pub identity: String,
}

impl Request {
    /// Minimum request size: VN + CD + DSTPORT + DSTIP + NUL
    pub const MIN_SIZE: usize = 9;

    /// Dialable `host:port` form of the target
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Whether the request used the SOCKS4A domain-name form
    pub fn is_extended(&self) -> bool {
        matches!(self.addr, Address::Domain(..))
    }
}

/// DSTIP `0.0.0.x` with x != 0 marks a SOCKS4A request
fn is_extended_sentinel(ip: &[u8]) -> bool {
    ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0
}

/// Length of the first complete request in `buf`, or `None` if more data is needed.
///
/// The literal form ends at the first NUL after DSTIP, the 4A form at the second.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < Request::MIN_SIZE {
        return None;
    }
    let needed = if is_extended_sentinel(&buf[4..8]) { 2 } else { 1 };
    buf[8..]
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == NUL)
        .nth(needed - 1)
        .map(|(i, _)| 8 + i + 1)
}

/// Decode a complete request message
pub fn decode_request(buf: &[u8]) -> Result<Request> {
    let n = buf.len();
    if n < Request::MIN_SIZE {
        return Err(Socks4Error::MalformedRequest);
    }

    if buf[0] != VERSION4 {
        return Err(Socks4Error::UnsupportedVersion(buf[0]));
    }

    let command = Command::try_from(buf[1])?;
    let port = u16::from_be_bytes([buf[2], buf[3]]);

    if is_extended_sentinel(&buf[4..8]) {
        let segments: Vec<&[u8]> = buf[8..].split(|b| *b == NUL).collect();
        if segments.len() != 3 {
            return Err(Socks4Error::MalformedExtendedRequest(
                "expected user id and domain terminated by NUL",
            ));
        }
        let identity = String::from_utf8_lossy(segments[0]).into_owned();
        let domain = std::str::from_utf8(segments[1])
            .map_err(|_| Socks4Error::MalformedExtendedRequest("invalid domain encoding"))?;
        Ok(Request {
            command,
            addr: Address::Domain(domain.to_string(), port),
            identity,
        })
    } else {
        let mut ip = [0u8; 4];
        ip.copy_from_slice(&buf[4..8]);
        // Everything after DSTIP except the trailing NUL
        let identity = String::from_utf8_lossy(&buf[8..n - 1]).into_owned();
        Ok(Request {
            command,
            addr: Address::IPv4(ip, port),
            identity,
        })
    }
}

/// Reply status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Request granted
    Granted = 0x5a,
    /// Request rejected or failed
    RejectedOrFailed = 0x5b,
    /// Rejected because the server cannot reach identd on the client
    RejectedNoIdentd = 0x5c,
    /// Rejected because identd and the client report different user ids
    RejectedIdentMismatch = 0x5d,
}

impl From<u8> for ReplyStatus {
    /// Unknown codes collapse to `RejectedOrFailed`
    fn from(value: u8) -> Self {
        match value {
            0x5a => ReplyStatus::Granted,
            0x5c => ReplyStatus::RejectedNoIdentd,
            0x5d => ReplyStatus::RejectedIdentMismatch,
            _ => ReplyStatus::RejectedOrFailed,
        }
    }
}

/// Server reply to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub port: u16,
    pub ip: Ipv4Addr,
}

impl Reply {
    /// Encoded reply size
    pub const SIZE: usize = 8;

    pub fn new(status: ReplyStatus, port: u16, ip: Ipv4Addr) -> Self {
        Self { status, port, ip }
    }

    /// GRANTED reply carrying a bound socket address.
    ///
    /// IPv6 addresses other than IPv4-mapped ones are reported as 0.0.0.0.
    pub fn granted(addr: SocketAddr) -> Self {
        let ip = match addr {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        Self::new(ReplyStatus::Granted, addr.port(), ip)
    }

    /// Generic failure reply
    pub fn rejected() -> Self {
        Self::new(ReplyStatus::RejectedOrFailed, 0, Ipv4Addr::UNSPECIFIED)
    }

    /// Encode reply to its 8-byte wire form
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = REPLY_VERSION;
        buf[1] = self.status as u8;
        buf[2..4].copy_from_slice(&self.port.to_be_bytes());
        buf[4..8].copy_from_slice(&self.ip.octets());
        buf
    }
}
