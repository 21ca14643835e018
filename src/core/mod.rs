//! Core proxy module
//!
//! This module contains the protocol-level pieces of the proxy:
//! - SOCKS4/4A request decoding and reply encoding
//! - Session registry
//! - Bidirectional relay

mod protocol;
mod relay;
mod session;

pub use protocol::{
    decode_request, frame_len, Address, Command, Reply, ReplyStatus, Request, REPLY_VERSION,
    VERSION4,
};
pub use relay::{relay, RelayStats};
pub use session::{SessionId, SessionInfo, SessionManager};
