//! SOCKS4/4A proxy server
//!
//! Architecture:
//! - `core/`: Wire format, session registry and relay
//! - `transport/`: Listen/dial abstraction (TCP)
//! - `handler`: Per-connection processing (CONNECT and BIND)
//! - `server`: Lifecycle (start, run, graceful shutdown)
//! - `server_runner`: Accept loop

pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod logger;
pub mod server;
mod server_runner;
pub mod transport;

pub use config::ServerConfig;
pub use error::{Result, Socks4Error};
pub use server::{Server, ServerBuilder, ServerState};
