//! Configuration module for the SOCKS4 server
//!
//! `CliArgs` handles CLI argument parsing with environment variable support;
//! `ServerConfig` is what the library consumes.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::time::Duration;

use crate::logger::LogLevel;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Default listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:1080";

/// Default host for BIND listeners
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// How long a BIND request waits for its inbound connection
pub const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_secs(120);

/// CLI arguments for the SOCKS4 server
///
/// Supports environment variables with SOCKS4_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "SOCKS4/4A proxy server")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Address to listen on (e.g., "0.0.0.0:1080")
    #[arg(long, env = "SOCKS4_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "SOCKS4_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    /// Host BIND listeners are opened on (default: 0.0.0.0)
    #[arg(long, env = "SOCKS4_BIND_HOST", default_value = DEFAULT_BIND_HOST)]
    pub bind_host: String,

    /// Maximum wait for the inbound connection of a BIND request (default: 120s)
    #[arg(long, env = "SOCKS4_BIND_TIMEOUT", default_value = "120s", value_parser = parse_duration)]
    pub bind_timeout: Duration,

    // ==================== Performance Tuning ====================
    /// Timeout for reading the SOCKS4 request (default: 30s)
    #[arg(long, env = "SOCKS4_REQUEST_TIMEOUT", default_value = "30s", value_parser = parse_duration, help_heading = "Performance")]
    pub request_timeout: Duration,

    /// TCP connect timeout for CONNECT requests (default: 10s)
    #[arg(long, env = "SOCKS4_CONNECT_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_timeout: Duration,

    /// Buffer size for data transfer in bytes (default: 32KB)
    #[arg(long, env = "SOCKS4_BUFFER_SIZE", default_value_t = 32 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// Largest accepted request in bytes, user id and domain included (default: 1024)
    #[arg(long, env = "SOCKS4_MAX_REQUEST_SIZE", default_value_t = 1024, help_heading = "Performance")]
    pub max_request_size: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(long, env = "SOCKS4_TCP_BACKLOG", default_value_t = 1024, help_heading = "Performance")]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(long, env = "SOCKS4_TCP_NODELAY", default_value_t = true, help_heading = "Performance")]
    pub tcp_nodelay: bool,

    /// Maximum concurrent sessions, 0 = unlimited (default: 0)
    #[arg(long, env = "SOCKS4_MAX_CONNECTIONS", default_value_t = 0, help_heading = "Performance")]
    pub max_connections: usize,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(anyhow!("listen address is required (--listen)"));
        }
        if self.bind_host.is_empty() {
            return Err(anyhow!("bind host must not be empty (--bind_host)"));
        }
        if LogLevel::parse(&self.log_mode).is_none() {
            return Err(anyhow!(
                "Invalid log mode '{}': expected trace, debug, info, warn or error",
                self.log_mode
            ));
        }
        if self.bind_timeout.is_zero() {
            return Err(anyhow!("bind_timeout must be greater than 0"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request_timeout must be greater than 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect_timeout must be greater than 0"));
        }
        if self.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }
        if self.max_request_size < 9 {
            return Err(anyhow!("max_request_size must be at least 9 bytes"));
        }
        if self.tcp_backlog <= 0 {
            return Err(anyhow!("tcp_backlog must be greater than 0"));
        }
        Ok(())
    }

    /// Parsed log level, falling back to info
    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.log_mode).unwrap_or_default()
    }
}

/// Runtime server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the server listens on
    pub listen_addr: String,
    /// Host BIND listeners are opened on (port is always ephemeral)
    pub bind_host: String,
    /// Maximum wait for the inbound connection of a BIND request
    pub bind_timeout: Duration,
    /// Timeout for reading the request
    pub request_timeout: Duration,
    /// Timeout for the single CONNECT dial attempt
    pub connect_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// Largest accepted request in bytes
    pub max_request_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// Maximum concurrent sessions, 0 = unlimited
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            bind_host: DEFAULT_BIND_HOST.to_string(),
            bind_timeout: DEFAULT_BIND_TIMEOUT,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            buffer_size: 32 * 1024,
            max_request_size: 1024,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            max_connections: 0,
        }
    }
}

impl ServerConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            listen_addr: cli.listen.clone(),
            bind_host: cli.bind_host.clone(),
            bind_timeout: cli.bind_timeout,
            request_timeout: cli.request_timeout,
            connect_timeout: cli.connect_timeout,
            buffer_size: cli.buffer_size,
            max_request_size: cli.max_request_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            max_connections: cli.max_connections,
        }
    }

    /// Address BIND listeners are opened on
    pub fn bind_listen_addr(&self) -> String {
        if self.bind_host.contains(':') {
            format!("[{}]:0", self.bind_host)
        } else {
            format!("{}:0", self.bind_host)
        }
    }
}
