use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// 从字符串解析日志级别
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Install the console sink.
///
/// `RUST_LOG` wins over `level`. Does nothing if a global subscriber is
/// already installed, so embedders can bring their own.
pub fn init_logger(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("socks4_rs={}", level.as_str())));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .try_init();
}

pub mod log {
    pub use tracing::{debug, error, info, warn};

    use crate::core::Request;

    /// 记录连接事件
    pub fn connection(addr: &str, event: &str) {
        info!(peer = addr, event = event, "Connection");
    }

    /// 记录请求
    pub fn request(addr: &str, req: &Request) {
        info!(
            peer = addr,
            command = %req.command,
            target = %req.addr,
            socks4a = req.is_extended(),
            user_id = %req.identity,
            "Request"
        );
    }

    /// 记录转发结束
    pub fn relay(addr: &str, upload: u64, download: u64) {
        info!(peer = addr, upload, download, "Relay finished");
    }
}
