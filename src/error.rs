use std::io;
use thiserror::Error;

/// SOCKS4 服务器统一的错误类型
#[derive(Error, Debug)]
pub enum Socks4Error {
    /// 请求不足 9 字节
    #[error("malformed SOCKS4 request")]
    MalformedRequest,

    /// VN 字段不是 0x04
    #[error("unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// CD 字段不是 CONNECT/BIND
    #[error("unsupported SOCKS4 command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// SOCKS4A 扩展请求格式错误
    #[error("malformed SOCKS4A request: {0}")]
    MalformedExtendedRequest(&'static str),

    /// 读取请求超时
    #[error("timed out reading request")]
    RequestTimeout,

    /// 请求超过允许的最大长度
    #[error("request exceeds {0} bytes")]
    RequestTooLarge(usize),

    /// 客户端在发送请求前关闭连接
    #[error("connection closed before receiving request")]
    ConnectionClosed,

    /// CONNECT 拨号失败
    #[error("failed to dial {addr}: {source}")]
    DialFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 监听地址不可用
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    /// BIND 等待入站连接超时
    #[error("timed out waiting for inbound BIND connection")]
    AcceptTimeout,

    /// BIND 接受入站连接失败
    #[error("failed to accept inbound BIND connection: {0}")]
    Accept(#[source] io::Error),

    /// 向客户端写回复失败
    #[error("failed to write reply: {0}")]
    ReplyWrite(#[source] io::Error),

    /// 服务器尚未启动
    #[error("can't shut down a server that has not been started")]
    NotStarted,

    /// 服务器状态不允许该操作
    #[error("invalid server state: {0}")]
    InvalidState(&'static str),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Socks4Error {
    /// Whether the error happened while decoding the request, before any reply.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Socks4Error::MalformedRequest
                | Socks4Error::UnsupportedVersion(_)
                | Socks4Error::UnsupportedCommand(_)
                | Socks4Error::MalformedExtendedRequest(_)
        )
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, Socks4Error>;
