//! Error taxonomy for the proxy core.

use thiserror::Error;

/// Errors produced by the connection-lifecycle engine.
///
/// `Protocol`/`Unsupported`/`AuthFailed`/`Resolve`/`Dial` are terminal and
/// carry enough detail to pick a SOCKS5 REP code or HTTP status; `Io`
/// wraps both transient and terminal I/O failures (transience is judged
/// at the call site, not encoded in the type).
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("resolve failed: {0}")]
    Resolve(String),

    #[error("dial failed: {0}")]
    Dial(std::io::Error),

    #[error("not a tunnel (forward request handled inline)")]
    NotTunnel,

    #[error("shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// True for errors that should be logged; `NotTunnel` and
    /// `ShuttingDown` are expected one-shot outcomes, not failures.
    pub fn is_loggable(&self) -> bool {
        !matches!(self, ProxyError::NotTunnel | ProxyError::ShuttingDown)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
