use thiserror::Error;

/// Errors surfaced while driving a single proxied connection. A session
/// that fails at any stage is torn down; nothing here is retried.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("forward leg requires TLS but backend refused")]
    SslRefused,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("backend requested unsupported authentication method (code {0})")]
    UnsupportedAuth(i32),

    #[error("backend rejected credentials after password exchange")]
    AuthRejected,

    #[error("observation sink error: {0}")]
    Sink(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
