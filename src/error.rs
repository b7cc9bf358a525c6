use crate::credentials::AuthError;
use crate::tunnel::RefusedResponse;

/// Error type for the proxy engine
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy server already started")]
    AlreadyStarted,

    #[error("request handler is already bound to a connection")]
    AlreadyBound,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream protocol error: {0}")]
    Protocol(String),

    #[error("upstream proxy refused tunnel: {}", .0.head.status)]
    TunnelRefused(Box<RefusedResponse>),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Whether the error only means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::ConnectionClosed => true,
            ProxyError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
