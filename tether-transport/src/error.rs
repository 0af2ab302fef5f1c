use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connect failed: {0}")]
    Connect(String),
    /// Setup failure that will never succeed on retry, e.g. an
    /// unresolvable connection URL or a failed connection-params build.
    #[error("fatal setup error: {0}")]
    FatalSetup(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("keep-alive pong timeout")]
    KeepAliveTimeout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Fatal errors stop reconnection permanently.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::FatalSetup(_))
    }
}
