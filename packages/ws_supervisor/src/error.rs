use tokio_tungstenite::tungstenite;

/// Failure of a single connection: opening it, or reading/writing frames.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),

    #[error("connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the peer could not be reached at all (as opposed to a
    /// connection that failed after it was established).
    pub fn is_unreachable(&self) -> bool {
        match self {
            TransportError::WebSocket(tungstenite::Error::Io(io_err)) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotFound
            ),
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid endpoint {endpoint:?}: {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },

    #[error("supervisor has stopped")]
    Stopped,
}
