/// Errors raised by a transport binding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,

    #[error("no tokio runtime available to drive the socket")]
    NoRuntime,

    #[error("transport channel closed")]
    ChannelClosed,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("binary frame is not valid UTF-8: {0}")]
    InvalidUtf8(String),
}

/// Errors surfaced across the session / registry boundary.
#[derive(Debug, thiserror::Error)]
pub enum LiveQueryError {
    /// The configured live query server URI is empty or not a ws/wss URI.
    /// Fatal for the session; retrying will not help.
    #[error("invalid live query server uri: {0:?}")]
    InvalidServerUri(String),

    #[error("subscription key already registered: {0}")]
    DuplicateKey(String),

    /// The server sent an error frame with `reconnect: false`.
    #[error("server forbade reconnecting subscription {0}")]
    ReconnectForbidden(String),

    /// `subscribe()` on a session that already reached `Closed` or `Error`.
    /// Use `renew_subscription()` to start over.
    #[error("subscription {0} is closed")]
    SessionClosed(String),

    #[error("config error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl LiveQueryError {
    /// Whether retrying the same operation could ever succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T, E = LiveQueryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            LiveQueryError::DuplicateKey("players".into()).to_string(),
            "subscription key already registered: players"
        );
        assert_eq!(
            LiveQueryError::InvalidServerUri(String::new()).to_string(),
            "invalid live query server uri: \"\""
        );
        assert_eq!(
            LiveQueryError::from(TransportError::NotOpen).to_string(),
            "transport is not open"
        );
        assert_eq!(
            TransportError::Connect("refused".into()).to_string(),
            "connect failed: refused"
        );
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(LiveQueryError::from(TransportError::Connect("refused".into())).is_retryable());
        assert!(!LiveQueryError::InvalidServerUri("http://x".into()).is_retryable());
        assert!(!LiveQueryError::ReconnectForbidden("players".into()).is_retryable());
        assert!(!LiveQueryError::SessionClosed("players".into()).is_retryable());
    }
}
