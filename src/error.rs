//! Error types for the proxy core.

use thiserror::Error;

/// Errors raised by the protocol machinery.
///
/// A partially-received message is not an error here: it's represented by
/// `Option::None` in the framer rather than a value of this enum.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The message header did not match any known frontend/backend/startup
    /// message kind.
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// A non-`ParameterStatus` authentication-class message arrived after
    /// the backend's handshake was already captured.
    #[error("unexpected message of type '{0}' after authentication handshake was captured")]
    UnexpectedAuthMessage(char),

    /// A client was attached to the backend session while a partial
    /// backend-directed message was still being parsed.
    #[error("attempted to attach a client session while a message was still being parsed")]
    AttachWhileParsing,

    /// Dialing the upstream backend did not complete in time.
    #[error("timed out connecting to upstream backend")]
    UpstreamDialTimeout,

    /// The backend session this client was attached to is gone.
    #[error("backend session is no longer available")]
    BackendGone,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
