use thiserror::Error;

/// Core error type for chatstream.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The response was reachable but rejected before any message processing
    /// began (wrong content type, non-2xx status).
    #[error("response validation failed: {0}")]
    Validation(String),

    /// Network or connection failure while issuing the request or reading
    /// the body. Retryable at the caller's discretion.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A single malformed wire payload. Recovered locally by the decoders;
    /// only surfaced when a caller explicitly asks for a diagnostic.
    #[error("invalid chunk payload: {0}")]
    Parse(String),

    /// The stream ended without the terminal event it was required to emit.
    #[error("stream ended unexpectedly")]
    UnexpectedEnd,

    /// The caller cancelled the request. Not an error in the taxonomy sense:
    /// routed to the abort path, never to error callbacks.
    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StreamError {
    /// True when this error should take the abort path instead of the error
    /// path. `sentinel` is the caller-supplied cancellation marker matched
    /// against the message of opaque transport errors.
    pub fn is_cancellation(&self, sentinel: &str) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Transport(msg) => msg.contains(sentinel),
            Self::Other(e) => e.to_string().contains(sentinel),
            _ => false,
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, StreamError>;
