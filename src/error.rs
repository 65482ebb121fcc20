use thiserror::Error;

/// Errors surfaced by the negotiation handlers
///
/// Nothing here is retried internally. Every failure goes back to the caller,
/// which decides whether to retry (e.g. an ICE restart after a connectivity loss).
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Handler closed")]
    Closed,

    #[error("Track already handled: {0}")]
    DuplicateTrack(String),

    #[error("Consumer id already used: {0}")]
    DuplicateId(String),

    #[error("Track not found: {0}")]
    UnknownTrack(String),

    #[error("Consumer not found: {0}")]
    UnknownId(String),

    #[error("Invalid spatial layer {layer} (encodings: {encodings})")]
    InvalidLayer { layer: u8, encodings: usize },

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HandlerError {
    /// Whether this error means the handler can no longer be used
    pub fn is_closed(&self) -> bool {
        matches!(self, HandlerError::Closed)
    }
}

/// Result type alias for handler operations
pub type Result<T> = std::result::Result<T, HandlerError>;
