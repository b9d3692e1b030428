use crate::transport::TransportError;

/// Failure while delivering an outbound frame.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
