use thiserror::Error;

/// Errors returned synchronously from the client API
///
/// Outcomes of asynchronous work (sends, twin updates, uploads, reconnects) are never reported
/// through this type, they are delivered exactly once through the callback registered with the
/// request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IoTHubError {
    /// Malformed input detected before anything was queued
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Request is not valid for the current state of the client
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// No free slot for another outstanding operation
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    /// The option or capability is not supported by the client or its transport
    #[error("not supported: {0}")]
    NotSupported(String),
    /// The transport provider rejected the request synchronously
    #[error("transport error: {0}")]
    Transport(String),
    /// Error building or signing a shared access token
    #[error(transparent)]
    Token(#[from] crate::token::TokenError),
}

impl IoTHubError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub(crate) fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }
}
