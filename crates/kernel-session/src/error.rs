use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Rejected locally: no usable address or token, or the kernel's
    /// channels did not become ready in time.
    #[error("Kernel unavailable: {0}")]
    KernelUnavailable(String),

    #[error("Kernel channel closed")]
    ChannelClosed,

    #[error("Malformed {msg_type} message: {reason}")]
    MalformedMessage { msg_type: String, reason: String },

    #[error("Kernel connection error: {0}")]
    Connection(String),
}

impl SessionError {
    pub(crate) fn malformed(msg_type: &str, reason: impl Into<String>) -> Self {
        SessionError::MalformedMessage {
            msg_type: msg_type.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn connection(e: impl std::fmt::Display) -> Self {
        SessionError::Connection(e.to_string())
    }
}
