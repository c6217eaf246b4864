use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    /// No control plane could be reached or launched.
    #[error("Jupyter server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("kernel failed to start (HTTP {status}): {body}")]
    KernelStartFailed { status: u16, body: String },

    /// A REST call returned a non-success status or failed in transport.
    #[error("control plane call {call} failed: {reason}")]
    ControlPlaneCallFailed { call: &'static str, reason: String },

    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub(crate) fn call_failed(call: &'static str, reason: impl ToString) -> Self {
        ServerError::ControlPlaneCallFailed {
            call,
            reason: reason.to_string(),
        }
    }
}
