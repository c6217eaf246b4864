use thiserror::Error;

/// Errors produced while reading or writing notebook documents.
#[derive(Error, Debug)]
pub enum DocError {
    /// An output record or message content lacked a key its kind requires.
    #[error("malformed {output_type} output: {reason}")]
    MalformedOutput {
        output_type: String,
        reason: String,
    },

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("unsupported nbformat version {nbformat}")]
    UnsupportedFormat { nbformat: i64 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DocError {
    pub(crate) fn malformed(output_type: impl Into<String>, reason: impl Into<String>) -> Self {
        DocError::MalformedOutput {
            output_type: output_type.into(),
            reason: reason.into(),
        }
    }
}
