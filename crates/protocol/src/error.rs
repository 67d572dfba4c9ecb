//! Frame codec errors.

use thiserror::Error;

/// Why a frame could not be decoded or encoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a JSON document.
    #[error("malformed JSON at line {line}, column {column}")]
    MalformedJson {
        line: usize,
        column: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Valid JSON that does not describe a known message, such as an unknown
    /// `type`, a missing field or an unknown agent kind.
    #[error("unrecognized message: {0}")]
    UnrecognizedMessage(#[source] serde_json::Error),

    /// The message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Result type alias for frame codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Classifies a decode failure.
    pub(crate) fn decode(err: serde_json::Error) -> Self {
        if err.is_data() {
            ProtocolError::UnrecognizedMessage(err)
        } else {
            ProtocolError::MalformedJson {
                line: err.line(),
                column: err.column(),
                source: err,
            }
        }
    }
}
