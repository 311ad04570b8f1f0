use thiserror::Error;

/// Error kinds at the socket / codec boundary. Every one of these terminates the
///  connection it occurred on; the distinction determines the disconnect reason
///  that is surfaced upward.
#[derive(Debug, Error)]
pub enum WireError {
    /// the decoder rejected a frame, so the byte stream is considered compromised
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// clean EOF from the peer
    #[error("connection closed by peer")]
    Closed,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub fn malformed(what: impl Into<String>) -> WireError {
        WireError::MalformedFrame(what.into())
    }
}
