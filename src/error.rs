//! Error types for the voxlink client

use thiserror::Error;

/// Result type alias for voxlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voxlink client
#[derive(Debug, Error)]
pub enum Error {
    /// Transport could not be established
    #[error("connection error: {0}")]
    Connection(String),

    /// Mid-session send/receive failure on an established transport
    #[error("transport error: {0}")]
    Transport(String),

    /// Microphone/speaker unavailable or format negotiation failed
    #[error("device error: {0}")]
    Device(String),

    /// Audio buffer cannot be converted to or from the canonical format
    #[error("format error: {0}")]
    Format(String),

    /// Malformed inbound control message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation invalid in the current session lifecycle state
    #[error("invalid state: {0}")]
    State(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error ends the session it occurred in.
    ///
    /// Format and protocol errors are recovered locally by dropping the
    /// offending buffer or message; everything touching the transport or
    /// the audio devices forces the session down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Format(_) | Self::Protocol(_) | Self::State(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::Transport("reset".into()).is_fatal());
        assert!(Error::Device("no mic".into()).is_fatal());
        assert!(Error::Connection("refused".into()).is_fatal());
        assert!(!Error::Format("odd length".into()).is_fatal());
        assert!(!Error::Protocol("bad tag".into()).is_fatal());
    }
}
