//! Error types for the voxpipe pipeline.

use std::time::Duration;

/// Top-level error type for the voice pipeline.
///
/// Cancellation is deliberately absent: a cancelled stage ends its stream
/// with `None` rather than an error.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// A collaborator connection failed or closed unexpectedly.
    #[error("connection error: {0}")]
    Connection(String),

    /// A collaborator was invoked before it finished initialising.
    #[error("collaborator not ready: {0}")]
    NotReady(String),

    /// A collaborator sent a payload that could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A bounded wait (e.g. a connection handshake) expired.
    #[error("{what} timed out after {after:?}")]
    Timeout {
        /// What was being waited on.
        what: &'static str,
        /// The bound that expired.
        after: Duration,
    },

    /// A producer that cannot be paused outran its bounded queue.
    #[error("producer queue overflow (capacity {capacity})")]
    Overflow {
        /// The queue capacity that was exceeded.
        capacity: usize,
    },

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpeechError {
    /// Whether this error only ends the current turn.
    ///
    /// Turn-fatal errors abort the turn that produced them; the driver is
    /// free to start listening again. The rest indicate a broken process
    /// setup and should stop the driver.
    pub fn is_turn_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::NotReady(_)
                | Self::Malformed(_)
                | Self::Timeout { .. }
                | Self::Overflow { .. }
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SpeechError>;

/// Await `fut`, failing with [`SpeechError::Timeout`] after `after`.
pub async fn with_timeout<T, F>(what: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(SpeechError::Timeout { what, after }),
    }
}
