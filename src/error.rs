//! Error types for marionette
//!
//! One error enum for the whole engine, with classification helpers so the
//! PFSM loop can tell transient conditions apart from fatal ones.

use thiserror::Error;

/// Result type for marionette operations
pub type Result<T> = std::result::Result<T, Error>;

/// Marionette error types
#[derive(Debug, Error)]
pub enum Error {
    // ========== PFSM Errors ==========

    /// No applicable transition at the current state
    #[error("no transitions available from state {0:?}")]
    NoTransitions(String),

    /// Transient condition; the current transition should be reattempted
    #[error("retry transition")]
    RetryTransition,

    /// Incoming cell was stamped with a different document UUID
    #[error("uuid mismatch: expected {expected}, got {got}")]
    UuidMismatch { expected: u32, got: u32 },

    /// Document references a plugin that was never registered
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Document is internally inconsistent
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Named port could not be resolved from the variable map
    #[error("port unresolved: {0:?}")]
    PortUnresolved(String),

    /// No built-in format under the requested name
    #[error("format not found: {0}")]
    FormatNotFound(String),

    /// No built-in template grammar under the requested name
    #[error("grammar not found: {0}")]
    GrammarNotFound(String),

    // ========== FTE Errors ==========

    /// MAC verification failed while decrypting a covertext
    #[error("authentication failed")]
    AuthFailed,

    /// String is not a member of the cover language
    #[error("string not in language")]
    NotInLanguage,

    /// Rank is outside `[0, |L| ∩ Σⁿ)`
    #[error("rank out of range")]
    RankOutOfRange,

    /// Regex/length pair cannot carry the requested payload
    #[error("insufficient capacity for {regex:?} at length {msg_len}")]
    CapacityTooSmall { regex: String, msg_len: usize },

    /// Regex failed to compile into a DFA
    #[error("invalid regex {0:?}: {1}")]
    InvalidRegex(String, String),

    // ========== Cell Errors ==========

    /// Payload plus header exceeds the target cell size
    #[error("cell payload too large: {0} bytes (max {1})")]
    PayloadTooLarge(usize, usize),

    /// Buffer ends before the encoded record does
    #[error("short read")]
    ShortRead,

    /// Cell length fields or type are inconsistent
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// Cell payload failed structural validation
    #[error("malformed payload: {0}")]
    Malformed(String),

    // ========== Stream Errors ==========

    /// Stream was closed by the application or the peer
    #[error("stream closed: {0}")]
    StreamClosed(u32),

    /// Too many out-of-order cells buffered for one stream
    #[error("reorder window exceeded on stream {0}")]
    ReorderWindowExceeded(u32),

    // ========== Lifecycle Errors ==========

    /// Cancellation token fired
    #[error("cancelled")]
    Cancelled,

    /// Operation deadline expired
    #[error("timeout")]
    Timeout,

    /// Underlying connection reached EOF
    #[error("connection closed")]
    ConnectionClosed,

    // ========== Configuration Errors ==========

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Network Errors ==========

    /// IO error
    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    /// Check if the PFSM loop should swallow this error and re-enter `next`.
    ///
    /// Timeouts are retryable per the concurrency model: a blocking plugin
    /// whose deadline expires reports `Timeout` and the transition is simply
    /// attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RetryTransition | Error::Timeout)
    }

    /// Check if this error must tear down the connection.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !matches!(self, Error::Cancelled)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Timeout,
            ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(err.to_string()),
        }
    }
}
