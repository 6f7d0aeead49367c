use thiserror::Error;

/// Errors produced by the gateway core.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("sniff error: {0}")]
    Sniff(String),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("cancelled")]
    Cancelled,

    #[error("dial error: {0}")]
    Dial(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("handler panic: {0}")]
    Panic(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl GateError {
    /// Whether this error came from caller cancellation rather than the
    /// transport itself.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GateError::Cancelled)
    }
}

pub type GateResult<T> = Result<T, GateError>;
