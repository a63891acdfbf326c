use thiserror::Error;

/// Errors raised by acquisition, recording and broadcasting.
///
/// Signal processing never produces these after construction; degenerate
/// windows yield zeroed statistics instead.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("Stop recording first")]
    StillRecording,

    #[error("Transient source error: {0}")]
    TransientSource(String),

    #[error("Source failed: {0}")]
    FatalSource(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Sink closed")]
    SinkClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used by transports to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Config,
    State,
    TransientSource,
    FatalSource,
    Io,
    Timeout,
    Sink,
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::Connection(_) => ErrorKind::Connection,
            StreamError::InvalidConfig(_) => ErrorKind::Config,
            StreamError::AlreadyRecording
            | StreamError::NotRecording
            | StreamError::StillRecording => ErrorKind::State,
            StreamError::TransientSource(_) | StreamError::Parse(_) => ErrorKind::TransientSource,
            StreamError::FatalSource(_) => ErrorKind::FatalSource,
            StreamError::Io(_) | StreamError::Csv(_) | StreamError::Json(_) => ErrorKind::Io,
            StreamError::Timeout(_) => ErrorKind::Timeout,
            StreamError::SinkClosed => ErrorKind::Sink,
        }
    }

    /// Whether the producer loop may keep pulling after this error.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientSource
    }
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;
