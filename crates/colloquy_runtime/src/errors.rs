use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("transport is closed")]
    TransportClosed,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures reported by an agent engine while starting or driving a run.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to start engine: {0}")]
    Spawn(String),
    #[error("engine process exited with code {code:?}")]
    Exited { code: Option<i32> },
    #[error("engine control request timed out")]
    ControlTimeout,
    #[error("engine rejected control request: {0}")]
    ControlRejected(String),
    #[error("engine transport is closed")]
    TransportClosed,
    #[error("engine error: {0}")]
    Other(String),
}

impl EngineError {
    /// Whether this failure, seen on a resumed run before any output, means the stored
    /// session state is gone and a fresh run should be attempted instead.
    pub fn is_resume_expiry(&self) -> bool {
        matches!(self, Self::Exited { .. })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialize error: {0}")]
    Serialize(String),
}

impl From<RuntimeError> for EngineError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::TransportClosed => Self::TransportClosed,
            RuntimeError::InvalidConfig(message) | RuntimeError::Internal(message) => {
                Self::Spawn(message)
            }
        }
    }
}
