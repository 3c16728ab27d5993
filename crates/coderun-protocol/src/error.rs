use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("runner configuration error: {0}")]
    Configuration(String),
    #[error("runner language unsupported: {0}")]
    UnsupportedLanguage(String),
    #[error("runner executor spawn failed: {0}")]
    Spawn(String),
    #[error("runner process error: {0}")]
    Process(String),
    #[error("runner protocol error: {0}")]
    Protocol(String),
    #[error("runner channel closed: {0}")]
    ChannelClosed(String),
}

pub type RunnerResult<T> = Result<T, RunnerError>;
