use thiserror::Error;

/// All errors produced by hitony-core.
#[derive(Debug, Error)]
pub enum HitonyError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio front-end error: {0}")]
    FrontEnd(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HitonyError>;
