use std::io;
use thiserror::Error;

/// Central error type for the lumen engine.
///
/// Client protocol errors and missing/forbidden resources are not represented
/// here: they become HTTP status codes (see [`crate::conn::HttpCode`]).
#[derive(Debug, Error)]
pub enum LumenError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid or inconsistent server configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The credential store rejected or failed an operation.
    #[error("credential store error: {0}")]
    Store(String),

    /// Signal handler installation failed.
    #[error("signal setup failed: {0}")]
    Signal(String),
}

pub type LumenResult<T> = Result<T, LumenError>;
