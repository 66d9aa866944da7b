use thiserror::Error;
use tokio::task::JoinError;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("GDB error: {0}")]
    GDBError(String),

    /// The MI parser could not make sense of a line and resynchronized at the
    /// next newline, or a result record referenced an unknown class.
    #[error("MI protocol error: {0}")]
    Protocol(String),

    /// The debugger process exited (or its stdin pipe broke) while commands
    /// were outstanding; every pending command slot is failed with this.
    #[error("transport closed")]
    TransportClosed,

    /// A DAP request cited a frame or variable handle not present in the
    /// current handle-table generation. Callers treat this as an
    /// empty/default response, not a surfaced error.
    #[error("stale handle")]
    StaleHandle,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task join error: {0}")]
    JoinError(#[from] JoinError),
}

/// Application result type
pub type AppResult<T> = Result<T, AppError>;
