use thiserror::Error;

/// Reasons a process could not be started on a PTY.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpawnError {
    /// The requested working directory is missing or not a directory
    #[error("invalid working directory: {0}")]
    InvalidWorkingDirectory(String),
    /// The command could not be resolved to an executable
    #[error("command not found: {0}")]
    CommandNotFound(String),
    /// The OS refused to allocate a pseudo-terminal
    #[error("failed to allocate PTY: {0}")]
    PtyUnavailable(String),
    /// Any other OS failure while starting the process
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),
}

/// Errors from operations on an already spawned PTY process
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
    #[error("failed to signal PTY process: {0}")]
    KillFailed(String),
    #[error("PTY process has exited")]
    ProcessExited,
}
