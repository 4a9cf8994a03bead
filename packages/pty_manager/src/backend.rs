use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{PtyError, SpawnError};

/// Configuration for spawning a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/bash".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

/// How a PTY process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitStatus {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn with_signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.signal.is_none() && self.code == Some(0)
    }
}

/// Events produced by a spawned process, in order.
///
/// `Exited` is sent exactly once and is always the last event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    Exited(ExitStatus),
}

/// Control surface of a live PTY process
pub trait PtyControl: Send + Sync {
    /// Queue bytes for the process's stdin. Returns once queued, not once consumed.
    fn write(&self, data: Vec<u8>) -> Result<(), PtyError>;

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;

    /// Graceful sends SIGTERM; otherwise the process is killed outright.
    fn terminate(&self, graceful: bool) -> Result<(), PtyError>;

    fn pid(&self) -> Option<u32>;
}

/// A freshly spawned process: its controls plus the event stream it feeds.
pub struct SpawnedPty {
    pub control: Arc<dyn PtyControl>,
    pub events: mpsc::Receiver<PtyEvent>,
}

/// Factory for PTY processes, injected into whatever owns session lifetimes.
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, config: PtyConfig) -> Result<SpawnedPty, SpawnError>;
}
