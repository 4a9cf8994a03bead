//! JSON messages exchanged over the session and events WebSockets.
//!
//! Raw terminal output travels as binary frames and never appears here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::session_actor::{ExitInfo, SessionInfo, StatusNotice};

/// Text frames sent by an attached client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// Text frames sent to an attached client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerNotice {
    Started,
    Exited { exit_info: ExitInfo },
    Error { code: String, message: String },
}

impl ServerNotice {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerNotice::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Frames on the `/api/events` stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleMessage {
    /// Sent once on connect.
    Snapshot {
        sessions: BTreeMap<String, SessionInfo>,
    },
    StatusChanged(StatusNotice),
}
