use crate::reconcile::{PendingReview, ReviewResolution};
use crate::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Upper bound for a single client→server control frame.
pub const MAX_CLIENT_FRAME_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FileEventKind {
    Added,
    Changed,
    Removed,
    DirAdded,
    DirRemoved,
}

impl FileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventKind::Added => "added",
            FileEventKind::Changed => "changed",
            FileEventKind::Removed => "removed",
            FileEventKind::DirAdded => "dir-added",
            FileEventKind::DirRemoved => "dir-removed",
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileEventKind::DirAdded | FileEventKind::DirRemoved)
    }
}

impl fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server→client messages on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    FileChanged {
        event: FileEventKind,
        path: String,
    },
    PendingReview(PendingReview),
    ReviewResolved {
        path: String,
        resolution: ReviewResolution,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceChanged {
        path: String,
        project_name: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionExited {
        session_id: SessionId,
        exit_code: Option<u32>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::FileChanged { .. } => "file-changed",
            ControlMessage::PendingReview(_) => "pending-review",
            ControlMessage::ReviewResolved { .. } => "review-resolved",
            ControlMessage::WorkspaceChanged { .. } => "workspace-changed",
            ControlMessage::SessionExited { .. } => "session-exited",
            ControlMessage::Error { .. } => "error",
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ControlMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Client→server messages on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Without a `sessionId` the hub targets its primary session.
    #[serde(rename_all = "camelCase", alias = "pty-resize")]
    ResizeRequest {
        #[serde(default)]
        session_id: Option<SessionId>,
        cols: u16,
        rows: u16,
    },
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("malformed control message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode control message: {0}")]
    Encode(#[source] serde_json::Error),
}

pub fn encode_message(msg: &ControlMessage) -> Result<String, ControlError> {
    serde_json::to_string(msg).map_err(ControlError::Encode)
}

pub fn decode_client_message(raw: &[u8], max_bytes: usize) -> Result<ClientMessage, ControlError> {
    if raw.len() > max_bytes {
        return Err(ControlError::FrameTooLarge {
            size: raw.len(),
            max: max_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(ControlError::Malformed)
}
