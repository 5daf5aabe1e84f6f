//! Public types exchanged with the host.
//!
//! The host feeds [`EditorEvent`]s into a running session and drains
//! [`SessionEvent`]s back out. Both serialize as internally tagged JSON so
//! the `ferret-client` binary can pass them over stdin/stdout unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Lifecycle state of a session.
///
/// Transitions only move forward:
/// `Uninitialized → Starting → Running → Stopping → Stopped`, with
/// `Starting → Stopped` on a failed or cancelled start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl SessionState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An editor document, identified by URI and language.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DocumentId {
    pub uri: Url,
    pub language_id: String,
}

impl DocumentId {
    #[must_use]
    pub fn new(uri: Url, language_id: impl Into<String>) -> Self {
        Self {
            uri,
            language_id: language_id.into(),
        }
    }
}

/// Kind of a file-system change, numbered as the protocol numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

impl FileChangeKind {
    #[must_use]
    pub fn protocol_code(self) -> u8 {
        match self {
            Self::Created => 1,
            Self::Changed => 2,
            Self::Deleted => 3,
        }
    }
}

/// An event raised by the editor that may need to reach the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EditorEvent {
    DocumentOpened { document: DocumentId, text: String },
    /// Full document text after the change.
    DocumentChanged { document: DocumentId, text: String },
    DocumentSaved { document: DocumentId },
    DocumentClosed { document: DocumentId },
    /// Delivered by the file-watch service.
    FileChanged { uri: Url, kind: FileChangeKind },
}

impl EditorEvent {
    /// The document this event concerns, if it is a document event.
    #[must_use]
    pub fn document(&self) -> Option<&DocumentId> {
        match self {
            Self::DocumentOpened { document, .. }
            | Self::DocumentChanged { document, .. }
            | Self::DocumentSaved { document }
            | Self::DocumentClosed { document } => Some(document),
            Self::FileChanged { .. } => None,
        }
    }
}

/// Why the server side of a connection went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerExitReason {
    /// The transport reached a clean end of stream.
    Exited,
    /// Reading from the transport failed.
    Failed(String),
}

/// An event emitted by the session for the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
    },
    /// A server notification, passed through uninterpreted.
    ServerNotification {
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },
    ServerExited {
        reason: ServerExitReason,
    },
}

/// Result of handing an [`EditorEvent`] to a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    /// One notification with this method was written to the server.
    Sent(&'static str),
    /// The event fell outside the synchronization policy.
    Filtered,
}

/// How `stop()` concluded. `stop()` never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing to stop: never started, already stopped, or another stop
    /// finished the job.
    NotRunning,
    /// A pending start was cancelled before reaching `Running`.
    Cancelled,
    /// The server acknowledged shutdown and closed the transport.
    Graceful,
    /// The grace period elapsed or the handshake failed; the transport was
    /// closed forcibly.
    Forced,
}
