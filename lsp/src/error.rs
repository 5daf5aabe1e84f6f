//! Error kinds surfaced across the session lifecycle.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::SessionState;

/// Errors returned by transport resolution and the session manager.
///
/// Startup failures (`ServerNotFound`, `TransportFailure`) are fatal to the
/// activation and meant to be shown to the user. `AlreadyStarted` is a host
/// contract violation. `ShutdownTimeout` never escapes `stop()`; it is only
/// logged.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("language server executable not found at {}: {source}", path.display())]
    ServerNotFound {
        path: PathBuf,
        #[source]
        source: which::Error,
    },

    #[error("failed to establish language server transport: {cause}")]
    TransportFailure { cause: String },

    #[error("session already started (state: {state})")]
    AlreadyStarted { state: SessionState },

    #[error("language server did not shut down within {}ms", grace.as_millis())]
    ShutdownTimeout { grace: Duration },

    #[error("session start was cancelled by stop")]
    Cancelled,

    #[error("session is not running (state: {state})")]
    NotRunning { state: SessionState },

    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl SessionError {
    /// Wrap an internal transport error, keeping the full context chain.
    pub(crate) fn transport(err: &anyhow::Error) -> Self {
        Self::TransportFailure {
            cause: format!("{err:#}"),
        }
    }

    /// Whether the error ends the activation attempt.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ServerNotFound { .. } | Self::TransportFailure { .. } | Self::InvalidConfig(_)
        )
    }
}
