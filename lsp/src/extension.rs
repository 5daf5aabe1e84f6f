//! Editor lifecycle contract.
//!
//! `activate` resolves the transport and starts the session in the
//! background; the host keeps the returned [`Activation`] and hands it back
//! to [`deactivate`]. There is no global client handle.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::session::{SessionEvents, SessionManager};
use crate::transport::LaunchProfile;
use crate::types::{EditorEvent, Forwarded, SessionState, StopOutcome};
use crate::watch::FileWatchService;

/// Where the extension is installed and which workspace it serves.
#[derive(Debug, Clone)]
pub struct ExtensionContext {
    install_dir: PathBuf,
    workspace_root: Option<PathBuf>,
}

impl ExtensionContext {
    #[must_use]
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            workspace_root: None,
        }
    }

    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    #[must_use]
    pub fn workspace_root(&self) -> Option<&Path> {
        self.workspace_root.as_deref()
    }

    /// Resolve `path` against the installation directory.
    ///
    /// Absolute paths and bare program names are returned unchanged; the
    /// latter are looked up on `PATH` during resolution.
    #[must_use]
    pub fn as_absolute_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.components().count() == 1 {
            path.to_path_buf()
        } else {
            self.install_dir.join(path)
        }
    }
}

/// A started (or starting) client, owned by the host.
#[derive(Debug)]
pub struct Activation {
    manager: SessionManager,
    startup: Option<JoinHandle<Result<(), SessionError>>>,
}

impl Activation {
    #[must_use]
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Wait for the background start to finish.
    ///
    /// Cancel-safe. Once the start has been observed, later calls report
    /// whether the session is still running.
    pub async fn ready(&mut self) -> Result<(), SessionError> {
        let Some(startup) = self.startup.as_mut() else {
            return match self.manager.state() {
                SessionState::Running => Ok(()),
                state => Err(SessionError::NotRunning { state }),
            };
        };

        let joined = startup.await;
        self.startup = None;
        match joined {
            Ok(result) => result,
            Err(e) => Err(SessionError::TransportFailure {
                cause: format!("startup task failed: {e}"),
            }),
        }
    }

    pub async fn notify(&self, event: &EditorEvent) -> Result<Forwarded, SessionError> {
        self.manager.notify(event).await
    }
}

/// Resolve the transport for `config` and start a session in the background.
///
/// Resolution errors (missing executable, bad watch pattern) are returned
/// directly; transport and handshake errors surface from
/// [`Activation::ready`]. Must be called from within a tokio runtime.
pub fn activate(
    context: &ExtensionContext,
    config: &ClientConfig,
    profile: LaunchProfile,
    watcher: Arc<dyn FileWatchService>,
) -> Result<(Activation, SessionEvents), SessionError> {
    let mode = config.transport_mode();
    let resolver = config.resolver();
    let descriptor = if config.attach {
        resolver.attach(&mode)?
    } else {
        let executable = context.as_absolute_path(&config.server_path);
        resolver
            .resolve_server_options(&executable, &mode)?
            .select(profile)
            .clone()
    };
    let policy = config
        .sync_policy()
        .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;

    let options = config.session_options(context.workspace_root().map(Path::to_path_buf));
    let (manager, events) = SessionManager::new(options, watcher);

    tracing::info!(transport = %descriptor, ?profile, "Activating Ferret language client");
    let startup = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start(&descriptor, policy).await }
    });

    Ok((
        Activation {
            manager,
            startup: Some(startup),
        },
        events,
    ))
}

/// Stop whatever `activate` started.
///
/// Returns `None` when nothing was activated. The returned future cancels a
/// start still in flight, otherwise shuts the server down.
pub fn deactivate(activation: Option<Activation>) -> Option<impl Future<Output = StopOutcome>> {
    let activation = activation?;
    Some(async move {
        let outcome = activation.manager.stop().await;
        if let Some(startup) = activation.startup
            && let Err(e) = startup.await
        {
            tracing::debug!("Startup task ended abnormally: {e}");
        }
        outcome
    })
}
