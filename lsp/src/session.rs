//! Session manager: owns exactly one client-server session.
//!
//! The manager is a cheap cloneable handle. The host typically runs
//! [`SessionManager::start`] as a task and calls [`SessionManager::stop`]
//! from elsewhere; a stop that lands while the start is still connecting
//! cancels it. State moves monotonically through
//! `Uninitialized → Starting → Running → Stopping → Stopped`, and `Stopped`
//! is terminal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::SessionError;
use crate::policy::SyncPolicy;
use crate::transport::TransportDescriptor;
use crate::types::{EditorEvent, Forwarded, SessionEvent, SessionState, StopOutcome};
use crate::watch::FileWatchService;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Timeouts and process settings for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Upper bound on connecting plus the initialize handshake.
    pub handshake_timeout: Duration,
    /// How long a graceful shutdown may take before the server is killed.
    pub shutdown_grace: Duration,
    /// Sent as `rootUri` and used as the server's working directory.
    pub workspace_root: Option<PathBuf>,
    pub env_denylist: Vec<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        ClientConfig::default().session_options(None)
    }
}

/// Publish a session event without blocking. A full channel drops the
/// event; a closed one means the host stopped listening.
pub(crate) fn publish(event_tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = event_tx.try_send(event) {
        tracing::warn!(?event, "Session event channel full, dropping event");
    }
}

struct Live {
    connection: Connection,
    policy: SyncPolicy,
}

struct Inner {
    state_tx: watch::Sender<SessionState>,
    live: Mutex<Option<Live>>,
    /// Fired by `stop`. Aborts a pending start and any notify still waiting
    /// on the lock or the writer queue.
    cancel: CancellationToken,
    options: SessionOptions,
    watcher: Arc<dyn FileWatchService>,
    event_tx: mpsc::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager in `Uninitialized` together with the receiving end
    /// of its event stream.
    #[must_use]
    pub fn new(
        options: SessionOptions,
        watcher: Arc<dyn FileWatchService>,
    ) -> (Self, SessionEvents) {
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Self {
            inner: Arc::new(Inner {
                state_tx,
                live: Mutex::new(None),
                cancel: CancellationToken::new(),
                options,
                watcher,
                event_tx,
            }),
        };
        (manager, SessionEvents { rx: event_rx })
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Establish the transport, run the handshake, and install the
    /// synchronization policy.
    ///
    /// Only valid from `Uninitialized`. Any failure leaves the session in
    /// `Stopped`.
    pub async fn start(
        &self,
        descriptor: &TransportDescriptor,
        policy: SyncPolicy,
    ) -> Result<(), SessionError> {
        self.transition(SessionState::Uninitialized, SessionState::Starting)
            .map_err(|state| SessionError::AlreadyStarted { state })?;
        let mut guard = StartGuard {
            manager: self,
            armed: true,
            registered: false,
        };

        tracing::info!(transport = %descriptor, "Starting language server session");
        let inner = &self.inner;
        let established = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => None,
            result = Connection::establish(descriptor, &inner.options, inner.event_tx.clone()) => Some(result),
        };

        let connection = match established {
            None => {
                tracing::info!("Session start cancelled before the handshake completed");
                return Err(SessionError::Cancelled);
            }
            Some(Err(e)) => {
                let err = SessionError::transport(&e);
                tracing::error!("{err}");
                return Err(err);
            }
            Some(Ok(connection)) => connection,
        };

        if let Err(e) = inner.watcher.register(policy.watched_patterns()) {
            tracing::warn!("File watch registration failed: {e:#}");
        }
        guard.registered = true;
        *inner.live.lock().await = Some(Live { connection, policy });

        if self
            .transition(SessionState::Starting, SessionState::Running)
            .is_err()
        {
            // A stop arrived after the handshake; undo what was built.
            tracing::info!("Session start cancelled after the handshake completed");
            let live = inner.live.lock().await.take();
            if let Some(live) = live {
                live.connection.shutdown(inner.options.shutdown_grace).await;
            }
            return Err(SessionError::Cancelled);
        }

        guard.armed = false;
        tracing::info!("Language server session running");
        Ok(())
    }

    /// Stop the session. Idempotent and infallible.
    pub async fn stop(&self) -> StopOutcome {
        let mut observed = SessionState::Uninitialized;
        let moved = self.inner.state_tx.send_if_modified(|state| {
            observed = *state;
            if matches!(*state, SessionState::Starting | SessionState::Running) {
                *state = SessionState::Stopping;
                true
            } else {
                false
            }
        });
        if moved {
            self.announce(observed, SessionState::Stopping);
        }

        match observed {
            SessionState::Uninitialized | SessionState::Stopped => StopOutcome::NotRunning,
            SessionState::Stopping => {
                self.wait_until_stopped().await;
                StopOutcome::NotRunning
            }
            SessionState::Starting => {
                self.inner.cancel.cancel();
                self.wait_until_stopped().await;
                StopOutcome::Cancelled
            }
            SessionState::Running => {
                tracing::info!("Stopping language server session");
                self.inner.cancel.cancel();
                let live = self.inner.live.lock().await.take();
                self.inner.watcher.unregister();
                let outcome = match live {
                    Some(live) => {
                        live.connection
                            .shutdown(self.inner.options.shutdown_grace)
                            .await
                    }
                    None => StopOutcome::Forced,
                };
                self.force_state(SessionState::Stopped);
                tracing::info!(?outcome, "Language server session stopped");
                outcome
            }
        }
    }

    /// Forward one editor event, subject to the session's policy.
    ///
    /// Events are written in call order. A concurrent `stop` wins: a notify
    /// blocked on a full writer queue returns `NotRunning` instead of
    /// holding the session open.
    pub async fn notify(&self, event: &EditorEvent) -> Result<Forwarded, SessionError> {
        let inner = &self.inner;
        let stopping = || SessionError::NotRunning { state: self.state() };
        let mut live = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => return Err(stopping()),
            live = inner.live.lock() => live,
        };
        let state = self.state();
        let Some(live) = live.as_mut().filter(|_| state == SessionState::Running) else {
            return Err(SessionError::NotRunning { state });
        };

        if !live.policy.accepts(event) {
            tracing::trace!(?event, "Event outside synchronization policy");
            return Ok(Forwarded::Filtered);
        }

        let forwarded = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => return Err(stopping()),
            result = live.connection.forward(event) => result,
        };
        match forwarded {
            Ok(Some(method)) => {
                tracing::debug!(method, "Forwarded editor event");
                Ok(Forwarded::Sent(method))
            }
            Ok(None) => Ok(Forwarded::Filtered),
            Err(e) => Err(SessionError::transport(&e)),
        }
    }

    /// Move `from` to `to`. On failure returns the state actually observed.
    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
        let mut observed = from;
        let moved = self.inner.state_tx.send_if_modified(|state| {
            observed = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            self.announce(from, to);
            Ok(())
        } else {
            Err(observed)
        }
    }

    fn force_state(&self, to: SessionState) {
        let previous = self.inner.state_tx.send_replace(to);
        if previous != to {
            self.announce(previous, to);
        }
    }

    fn announce(&self, from: SessionState, to: SessionState) {
        tracing::debug!(%from, %to, "Session state changed");
        publish(
            &self.inner.event_tx,
            SessionEvent::StateChanged { state: to },
        );
    }

    async fn wait_until_stopped(&self) {
        let mut state_rx = self.inner.state_tx.subscribe();
        let _ = state_rx
            .wait_for(|state| *state == SessionState::Stopped)
            .await;
    }
}

/// Puts the session into `Stopped` when a start does not complete, including
/// when the start future is dropped mid-flight.
struct StartGuard<'a> {
    manager: &'a SessionManager,
    armed: bool,
    registered: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut live) = self.manager.inner.live.try_lock() {
            live.take();
        }
        if self.registered {
            self.manager.inner.watcher.unregister();
        }
        self.manager.force_state(SessionState::Stopped);
    }
}

/// Receiving end of a session's events.
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::Receiver<SessionEvent>,
}

impl SessionEvents {
    /// Drain up to `budget` pending events without waiting.
    pub fn poll(&mut self, budget: usize) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while drained.len() < budget {
            match self.rx.try_recv() {
                Ok(event) => drained.push(event),
                Err(_) => break,
            }
        }
        drained
    }

    /// Wait for the next event.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}
