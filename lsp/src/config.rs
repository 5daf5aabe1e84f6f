//! Client configuration.
//!
//! Every field has a default, so an empty config (or none at all) reproduces
//! the stock setup: `bin/ferret-lsp` under the extension directory, a TCP
//! channel on `127.0.0.1:8487`, and `.ferret`/`.wal` files synchronized.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::policy::{DocumentSelector, PolicyError, SyncPolicy};
use crate::session::SessionOptions;
use crate::transport::{SocketAddress, TransportMode, TransportResolver};

/// Port shared by the run and debug launches of the server.
pub const DEFAULT_PORT: u16 = 8487;
pub const DEFAULT_HOST: &str = "127.0.0.1";

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Environment variables never passed to a spawned server.
const DEFAULT_ENV_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_TOKEN",
    "*_SECRET*",
    "*_PASSWORD",
    "AWS_*",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Socket,
    Stdio,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server executable, relative to the extension directory unless absolute.
    pub server_path: PathBuf,
    /// Arguments passed on every launch.
    pub args: Vec<String>,
    /// Extra arguments for the debug launch only.
    pub debug_args: Vec<String>,
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    /// Connect to an already-running server instead of spawning one.
    pub attach: bool,
    pub handshake_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub document_selector: Vec<DocumentSelector>,
    pub watch: Vec<String>,
    /// Glob-style names (`*_TOKEN`, `AWS_*`) stripped from the server's
    /// environment.
    pub env_denylist: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_path: PathBuf::from("bin").join(format!(
                "ferret-lsp{}",
                std::env::consts::EXE_SUFFIX
            )),
            args: Vec::new(),
            debug_args: vec![String::from("--debug")],
            transport: TransportKind::Socket,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            attach: false,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            document_selector: vec![DocumentSelector::new("file", "ferret")],
            watch: vec![String::from("**/*.{wal,ferret}")],
            env_denylist: DEFAULT_ENV_DENYLIST
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn transport_mode(&self) -> TransportMode {
        match self.transport {
            TransportKind::Socket => {
                TransportMode::Socket(SocketAddress::new(self.host.clone(), self.port))
            }
            TransportKind::Stdio => TransportMode::Stdio,
        }
    }

    #[must_use]
    pub fn resolver(&self) -> TransportResolver {
        TransportResolver::new(self.args.clone(), self.debug_args.clone())
    }

    pub fn sync_policy(&self) -> Result<SyncPolicy, PolicyError> {
        SyncPolicy::new(self.document_selector.iter().cloned(), self.watch.iter().cloned())
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    #[must_use]
    pub fn session_options(&self, workspace_root: Option<PathBuf>) -> SessionOptions {
        SessionOptions {
            handshake_timeout: self.handshake_timeout(),
            shutdown_grace: self.shutdown_grace(),
            workspace_root,
            env_denylist: self.env_denylist.clone(),
        }
    }
}
