//! Transport resolution: how the client reaches the language server.
//!
//! Resolution is pure. It checks that the server executable exists and is
//! executable, then computes a [`TransportDescriptor`]; nothing is spawned or
//! connected here. The channel comes from configuration rather than being
//! allocated, so resolving the same inputs twice yields the same descriptor.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::SessionError;

const STDIO_FLAG: &str = "--stdio";
const SOCKET_FLAG: &str = "--socket";

/// A TCP endpoint, kept as host text so name resolution happens at connect
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketAddress {
    host: String,
    port: u16,
}

impl SocketAddress {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The channel that carries protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportMode {
    /// The server's stdin/stdout.
    Stdio,
    /// A TCP connection to a fixed address.
    Socket(SocketAddress),
}

/// Whether the client starts the server or finds it already running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    Spawn { program: PathBuf, args: Vec<String> },
    Attach,
}

/// Which launch flavour to build arguments for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LaunchProfile {
    #[default]
    Run,
    Debug,
}

/// Everything the session manager needs to open a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDescriptor {
    mode: TransportMode,
    launch: Launch,
}

impl TransportDescriptor {
    #[must_use]
    pub fn mode(&self) -> &TransportMode {
        &self.mode
    }

    #[must_use]
    pub fn launch(&self) -> &Launch {
        &self.launch
    }

    #[must_use]
    pub fn address(&self) -> Option<&SocketAddress> {
        match &self.mode {
            TransportMode::Socket(address) => Some(address),
            TransportMode::Stdio => None,
        }
    }

    #[must_use]
    pub fn program(&self) -> Option<&Path> {
        match &self.launch {
            Launch::Spawn { program, .. } => Some(program),
            Launch::Attach => None,
        }
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        match &self.launch {
            Launch::Spawn { args, .. } => args,
            Launch::Attach => &[],
        }
    }
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.launch, &self.mode) {
            (Launch::Spawn { program, .. }, TransportMode::Stdio) => {
                write!(f, "stdio via {}", program.display())
            }
            (Launch::Spawn { program, .. }, TransportMode::Socket(address)) => {
                write!(f, "socket {address} via {}", program.display())
            }
            (Launch::Attach, TransportMode::Socket(address)) => write!(f, "attach {address}"),
            (Launch::Attach, TransportMode::Stdio) => f.write_str("attach stdio"),
        }
    }
}

/// Run and debug descriptors for one server executable.
///
/// Both share a channel; they differ only in launch arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub run: TransportDescriptor,
    pub debug: TransportDescriptor,
}

impl ServerOptions {
    #[must_use]
    pub fn select(&self, profile: LaunchProfile) -> &TransportDescriptor {
        match profile {
            LaunchProfile::Run => &self.run,
            LaunchProfile::Debug => &self.debug,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransportResolver {
    base_args: Vec<String>,
    debug_args: Vec<String>,
}

impl TransportResolver {
    #[must_use]
    pub fn new(base_args: Vec<String>, debug_args: Vec<String>) -> Self {
        Self {
            base_args,
            debug_args,
        }
    }

    /// Resolve a spawn-and-connect descriptor for `executable`.
    ///
    /// Bare names are looked up on `PATH`; paths must point at an existing
    /// executable file.
    pub fn resolve(
        &self,
        executable: &Path,
        mode: &TransportMode,
        profile: LaunchProfile,
    ) -> Result<TransportDescriptor, SessionError> {
        let program = locate_executable(executable)?;
        Ok(TransportDescriptor {
            mode: mode.clone(),
            launch: Launch::Spawn {
                program,
                args: self.launch_args(mode, profile),
            },
        })
    }

    pub fn resolve_server_options(
        &self,
        executable: &Path,
        mode: &TransportMode,
    ) -> Result<ServerOptions, SessionError> {
        Ok(ServerOptions {
            run: self.resolve(executable, mode, LaunchProfile::Run)?,
            debug: self.resolve(executable, mode, LaunchProfile::Debug)?,
        })
    }

    /// Descriptor for attaching to a server that is already listening.
    pub fn attach(&self, mode: &TransportMode) -> Result<TransportDescriptor, SessionError> {
        match mode {
            TransportMode::Socket(_) => Ok(TransportDescriptor {
                mode: mode.clone(),
                launch: Launch::Attach,
            }),
            TransportMode::Stdio => Err(SessionError::InvalidConfig(
                "cannot attach to a running server over stdio".to_string(),
            )),
        }
    }

    fn launch_args(&self, mode: &TransportMode, profile: LaunchProfile) -> Vec<String> {
        let mut args = self.base_args.clone();
        match mode {
            TransportMode::Stdio => args.push(STDIO_FLAG.to_string()),
            TransportMode::Socket(address) => {
                args.push(format!("{SOCKET_FLAG}={}", address.port()));
            }
        }
        if profile == LaunchProfile::Debug {
            args.extend(self.debug_args.iter().cloned());
        }
        args
    }
}

fn locate_executable(executable: &Path) -> Result<PathBuf, SessionError> {
    which::which(executable).map_err(|source| SessionError::ServerNotFound {
        path: executable.to_path_buf(),
        source,
    })
}
