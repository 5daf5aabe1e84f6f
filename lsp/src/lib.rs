//! Editor-side client for the Ferret language server.
//!
//! Resolves how to reach the server, then supervises one session over it:
//! handshake, filtered document synchronization, and a clean shutdown.

pub mod codec;
pub mod config;
pub mod extension;
pub mod policy;
pub mod session;
pub mod transport;
pub mod types;
pub mod watch;

pub(crate) mod connection;
pub(crate) mod protocol;

mod error;

pub use config::{ClientConfig, TransportKind};
pub use error::SessionError;
pub use extension::{Activation, ExtensionContext, activate, deactivate};
pub use policy::{DocumentSelector, SyncPolicy};
pub use session::{SessionEvents, SessionManager, SessionOptions};
pub use transport::{
    Launch, LaunchProfile, ServerOptions, SocketAddress, TransportDescriptor, TransportMode,
    TransportResolver,
};
pub use types::{
    DocumentId, EditorEvent, FileChangeKind, Forwarded, ServerExitReason, SessionEvent,
    SessionState, StopOutcome,
};
pub use watch::{FileWatchService, NoopWatcher};
