//! Live connection to a language server.
//!
//! A connection owns the transport (a child process, a TCP stream, or both),
//! a writer task fed through a FIFO channel, and a reader task that routes
//! responses, answers server requests and surfaces notifications. Holding a
//! `Connection` means the initialize handshake succeeded.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::codec::{MessageReader, MessageWriter};
use crate::error::SessionError;
use crate::protocol::{self, Incoming, MessageType, Notification, Request, method};
use crate::session::{SessionOptions, publish};
use crate::transport::{Launch, SocketAddress, TransportDescriptor, TransportMode};
use crate::types::{EditorEvent, ServerExitReason, SessionEvent, StopOutcome};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const EXIT_STATUS_WAIT: Duration = Duration::from_millis(250);

const WRITER_CHANNEL_CAPACITY: usize = 64;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum WriterCommand {
    Send(Value),
    Close,
}

/// In-flight requests. Once `closed` is set no new waiter is accepted, so a
/// request issued after the server went away fails instead of hanging.
#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<Value>>,
    closed: bool,
}

type PendingMap = Arc<Mutex<Pending>>;

/// Glob match for env var denylist entries: `*_SUFFIX`, `PREFIX_*`,
/// `*_INFIX*`, `*` or an exact name. `key_upper` must already be uppercase.
fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    let (leading, rest) = match pat.strip_prefix('*') {
        Some(rest) => (true, rest),
        None => (false, pat.as_str()),
    };
    let (trailing, core) = match rest.strip_suffix('*') {
        Some(core) => (true, core),
        None => (false, rest),
    };
    match (leading, trailing) {
        (true, true) => key_upper.contains(core),
        (true, false) => key_upper.ends_with(core),
        (false, true) => key_upper.starts_with(core),
        (false, false) => key_upper == core,
    }
}

pub(crate) struct Connection {
    child: Option<Child>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: u64,
    pending: PendingMap,
    closed_rx: watch::Receiver<bool>,
    /// Open documents and the last version sent for each.
    versions: HashMap<Url, i32>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Connection {
    /// Open the transport described by `descriptor` and complete the
    /// initialize handshake, all within the handshake timeout.
    pub async fn establish(
        descriptor: &TransportDescriptor,
        options: &SessionOptions,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Result<Self> {
        let deadline = Instant::now() + options.handshake_timeout;
        let (child, reader, writer) = open_transport(descriptor, options, deadline).await?;
        let mut connection = Self::wire(child, reader, writer, event_tx);

        let root_uri = options
            .workspace_root
            .as_deref()
            .and_then(|root| Url::from_directory_path(root).ok());

        match tokio::time::timeout_at(deadline, connection.initialize(root_uri.as_ref())).await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(e)) => {
                let e = match connection.exit_status().await {
                    Some(status) => e.context(format!("language server exited with {status}")),
                    None => e,
                };
                connection.force_close().await;
                Err(e)
            }
            Err(_) => {
                connection.force_close().await;
                bail!(
                    "initialize handshake timed out after {}ms",
                    options.handshake_timeout.as_millis()
                )
            }
        }
    }

    fn wire(
        child: Option<Child>,
        reader: BoxedReader,
        writer: BoxedWriter,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let pending = PendingMap::default();
        let (closed_tx, closed_rx) = watch::channel(false);
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);

        let writer_handle = tokio::spawn(run_writer(MessageWriter::new(writer), writer_rx));
        let reader_handle = tokio::spawn(run_reader(
            MessageReader::new(reader),
            pending.clone(),
            writer_tx.clone(),
            event_tx,
            closed_tx,
        ));

        Self {
            child,
            writer_tx,
            next_id: 1,
            pending,
            closed_rx,
            versions: HashMap::new(),
            reader_handle,
            writer_handle,
        }
    }

    async fn initialize(&mut self, root_uri: Option<&Url>) -> Result<()> {
        let params = protocol::initialize_params(root_uri);
        let response = self.request(method::INITIALIZE, Some(params)).await?;

        if let Some(error) = response.get("error") {
            bail!(
                "server rejected initialize: {}",
                error["message"].as_str().unwrap_or("unknown error")
            );
        }

        self.notify(method::INITIALIZED, Some(serde_json::json!({})))
            .await
    }

    async fn request(&mut self, method: &'static str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                bail!("server closed the connection before {method}");
            }
            pending.waiters.insert(id, tx);
        }

        let frame = serde_json::to_value(Request::new(id, method, params))
            .context("serializing request")?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.waiters.remove(&id);
            bail!("transport writer closed before {method}");
        }

        rx.await
            .map_err(|_| anyhow!("server closed the connection before answering {method}"))
    }

    async fn notify(&self, method: &'static str, params: Option<Value>) -> Result<()> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .context("serializing notification")?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| anyhow!("transport writer closed before {method}"))
    }

    /// Translate an editor event into one notification and send it.
    ///
    /// Returns the method sent, or `None` when the event needs no
    /// notification (saving or closing a document the server never saw).
    pub async fn forward(&mut self, event: &EditorEvent) -> Result<Option<&'static str>> {
        let (name, params) = match event {
            EditorEvent::DocumentOpened { document, text }
            | EditorEvent::DocumentChanged { document, text } => {
                if let Some(version) = self.versions.get_mut(&document.uri) {
                    *version += 1;
                    (
                        method::DID_CHANGE,
                        protocol::did_change_params(&document.uri, *version, text),
                    )
                } else {
                    self.versions.insert(document.uri.clone(), 1);
                    (
                        method::DID_OPEN,
                        protocol::did_open_params(&document.uri, &document.language_id, 1, text),
                    )
                }
            }
            EditorEvent::DocumentSaved { document } => {
                if !self.versions.contains_key(&document.uri) {
                    return Ok(None);
                }
                (method::DID_SAVE, protocol::did_save_params(&document.uri))
            }
            EditorEvent::DocumentClosed { document } => {
                if self.versions.remove(&document.uri).is_none() {
                    return Ok(None);
                }
                (method::DID_CLOSE, protocol::did_close_params(&document.uri))
            }
            EditorEvent::FileChanged { uri, kind } => (
                method::DID_CHANGE_WATCHED_FILES,
                protocol::did_change_watched_files_params(uri, *kind),
            ),
        };

        self.notify(name, Some(params)).await?;
        Ok(Some(name))
    }

    /// Run the shutdown handshake, falling back to a forced close when the
    /// server misbehaves or `grace` runs out. Never fails.
    pub async fn shutdown(mut self, grace: Duration) -> StopOutcome {
        match tokio::time::timeout(grace, self.close_gracefully()).await {
            Ok(Ok(())) => {
                tracing::info!("Language server shut down cleanly");
                StopOutcome::Graceful
            }
            Ok(Err(e)) => {
                tracing::warn!("Language server shutdown handshake failed, forcing close: {e:#}");
                self.force_close().await;
                StopOutcome::Forced
            }
            Err(_) => {
                let err = SessionError::ShutdownTimeout { grace };
                tracing::warn!("{err}; forcing close");
                self.force_close().await;
                StopOutcome::Forced
            }
        }
    }

    async fn close_gracefully(&mut self) -> Result<()> {
        let response = self.request(method::SHUTDOWN, None).await?;
        if let Some(error) = response.get("error") {
            bail!(
                "server rejected shutdown: {}",
                error["message"].as_str().unwrap_or("unknown error")
            );
        }
        self.notify(method::EXIT, None).await?;
        let _ = self.writer_tx.send(WriterCommand::Close).await;

        match self.child.as_mut() {
            Some(child) => {
                let status = child
                    .wait()
                    .await
                    .context("waiting for language server to exit")?;
                tracing::debug!(%status, "Language server process exited");
            }
            None => {
                // Attached servers are confirmed gone once the stream ends.
                let _ = self.closed_rx.wait_for(|closed| *closed).await;
            }
        }
        Ok(())
    }

    async fn force_close(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
        if let Some(child) = self.child.as_mut()
            && let Err(e) = child.kill().await
        {
            tracing::debug!("Killing language server failed: {e}");
        }
    }

    async fn exit_status(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        tokio::time::timeout(EXIT_STATUS_WAIT, child.wait())
            .await
            .ok()?
            .ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The child is reaped by kill_on_drop; the tasks own the stream halves.
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

async fn open_transport(
    descriptor: &TransportDescriptor,
    options: &SessionOptions,
    deadline: Instant,
) -> Result<(Option<Child>, BoxedReader, BoxedWriter)> {
    match (descriptor.launch(), descriptor.mode()) {
        (Launch::Spawn { program, args }, TransportMode::Stdio) => {
            let mut child = spawn_server(program, args, options, true)?;
            let stdout = child
                .stdout
                .take()
                .context("no stdout from language server")?;
            let stdin = child.stdin.take().context("no stdin from language server")?;
            Ok((Some(child), Box::new(stdout), Box::new(stdin)))
        }
        (Launch::Spawn { program, args }, TransportMode::Socket(address)) => {
            let mut child = spawn_server(program, args, options, false)?;
            let stream = connect(address, Some(&mut child), deadline).await?;
            let (reader, writer) = stream.into_split();
            Ok((Some(child), Box::new(reader), Box::new(writer)))
        }
        (Launch::Attach, TransportMode::Socket(address)) => {
            let stream = connect(address, None, deadline).await?;
            let (reader, writer) = stream.into_split();
            Ok((None, Box::new(reader), Box::new(writer)))
        }
        (Launch::Attach, TransportMode::Stdio) => {
            bail!("cannot attach to a running server over stdio")
        }
    }
}

fn spawn_server(
    program: &Path,
    args: &[String],
    options: &SessionOptions,
    piped_stdio: bool,
) -> Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args).stderr(Stdio::piped()).kill_on_drop(true);
    if piped_stdio {
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null()).stdout(Stdio::null());
    }
    if let Some(root) = &options.workspace_root {
        cmd.current_dir(root);
    }

    for (key, _) in std::env::vars_os() {
        let upper = key.to_string_lossy().to_uppercase();
        if options
            .env_denylist
            .iter()
            .any(|pattern| env_glob_matches(pattern, &upper))
        {
            cmd.env_remove(&key);
        }
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {}", program.display()))?;
    tracing::info!(
        pid = ?child.id(),
        program = %program.display(),
        ?args,
        "Spawned language server"
    );

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(stderr));
    }
    Ok(child)
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "ferret_lsp::server", "{line}");
    }
}

/// Connect to `address`, retrying until it accepts, the spawned server
/// exits, or `deadline` passes.
async fn connect(
    address: &SocketAddress,
    mut child: Option<&mut Child>,
    deadline: Instant,
) -> Result<TcpStream> {
    loop {
        let attempt =
            tokio::time::timeout_at(deadline, TcpStream::connect((address.host(), address.port())))
                .await;
        let last_error = match attempt {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).context("configuring socket")?;
                tracing::debug!(%address, "Connected to language server");
                return Ok(stream);
            }
            Ok(Err(e)) => e,
            Err(_) => bail!("timed out connecting to language server at {address}"),
        };

        if let Some(child) = child.as_deref_mut()
            && let Some(status) = child
                .try_wait()
                .context("polling language server process")?
        {
            bail!("language server exited with {status} before accepting connections on {address}");
        }

        if Instant::now() + CONNECT_RETRY_INTERVAL >= deadline {
            return Err(last_error)
                .with_context(|| format!("connecting to language server at {address}"));
        }
        tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
    }
}

async fn run_writer(
    mut writer: MessageWriter<BoxedWriter>,
    mut commands: mpsc::Receiver<WriterCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send(message) => {
                if let Err(e) = writer.send(&message).await {
                    tracing::warn!("Language server write failed: {e}");
                    break;
                }
            }
            WriterCommand::Close => {
                if let Err(e) = writer.close().await {
                    tracing::debug!("Closing language server transport failed: {e}");
                }
                break;
            }
        }
    }
}

async fn run_reader(
    mut reader: MessageReader<BoxedReader>,
    pending: PendingMap,
    writer_tx: mpsc::Sender<WriterCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
    closed_tx: watch::Sender<bool>,
) {
    let reason = loop {
        match reader.next_message().await {
            Ok(Some(message)) => dispatch(&message, &pending, &writer_tx, &event_tx).await,
            Ok(None) => {
                tracing::info!("Language server closed the transport");
                break ServerExitReason::Exited;
            }
            Err(e) => {
                tracing::warn!("Language server read failed: {e}");
                break ServerExitReason::Failed(e.to_string());
            }
        }
    };

    {
        let mut pending = pending.lock().await;
        pending.closed = true;
        pending.waiters.clear();
    }
    publish(&event_tx, SessionEvent::ServerExited { reason });
    closed_tx.send_replace(true);
}

async fn dispatch(
    message: &Value,
    pending: &Mutex<Pending>,
    writer_tx: &mpsc::Sender<WriterCommand>,
    event_tx: &mpsc::Sender<SessionEvent>,
) {
    let Some(incoming) = Incoming::parse(message) else {
        tracing::trace!("Ignoring malformed message from language server");
        return;
    };

    match incoming {
        Incoming::Response { id, body } => {
            let waiter = pending.lock().await.waiters.remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(body);
                }
                None => tracing::debug!(id, "Response for unknown request"),
            }
        }
        Incoming::Request { id, method, params } => {
            tracing::debug!(%method, "Language server request");
            let reply = protocol::server_request_reply(id, &method, params.as_ref());
            let _ = writer_tx.send(WriterCommand::Send(reply)).await;
        }
        Incoming::Notification { method: name, params } => {
            if name == method::LOG_MESSAGE {
                log_server_message(params.as_ref());
            }
            publish(event_tx, SessionEvent::ServerNotification { method: name, params });
        }
    }
}

fn log_server_message(params: Option<&Value>) {
    let Some(params) = params else { return };
    let message = params
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let level = params
        .get("type")
        .and_then(Value::as_u64)
        .and_then(MessageType::from_code);

    match level {
        Some(MessageType::Error) => tracing::error!(target: "ferret_lsp::server", "{message}"),
        Some(MessageType::Warning) => tracing::warn!(target: "ferret_lsp::server", "{message}"),
        Some(MessageType::Info) => tracing::info!(target: "ferret_lsp::server", "{message}"),
        Some(MessageType::Log) | None => {
            tracing::debug!(target: "ferret_lsp::server", "{message}");
        }
    }
}
