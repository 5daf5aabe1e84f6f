//! Spawn-and-connect launches using throwaway shell-script servers and the
//! `ferret-test-server` binary.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ferret_lsp::{
    DocumentId, EditorEvent, Forwarded, LaunchProfile, NoopWatcher, SessionError, SessionManager,
    SessionOptions, SessionState, SocketAddress, StopOutcome, TransportMode, TransportResolver,
};
use url::Url;

use crate::common::{drain_states, ferret_policy, free_port, options, script};

#[tokio::test]
async fn stdio_server_exiting_during_handshake_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let exe = script(&dir, "exit 3");
    let descriptor = TransportResolver::default()
        .resolve(&exe, &TransportMode::Stdio, LaunchProfile::Run)
        .unwrap();
    let (manager, mut events) = SessionManager::new(options(), Arc::new(NoopWatcher));

    let err = manager.start(&descriptor, ferret_policy()).await.unwrap_err();
    assert!(matches!(err, SessionError::TransportFailure { .. }), "{err:?}");
    assert_eq!(manager.state(), SessionState::Stopped);

    let states = drain_states(&mut events);
    assert_eq!(states, [SessionState::Starting, SessionState::Stopped]);
}

#[tokio::test]
async fn socket_server_exiting_before_listening_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let exe = script(&dir, "exit 1");
    let mode = TransportMode::Socket(SocketAddress::new("127.0.0.1", free_port().await));
    let descriptor = TransportResolver::default()
        .resolve(&exe, &mode, LaunchProfile::Run)
        .unwrap();
    let (manager, mut events) = SessionManager::new(options(), Arc::new(NoopWatcher));

    let err = manager.start(&descriptor, ferret_policy()).await.unwrap_err();
    match err {
        SessionError::TransportFailure { cause } => assert!(cause.contains("exited"), "{cause}"),
        other => panic!("expected TransportFailure, got {other:?}"),
    }
    assert!(!drain_states(&mut events).contains(&SessionState::Running));
}

#[tokio::test]
async fn spawned_server_gets_launch_args_and_workspace_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let exe = script(
        &dir,
        r#"out="$(dirname "$0")"
printf '%s\n' "$@" > "$out/args.txt"
pwd > "$out/cwd.txt"
exit 0"#,
    );
    let descriptor = TransportResolver::new(vec!["--log=trace".to_string()], vec!["--debug".to_string()])
        .resolve(&exe, &TransportMode::Stdio, LaunchProfile::Debug)
        .unwrap();
    let options = SessionOptions {
        workspace_root: Some(workspace.path().canonicalize().unwrap()),
        ..options()
    };
    let (manager, _events) = SessionManager::new(options, Arc::new(NoopWatcher));

    // The script exits without answering, so the start itself fails.
    assert!(manager.start(&descriptor, ferret_policy()).await.is_err());

    let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
    assert_eq!(args.lines().collect::<Vec<_>>(), ["--log=trace", "--stdio", "--debug"]);

    let cwd = std::fs::read_to_string(dir.path().join("cwd.txt")).unwrap();
    assert_eq!(
        PathBuf::from(cwd.trim()).canonicalize().unwrap(),
        workspace.path().canonicalize().unwrap()
    );
}

fn test_server() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_ferret-test-server"))
}

/// Whether a process with `pid` still exists (zombies included).
fn process_exists(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap()
        .success()
}

async fn run_to_graceful_stop(mode: TransportMode) {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("server.pid");
    let descriptor = TransportResolver::new(
        vec![format!("--pid-file={}", pid_file.display())],
        Vec::new(),
    )
    .resolve(test_server(), &mode, LaunchProfile::Run)
    .unwrap();
    let (manager, mut events) = SessionManager::new(options(), Arc::new(NoopWatcher));

    manager.start(&descriptor, ferret_policy()).await.unwrap();
    assert_eq!(manager.state(), SessionState::Running);

    let document = DocumentId::new(Url::parse("file:///w/main.fer").unwrap(), "ferret");
    let opened = EditorEvent::DocumentOpened {
        document,
        text: "let x = 1".to_string(),
    };
    assert_eq!(
        manager.notify(&opened).await.unwrap(),
        Forwarded::Sent("textDocument/didOpen")
    );

    assert_eq!(manager.stop().await, StopOutcome::Graceful);
    assert_eq!(
        drain_states(&mut events),
        [
            SessionState::Starting,
            SessionState::Running,
            SessionState::Stopping,
            SessionState::Stopped,
        ]
    );

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    assert!(!process_exists(pid.trim()), "server {pid} was not reaped");
}

#[tokio::test]
async fn spawned_socket_server_runs_and_exits_gracefully() {
    let port = free_port().await;
    run_to_graceful_stop(TransportMode::Socket(SocketAddress::new("127.0.0.1", port))).await;
}

#[tokio::test]
async fn spawned_stdio_server_runs_and_exits_gracefully() {
    run_to_graceful_stop(TransportMode::Stdio).await;
}

#[tokio::test]
async fn denylisted_variables_are_not_inherited() {
    let dir = tempfile::tempdir().unwrap();
    let exe = script(
        &dir,
        r#"out="$(dirname "$0")"
printf '%s' "${HOME-unset}" > "$out/home.txt"
printf '%s' "${PATH:+set}" > "$out/path.txt"
exit 0"#,
    );
    let descriptor = TransportResolver::default()
        .resolve(&exe, &TransportMode::Stdio, LaunchProfile::Run)
        .unwrap();
    let options = SessionOptions {
        env_denylist: vec!["hom*".to_string()],
        ..options()
    };
    let (manager, _events) = SessionManager::new(options, Arc::new(NoopWatcher));

    assert!(manager.start(&descriptor, ferret_policy()).await.is_err());

    let home = std::fs::read_to_string(dir.path().join("home.txt")).unwrap();
    assert_eq!(home, "unset");
    let path = std::fs::read_to_string(dir.path().join("path.txt")).unwrap();
    assert_eq!(path, "set");
}
