//! Session lifecycle against an in-process fake server.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ferret_lsp::{
    DocumentId, EditorEvent, FileChangeKind, Forwarded, NoopWatcher, SessionError, SessionEvent,
    SessionManager, SessionOptions, SessionState, StopOutcome,
};
use serde_json::json;
use url::Url;

use crate::common::{
    FakeServer, Mode, RecordingWatcher, drain_states, ferret_policy, options,
};

fn ferret_doc(name: &str) -> DocumentId {
    DocumentId::new(Url::parse(&format!("file:///w/{name}")).unwrap(), "ferret")
}

fn opened(document: DocumentId, text: &str) -> EditorEvent {
    EditorEvent::DocumentOpened {
        document,
        text: text.to_string(),
    }
}

#[tokio::test]
async fn matching_events_are_forwarded_in_order() {
    let server = FakeServer::start(Mode::Cooperative).await;
    let (manager, mut events) = SessionManager::new(options(), Arc::new(NoopWatcher));

    manager
        .start(&server.attach_descriptor(), ferret_policy())
        .await
        .unwrap();
    assert_eq!(manager.state(), SessionState::Running);

    let main = ferret_doc("main.fer");
    let rust = DocumentId::new(Url::parse("file:///w/main.rs").unwrap(), "rust");
    let outcomes = [
        manager.notify(&opened(main.clone(), "let x = 1")).await,
        manager.notify(&opened(rust, "fn main() {}")).await,
        manager
            .notify(&EditorEvent::DocumentChanged {
                document: main.clone(),
                text: "let x = 2".to_string(),
            })
            .await,
        manager
            .notify(&EditorEvent::FileChanged {
                uri: Url::parse("file:///w/lib/core.wal").unwrap(),
                kind: FileChangeKind::Changed,
            })
            .await,
        manager
            .notify(&EditorEvent::FileChanged {
                uri: Url::parse("file:///w/README.md").unwrap(),
                kind: FileChangeKind::Changed,
            })
            .await,
        manager
            .notify(&EditorEvent::DocumentSaved { document: main })
            .await,
    ];
    let outcomes: Vec<_> = outcomes.into_iter().map(Result::unwrap).collect();
    assert_eq!(
        outcomes,
        [
            Forwarded::Sent("textDocument/didOpen"),
            Forwarded::Filtered,
            Forwarded::Sent("textDocument/didChange"),
            Forwarded::Sent("workspace/didChangeWatchedFiles"),
            Forwarded::Filtered,
            Forwarded::Sent("textDocument/didSave"),
        ]
    );

    assert_eq!(manager.stop().await, StopOutcome::Graceful);
    assert_eq!(manager.state(), SessionState::Stopped);

    assert_eq!(
        server.methods(),
        [
            "initialize",
            "initialized",
            "textDocument/didOpen",
            "textDocument/didChange",
            "workspace/didChangeWatchedFiles",
            "textDocument/didSave",
            "shutdown",
            "exit",
        ]
    );
    assert_eq!(
        drain_states(&mut events),
        [
            SessionState::Starting,
            SessionState::Running,
            SessionState::Stopping,
            SessionState::Stopped,
        ]
    );
}

#[tokio::test]
async fn initialize_carries_workspace_root() {
    let server = FakeServer::start(Mode::Cooperative).await;
    let root = tempfile::tempdir().unwrap();
    let root_path = root.path().canonicalize().unwrap();
    let options = SessionOptions {
        workspace_root: Some(root_path.clone()),
        ..options()
    };
    let (manager, _events) = SessionManager::new(options, Arc::new(NoopWatcher));

    manager
        .start(&server.attach_descriptor(), ferret_policy())
        .await
        .unwrap();
    let initialize = server.wait_for_method("initialize").await;
    let expected = Url::from_directory_path(&root_path).unwrap();
    assert_eq!(initialize["params"]["rootUri"], expected.as_str());

    manager.stop().await;
}

#[tokio::test]
async fn second_start_is_rejected_without_new_transport() {
    let server = FakeServer::start(Mode::Cooperative).await;
    let (manager, _events) = SessionManager::new(options(), Arc::new(NoopWatcher));
    let descriptor = server.attach_descriptor();

    manager.start(&descriptor, ferret_policy()).await.unwrap();
    let err = manager.start(&descriptor, ferret_policy()).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::AlreadyStarted {
            state: SessionState::Running
        }
    ));
    assert_eq!(server.connections(), 1);
    assert_eq!(manager.state(), SessionState::Running);

    manager.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let server = FakeServer::start(Mode::Cooperative).await;
    let (manager, _events) = SessionManager::new(options(), Arc::new(NoopWatcher));

    assert_eq!(manager.stop().await, StopOutcome::NotRunning);
    manager
        .start(&server.attach_descriptor(), ferret_policy())
        .await
        .unwrap();
    assert_eq!(manager.stop().await, StopOutcome::Graceful);
    assert_eq!(manager.stop().await, StopOutcome::NotRunning);
    assert_eq!(manager.state(), SessionState::Stopped);
}

#[tokio::test]
async fn concurrent_stops_both_finish_stopped() {
    let server = FakeServer::start(Mode::Cooperative).await;
    let (manager, _events) = SessionManager::new(options(), Arc::new(NoopWatcher));
    manager
        .start(&server.attach_descriptor(), ferret_policy())
        .await
        .unwrap();

    let (first, second) = tokio::join!(manager.stop(), manager.stop());
    let mut outcomes = [first, second];
    outcomes.sort_by_key(|outcome| *outcome == StopOutcome::NotRunning);
    assert_eq!(outcomes, [StopOutcome::Graceful, StopOutcome::NotRunning]);
    assert_eq!(manager.state(), SessionState::Stopped);
}

#[tokio::test]
async fn stop_during_pending_start_cancels_it() {
    let server = FakeServer::start(Mode::SilentInitialize).await;
    let (manager, mut events) = SessionManager::new(options(), Arc::new(NoopWatcher));

    let start = tokio::spawn({
        let manager = manager.clone();
        let descriptor = server.attach_descriptor();
        async move { manager.start(&descriptor, ferret_policy()).await }
    });
    server.wait_for_method("initialize").await;
    assert_eq!(manager.state(), SessionState::Starting);

    assert_eq!(manager.stop().await, StopOutcome::Cancelled);
    assert!(matches!(
        start.await.unwrap(),
        Err(SessionError::Cancelled)
    ));
    assert_eq!(manager.state(), SessionState::Stopped);

    let states = drain_states(&mut events);
    assert!(!states.contains(&SessionState::Running), "{states:?}");
    assert_eq!(states.last(), Some(&SessionState::Stopped));
}

#[tokio::test]
async fn rejected_initialize_is_transport_failure() {
    let server = FakeServer::start(Mode::RejectInitialize).await;
    let (manager, mut events) = SessionManager::new(options(), Arc::new(NoopWatcher));

    let err = manager
        .start(&server.attach_descriptor(), ferret_policy())
        .await
        .unwrap_err();
    match err {
        SessionError::TransportFailure { cause } => {
            assert!(cause.contains("workspace unsupported"), "{cause}");
        }
        other => panic!("expected TransportFailure, got {other:?}"),
    }
    assert_eq!(manager.state(), SessionState::Stopped);
    assert!(!drain_states(&mut events).contains(&SessionState::Running));
}

#[tokio::test]
async fn handshake_timeout_is_transport_failure() {
    let server = FakeServer::start(Mode::SilentInitialize).await;
    let options = SessionOptions {
        handshake_timeout: Duration::from_millis(200),
        ..options()
    };
    let (manager, _events) = SessionManager::new(options, Arc::new(NoopWatcher));

    let err = manager
        .start(&server.attach_descriptor(), ferret_policy())
        .await
        .unwrap_err();
    match err {
        SessionError::TransportFailure { cause } => assert!(cause.contains("timed out"), "{cause}"),
        other => panic!("expected TransportFailure, got {other:?}"),
    }
    assert_eq!(manager.state(), SessionState::Stopped);
}

#[tokio::test]
async fn ignored_shutdown_is_forced_within_grace() {
    let server = FakeServer::start(Mode::IgnoreShutdown).await;
    let options = SessionOptions {
        shutdown_grace: Duration::from_millis(200),
        ..options()
    };
    let (manager, _events) = SessionManager::new(options, Arc::new(NoopWatcher));
    manager
        .start(&server.attach_descriptor(), ferret_policy())
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), manager.stop())
        .await
        .unwrap();
    assert_eq!(outcome, StopOutcome::Forced);
    assert_eq!(manager.state(), SessionState::Stopped);
}

#[tokio::test]
async fn stop_is_bounded_when_server_stops_reading() {
    let server = FakeServer::start(Mode::StopReading).await;
    let options = SessionOptions {
        shutdown_grace: Duration::from_millis(300),
        ..options()
    };
    let (manager, _events) = SessionManager::new(options, Arc::new(NoopWatcher));
    manager
        .start(&server.attach_descriptor(), ferret_policy())
        .await
        .unwrap();
    server.wait_for_method("initialized").await;

    // Large edits fill the socket buffers and then the writer queue.
    let flooder = tokio::spawn({
        let manager = manager.clone();
        async move {
            let document = ferret_doc("huge.fer");
            let text = "x".repeat(256 * 1024);
            loop {
                let event = EditorEvent::DocumentChanged {
                    document: document.clone(),
                    text: text.clone(),
                };
                if let Err(err) = manager.notify(&event).await {
                    break err;
                }
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!flooder.is_finished());

    let outcome = tokio::time::timeout(Duration::from_secs(5), manager.stop())
        .await
        .expect("stop outlived the shutdown grace period");
    assert_eq!(outcome, StopOutcome::Forced);
    assert_eq!(manager.state(), SessionState::Stopped);

    let err = tokio::time::timeout(Duration::from_secs(5), flooder)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, SessionError::NotRunning { .. }), "{err:?}");
}

#[tokio::test]
async fn watch_patterns_are_registered_for_the_session() {
    let server = FakeServer::start(Mode::Cooperative).await;
    let watcher = Arc::new(RecordingWatcher::default());
    let (manager, _events) = SessionManager::new(options(), watcher.clone());

    manager
        .start(&server.attach_descriptor(), ferret_policy())
        .await
        .unwrap();
    assert_eq!(
        *watcher.registered.lock().unwrap(),
        [vec!["**/*.wal".to_string()]]
    );
    assert_eq!(watcher.unregistered.load(Ordering::SeqCst), 0);

    manager.stop().await;
    assert_eq!(watcher.unregistered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_traffic_is_answered_and_surfaced() {
    let server = FakeServer::start_with(
        Mode::Cooperative,
        vec![
            json!({
                "jsonrpc": "2.0",
                "id": "cfg-1",
                "method": "workspace/configuration",
                "params": { "items": [{ "section": "ferret" }, { "section": "wal" }] }
            }),
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "ferret/unknownRequest"
            }),
            json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": { "uri": "file:///w/main.fer", "diagnostics": [] }
            }),
        ],
    )
    .await;
    let (manager, mut events) = SessionManager::new(options(), Arc::new(NoopWatcher));
    manager
        .start(&server.attach_descriptor(), ferret_policy())
        .await
        .unwrap();

    let config_reply = server
        .wait_for(|message| message["id"] == "cfg-1" && message.get("method").is_none())
        .await;
    assert_eq!(config_reply["result"], json!([null, null]));

    let unknown_reply = server
        .wait_for(|message| message["id"] == 7 && message.get("method").is_none())
        .await;
    assert_eq!(unknown_reply["error"]["code"], -32601);

    let notification = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.next().await {
                Some(SessionEvent::ServerNotification { method, params }) => {
                    break (method, params);
                }
                Some(_) => {}
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(notification.0, "textDocument/publishDiagnostics");
    assert_eq!(notification.1.unwrap()["uri"], "file:///w/main.fer");

    manager.stop().await;
}

#[tokio::test]
async fn notify_after_stop_is_rejected() {
    let server = FakeServer::start(Mode::Cooperative).await;
    let (manager, _events) = SessionManager::new(options(), Arc::new(NoopWatcher));
    manager
        .start(&server.attach_descriptor(), ferret_policy())
        .await
        .unwrap();
    manager.stop().await;

    let err = manager
        .notify(&opened(ferret_doc("main.fer"), ""))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::NotRunning {
            state: SessionState::Stopped
        }
    ));
}
