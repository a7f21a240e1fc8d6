mod support;

use langbridge_core::adapter::DocumentRef;
use langbridge_core::protocol::{Message, Notification, Request, RequestId, RpcError};
use langbridge_core::{
    BackendDescriptor, BackendSession, BridgeError, DiagnosticFilter, ErrorKind, ProtocolFamily,
    SessionEvent, SessionState, Severity,
};
use serde_json::json;
use std::time::Duration;
use support::{Script, ScriptedLauncher, session_options};
use tokio::sync::mpsc;

fn descriptor() -> BackendDescriptor {
    BackendDescriptor::new(ProtocolFamily::Lsp, "pylsp", "/proj", "py")
}

const LONG: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_start_runs_handshake() {
    let launcher = ScriptedLauncher::new(Script::lsp());
    let session = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.capabilities().supports("hoverProvider"));
    assert_eq!(
        session.capabilities().server_info.unwrap()["name"],
        "scripted"
    );

    let backend = launcher.last_backend();
    backend
        .wait_for(|messages| {
            messages
                .iter()
                .any(|m| matches!(m, Message::Notification(n) if n.method == "initialized"))
        })
        .await;
    assert_eq!(backend.methods(), vec!["initialize", "initialized"]);
}

#[tokio::test]
async fn test_handshake_rejection_keeps_backend_detail() {
    let launcher = ScriptedLauncher::new(
        Script::lsp().rejecting_handshake(RpcError::new(-32002, "server not initialized")),
    );
    let err = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::HandshakeError);
    let detail = err.backend_detail().unwrap();
    assert_eq!(detail.code, Some(-32002));
    assert_eq!(detail.message, "server not initialized");
}

#[tokio::test]
async fn test_spawn_failure_is_handshake_error() {
    let launcher = ScriptedLauncher::new(Script::lsp().failing_spawn());
    let err = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeError);
}

#[tokio::test]
async fn test_exit_during_handshake_is_handshake_error() {
    let launcher = ScriptedLauncher::new(Script::lsp().exiting_on_initialize(3));
    let err = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::HandshakeError);
    assert!(err.to_string().contains("code 3"), "{}", err);
}

#[tokio::test]
async fn test_replies_pair_by_id_in_any_order() {
    let launcher = ScriptedLauncher::new(
        Script::lsp()
            .with_delay("slow/method", Duration::from_millis(100))
            .with_result("slow/method", json!("slow"))
            .with_result("fast/method", json!("fast")),
    );
    let session = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap();

    let slow = session
        .send_request("slow/method", json!({}), None, LONG)
        .await
        .unwrap();
    let fast = session
        .send_request("fast/method", json!({}), None, LONG)
        .await
        .unwrap();
    assert_ne!(slow.id(), fast.id());

    assert_eq!(fast.recv().await.unwrap().unwrap(), json!("fast"));
    assert_eq!(slow.recv().await.unwrap().unwrap(), json!("slow"));
}

#[tokio::test]
async fn test_native_error_is_returned_as_reply() {
    let launcher = ScriptedLauncher::new(Script::lsp().with_error(
        "textDocument/hover",
        RpcError::new(-32801, "content modified").with_data(json!({"retry": true})),
    ));
    let session = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap();

    let reply = session
        .send_request("textDocument/hover", json!({}), None, LONG)
        .await
        .unwrap()
        .recv()
        .await
        .unwrap();
    let error = reply.unwrap_err();
    assert_eq!(error.code, -32801);
    assert_eq!(error.data, Some(json!({"retry": true})));
}

#[tokio::test]
async fn test_timeout_leaves_siblings_alone() {
    let launcher = ScriptedLauncher::new(Script::lsp().holding("textDocument/definition"));
    let session = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap();

    let stuck = session
        .send_request(
            "textDocument/definition",
            json!({}),
            Some("agent-1".to_string()),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    let stuck_id = stuck.id().clone();
    let sibling = session
        .send_request("textDocument/hover", json!({}), None, LONG)
        .await
        .unwrap();

    assert_eq!(stuck.recv().await.unwrap_err(), BridgeError::timeout(100));
    assert!(sibling.recv().await.unwrap().is_ok());
    assert_eq!(session.state(), SessionState::Ready);

    let backend = launcher.last_backend();
    backend
        .wait_for(|messages| {
            messages.iter().any(|m| {
                matches!(m, Message::Notification(n)
                    if n.method == "$/cancelRequest"
                        && n.params.as_ref().map(|p| &p["id"]) == Some(&json!(stuck_id)))
            })
        })
        .await;
}

#[tokio::test]
async fn test_late_reply_is_discarded_as_trace() {
    let launcher = ScriptedLauncher::new(
        Script::lsp().with_delay("textDocument/hover", Duration::from_millis(150)),
    );
    let options = session_options();
    let diagnostics = options.diagnostics.clone();
    let session = BackendSession::start(descriptor(), launcher.as_ref(), options)
        .await
        .unwrap();

    let pending = session
        .send_request("textDocument/hover", json!({}), None, Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(pending.recv().await.unwrap_err().kind(), ErrorKind::TimeoutError);

    let mut discarded = false;
    for _ in 0..100 {
        let snapshot = diagnostics.snapshot(DiagnosticFilter::default());
        if snapshot
            .iter()
            .any(|e| e.severity == Severity::Trace && e.message.contains("discarded reply"))
        {
            discarded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(discarded);
    assert!(session.is_ready());
}

#[tokio::test]
async fn test_crash_fails_every_pending_request() {
    let launcher = ScriptedLauncher::new(Script::lsp().holding("textDocument/hover"));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut options = session_options();
    options.events = Some(events_tx);
    options.generation = 7;
    let session = BackendSession::start(descriptor(), launcher.as_ref(), options)
        .await
        .unwrap();

    let mut pending = Vec::new();
    for _ in 0..3 {
        pending.push(
            session
                .send_request("textDocument/hover", json!({}), None, LONG)
                .await
                .unwrap(),
        );
    }
    let backend = launcher.last_backend();
    backend
        .wait_for(|messages| {
            messages
                .iter()
                .filter(|m| matches!(m, Message::Request(r) if r.method == "textDocument/hover"))
                .count()
                == 3
        })
        .await;

    backend.crash(1);

    for reply in pending {
        let err = reply.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert!(err.to_string().contains("code 1"), "{}", err);
    }
    assert_eq!(session.state(), SessionState::Crashed);

    match events_rx.recv().await.unwrap() {
        SessionEvent::Crashed {
            key, generation, ..
        } => {
            assert_eq!(key, descriptor().key());
            assert_eq!(generation, 7);
        }
    }

    let err = session
        .send_request("textDocument/hover", json!({}), None, LONG)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
}

#[tokio::test]
async fn test_cancel_resolves_with_cancelled() {
    let launcher = ScriptedLauncher::new(Script::lsp().holding("textDocument/hover"));
    let session = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap();

    let pending = session
        .send_request("textDocument/hover", json!({}), None, LONG)
        .await
        .unwrap();
    let id = pending.id().clone();
    session.cancel(&id).await;

    assert_eq!(pending.recv().await.unwrap_err(), BridgeError::Cancelled);
    launcher
        .last_backend()
        .wait_for(|messages| {
            messages
                .iter()
                .any(|m| matches!(m, Message::Notification(n) if n.method == "$/cancelRequest"))
        })
        .await;
}

#[tokio::test]
async fn test_shutdown_runs_protocol_exchange() {
    let launcher = ScriptedLauncher::new(Script::lsp());
    let session = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap();
    let mut states = session.subscribe_state();

    session.shutdown().await;

    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(*states.borrow_and_update(), SessionState::Terminated);
    let methods = launcher.last_backend().methods();
    assert_eq!(&methods[methods.len() - 2..], &["shutdown", "exit"]);

    let err = session
        .send_request("textDocument/hover", json!({}), None, LONG)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
}

#[tokio::test]
async fn test_draining_refuses_new_requests_but_delivers_in_flight_replies() {
    let launcher = ScriptedLauncher::new(
        Script::lsp().with_delay("textDocument/hover", Duration::from_millis(200)),
    );
    let session = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap();

    let in_flight = session
        .send_request("textDocument/hover", json!({"n": 1}), None, LONG)
        .await
        .unwrap();
    let mut states = session.subscribe_state();
    let shutdown = {
        let session = session.clone();
        tokio::spawn(async move { session.shutdown().await })
    };
    states
        .wait_for(|state| *state == SessionState::Draining)
        .await
        .unwrap();

    let refused = session
        .send_request("textDocument/hover", json!({"n": 2}), None, LONG)
        .await
        .unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::BackendUnavailable);

    assert!(in_flight.recv().await.unwrap().is_ok());
    shutdown.await.unwrap();
    assert_eq!(session.state(), SessionState::Terminated);

    let methods = launcher.last_backend().methods();
    assert_eq!(
        &methods[methods.len() - 3..],
        &["textDocument/hover", "shutdown", "exit"]
    );
    assert_eq!(launcher.last_backend().requests("textDocument/hover").len(), 1);
}

#[tokio::test]
async fn test_unbounded_timeout_is_accepted() {
    let launcher = ScriptedLauncher::new(Script::lsp());
    let session = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap();

    let reply = session
        .send_request("textDocument/hover", json!({}), None, Duration::MAX)
        .await
        .unwrap();
    assert!(reply.recv().await.unwrap().is_ok());

    let again = session
        .send_request("textDocument/hover", json!({}), None, LONG)
        .await
        .unwrap();
    assert!(again.recv().await.unwrap().is_ok());
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_mcp_shutdown_closes_stdin() {
    let launcher = ScriptedLauncher::new(Script::mcp());
    let descriptor = BackendDescriptor::new(ProtocolFamily::Mcp, "tool-server", "/proj", "tools");
    let session = BackendSession::start(descriptor, launcher.as_ref(), session_options())
        .await
        .unwrap();

    session.shutdown().await;

    assert_eq!(session.state(), SessionState::Terminated);
    let methods = launcher.last_backend().methods();
    assert_eq!(methods, vec!["initialize", "notifications/initialized"]);
}

#[tokio::test]
async fn test_backend_requests_are_answered() {
    let launcher = ScriptedLauncher::new(Script::lsp());
    let _session = BackendSession::start(descriptor(), launcher.as_ref(), session_options())
        .await
        .unwrap();
    let backend = launcher.last_backend();

    backend.send(
        Request::new(900, "workspace/configuration")
            .with_params(json!({ "items": [{ "section": "pylsp" }] })),
    );
    backend.send(Request::new(901, "custom/unknown"));

    backend
        .wait_for(|messages| {
            messages
                .iter()
                .filter(|m| matches!(m, Message::Response(_)))
                .count()
                == 2
        })
        .await;

    let responses = backend.responses();
    let configuration = responses
        .iter()
        .find(|r| r.id == RequestId::Number(900))
        .unwrap();
    assert_eq!(configuration.result.as_ref().unwrap().as_array().unwrap().len(), 1);
    let unknown = responses
        .iter()
        .find(|r| r.id == RequestId::Number(901))
        .unwrap();
    assert_eq!(unknown.error.as_ref().unwrap().code, -32601);
}

#[tokio::test]
async fn test_published_diagnostics_reach_aggregator() {
    let launcher = ScriptedLauncher::new(Script::lsp());
    let options = session_options();
    let diagnostics = options.diagnostics.clone();
    let _session = BackendSession::start(descriptor(), launcher.as_ref(), options)
        .await
        .unwrap();

    launcher.last_backend().send(
        Notification::new("textDocument/publishDiagnostics").with_params(json!({
            "uri": "file:///proj/a.py",
            "diagnostics": [{
                "range": {
                    "start": { "line": 2, "character": 4 },
                    "end": { "line": 2, "character": 9 },
                },
                "severity": 1,
                "source": "pyflakes",
                "message": "undefined name 'x'",
            }],
        })),
    );

    let mut events = Vec::new();
    for _ in 0..100 {
        events = diagnostics
            .snapshot(DiagnosticFilter::default().min_severity(Severity::Error))
            .iter()
            .cloned()
            .collect::<Vec<_>>();
        if !events.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].backend, "py@/proj");
    assert_eq!(events[0].message, "undefined name 'x'");
    let location = events[0].location.as_ref().unwrap();
    assert_eq!((location.line, location.column), (3, 5));
}

#[tokio::test]
async fn test_document_opened_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.py");
    std::fs::write(&path, "def f(x: int) -> int:\n    return x\n").unwrap();

    let launcher = ScriptedLauncher::new(Script::lsp());
    let descriptor = BackendDescriptor::new(ProtocolFamily::Lsp, "pylsp", dir.path(), "py");
    let session = BackendSession::start(descriptor, launcher.as_ref(), session_options())
        .await
        .unwrap();

    let document = DocumentRef {
        path: path.clone(),
        uri: url::Url::from_file_path(&path).unwrap().to_string(),
    };
    session.ensure_document_open(&document).await.unwrap();
    session.ensure_document_open(&document).await.unwrap();

    let missing = DocumentRef {
        path: dir.path().join("missing.py"),
        uri: "file:///missing.py".to_string(),
    };
    session.ensure_document_open(&missing).await.unwrap();

    let backend = launcher.last_backend();
    backend
        .wait_for(|messages| {
            messages
                .iter()
                .any(|m| matches!(m, Message::Notification(n) if n.method == "textDocument/didOpen"))
        })
        .await;
    // Round trip so any stray notification would have arrived
    session
        .send_request("textDocument/hover", json!({}), None, LONG)
        .await
        .unwrap()
        .recv()
        .await
        .unwrap()
        .unwrap();

    let opened = backend.notifications("textDocument/didOpen");
    assert_eq!(opened.len(), 1);
    let params = opened[0].params.as_ref().unwrap();
    assert_eq!(params["textDocument"]["uri"], document.uri);
    assert_eq!(params["textDocument"]["languageId"], "py");
    assert!(params["textDocument"]["text"].as_str().unwrap().contains("return x"));
}
