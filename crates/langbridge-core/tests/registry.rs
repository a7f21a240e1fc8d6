mod support;

use langbridge_core::{
    BackendKey, BackendRegistry, DiagnosticsAggregator, ErrorKind, SessionState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{Script, ScriptedLauncher, config, init_tracing};
use tokio::time::Instant;

fn registry(launcher: &Arc<ScriptedLauncher>, eager: bool, max_restarts: u32) -> Arc<BackendRegistry> {
    init_tracing();
    BackendRegistry::from_config(
        Arc::new(config(eager, max_restarts)),
        launcher.clone(),
        DiagnosticsAggregator::new(64),
    )
}

fn py() -> BackendKey {
    BackendKey::new("/proj", "py")
}

const LONG: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_concurrent_callers_share_one_spawn() {
    let launcher =
        ScriptedLauncher::new(Script::lsp().with_launch_delay(Duration::from_millis(50)));
    let registry = registry(&launcher, false, 3);

    let key = py();
    let (a, b) = tokio::join!(registry.get_or_create(&key), registry.get_or_create(&key));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(launcher.spawn_count(), 1);
    assert_eq!(a.generation(), b.generation());
    assert!(a.is_ready());
}

#[tokio::test]
async fn test_distinct_keys_get_distinct_sessions() {
    let launcher =
        ScriptedLauncher::new(Script::lsp().with_launch_delay(Duration::from_millis(50)));
    let registry = registry(&launcher, false, 3);

    let first = py();
    let second = BackendKey::new("/other", "py");
    let (a, b) = tokio::join!(
        registry.get_or_create(&first),
        registry.get_or_create(&second)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(launcher.spawn_count(), 2);
    assert_eq!(a.key(), &first);
    assert_eq!(b.key(), &second);
    assert_ne!(a.generation(), b.generation());

    let roots: Vec<_> = launcher
        .descriptors()
        .into_iter()
        .map(|d| d.root.display().to_string())
        .collect();
    assert!(roots.contains(&"/proj".to_string()));
    assert!(roots.contains(&"/other".to_string()));
}

#[tokio::test]
async fn test_crash_evicts_and_next_request_respawns() {
    let launcher = ScriptedLauncher::new(Script::lsp().holding("textDocument/hover"));
    let registry = registry(&launcher, false, 3);
    let key = py();

    let session = registry.get_or_create(&key).await.unwrap();
    let mut pending = Vec::new();
    for _ in 0..3 {
        pending.push(
            session
                .send_request("textDocument/hover", json!({}), None, LONG)
                .await
                .unwrap(),
        );
    }
    launcher.last_backend().crash(1);

    for reply in pending {
        assert_eq!(
            reply.recv().await.unwrap_err().kind(),
            ErrorKind::BackendUnavailable
        );
    }
    assert_eq!(session.state(), SessionState::Crashed);

    let replacement = registry.get_or_create(&key).await.unwrap();
    assert_eq!(launcher.spawn_count(), 2);
    assert_ne!(replacement.generation(), session.generation());
    assert!(replacement.is_ready());
}

#[tokio::test]
async fn test_restart_exhaustion_fails_fast_until_reset() {
    let launcher = ScriptedLauncher::new(Script::lsp().failing_spawn());
    let registry = registry(&launcher, false, 2);
    let key = py();

    for _ in 0..3 {
        let err = registry.get_or_create(&key).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandshakeError);
    }
    assert_eq!(launcher.spawn_count(), 3);

    let err = registry.get_or_create(&key).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    assert!(err.to_string().contains("failed to spawn"), "{}", err);
    assert_eq!(launcher.spawn_count(), 3);

    let status = &registry.snapshot()[0];
    assert!(status.permanently_failed);
    assert_eq!(status.status, "failed");
    assert_eq!(status.failures, 3);

    launcher.set_script(Script::lsp());
    assert!(registry.reset(&key).await);
    let session = registry.get_or_create(&key).await.unwrap();
    assert!(session.is_ready());
    assert_eq!(launcher.spawn_count(), 4);
}

#[tokio::test]
async fn test_eager_restart_after_crash() {
    let launcher = ScriptedLauncher::new(Script::lsp());
    let registry = registry(&launcher, true, 3);
    let key = py();

    let first = registry.get_or_create(&key).await.unwrap();
    launcher.last_backend().crash(1);

    let mut restarted = None;
    for _ in 0..200 {
        if let Some(session) = registry.session(&key) {
            if session.generation() != first.generation() {
                restarted = Some(session);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let restarted = restarted.expect("backend was not restarted");
    assert!(restarted.is_ready());
    assert_eq!(launcher.spawn_count(), 2);

    let status = &registry.snapshot()[0];
    assert_eq!(status.failures, 1);
    assert_eq!(status.status, "ready");
}

#[tokio::test]
async fn test_evict_shuts_down_and_forgets() {
    let launcher = ScriptedLauncher::new(Script::lsp());
    let registry = registry(&launcher, false, 3);
    let key = py();

    let session = registry.get_or_create(&key).await.unwrap();
    assert!(registry.evict(&key).await);
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(launcher.backend(0).methods().contains(&"shutdown".to_string()));
    assert!(registry.snapshot().is_empty());
    assert!(!registry.evict(&key).await);

    let fresh = registry.get_or_create(&key).await.unwrap();
    assert_eq!(launcher.spawn_count(), 2);
    assert!(fresh.is_ready());
}

#[tokio::test]
async fn test_snapshot_reports_sessions() {
    let launcher = ScriptedLauncher::new(Script::lsp());
    let registry = registry(&launcher, false, 3);

    registry.get_or_create(&py()).await.unwrap();
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].backend, "py@/proj");
    assert_eq!(snapshot[0].language, "py");
    assert_eq!(snapshot[0].status, "ready");
    assert_eq!(snapshot[0].failures, 0);
    assert!(snapshot[0].generation.is_some());
}

#[tokio::test]
async fn test_unconfigured_language_is_config_error() {
    let launcher = ScriptedLauncher::new(Script::lsp());
    let registry = registry(&launcher, false, 3);

    let err = registry
        .get_or_create(&BackendKey::new("/proj", "rust"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    assert_eq!(launcher.spawn_count(), 0);
}

#[tokio::test]
async fn test_shutdown_all_terminates_everything() {
    let launcher = ScriptedLauncher::new(Script::lsp());
    let registry = registry(&launcher, false, 3);

    let a = registry.get_or_create(&py()).await.unwrap();
    let b = registry
        .get_or_create(&BackendKey::new("/other", "py"))
        .await
        .unwrap();

    registry.shutdown_all().await;

    assert_eq!(a.state(), SessionState::Terminated);
    assert_eq!(b.state(), SessionState::Terminated);
    let err = registry.get_or_create(&py()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
}

#[tokio::test(start_paused = true)]
async fn test_restarts_wait_for_backoff() {
    let launcher = ScriptedLauncher::new(Script::lsp().failing_spawn());
    let registry = registry(&launcher, false, 5);
    let key = py();

    registry.get_or_create(&key).await.unwrap_err();

    let started = Instant::now();
    registry.get_or_create(&key).await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(10));

    let started = Instant::now();
    registry.get_or_create(&key).await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(launcher.spawn_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failures_outside_window_are_forgotten() {
    let launcher = ScriptedLauncher::new(Script::lsp().failing_spawn());
    let registry = registry(&launcher, false, 1);
    let key = py();

    registry.get_or_create(&key).await.unwrap_err();
    tokio::time::advance(Duration::from_secs(61)).await;

    let err = registry.get_or_create(&key).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeError);
    assert_eq!(registry.snapshot()[0].failures, 1);

    let err = registry.get_or_create(&key).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeError);
    let err = registry.get_or_create(&key).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    assert_eq!(launcher.spawn_count(), 3);
}
