//! Backend registry
//!
//! Maps each [`BackendKey`] to at most one live session. Every key has its
//! own slot guarded by an async mutex: concurrent callers for one key queue
//! behind a single start, callers for different keys never contend.
//!
//! A supervisor task receives crash events from sessions, counts them
//! against the restart policy, and optionally restarts backends in the
//! background once their backoff has elapsed.

use crate::config::{
    BackendConfigProvider, BackendDescriptor, BridgeConfig, RestartPolicy, SessionSettings,
};
use crate::diagnostics::DiagnosticsAggregator;
use crate::error::{BridgeError, BridgeResult};
use crate::process::ProcessLauncher;
use crate::session::{BackendSession, SessionEvent, SessionOptions, SessionState, deadline_after};
use crate::workspace::BackendKey;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Slot {
    state: Arc<Mutex<SlotState>>,
}

#[derive(Default)]
struct SlotState {
    session: Option<BackendSession>,
    /// Failures counted in the current window
    failures: u32,
    window_start: Option<Instant>,
    last_failure: Option<String>,
    /// Restart budget exhausted; cleared only by `reset` or `evict`
    failed: bool,
    /// Earliest time the next start may begin
    not_before: Option<Instant>,
    /// Slot was evicted; its holder must look the key up again
    retired: bool,
}

/// Per-key status reported by [`BackendRegistry::snapshot`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub backend: String,
    pub root: String,
    pub language: String,
    /// Session state, `idle` without a session, `starting` while a start is running
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    pub failures: u32,
    pub permanently_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

/// Owner of every backend session
pub struct BackendRegistry {
    slots: DashMap<BackendKey, Arc<Slot>>,
    provider: Arc<dyn BackendConfigProvider>,
    launcher: Arc<dyn ProcessLauncher>,
    diagnostics: DiagnosticsAggregator,
    settings: SessionSettings,
    policy: RestartPolicy,
    events: mpsc::UnboundedSender<SessionEvent>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl BackendRegistry {
    /// Build a registry and start its supervisor
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        provider: Arc<dyn BackendConfigProvider>,
        launcher: Arc<dyn ProcessLauncher>,
        diagnostics: DiagnosticsAggregator,
        settings: SessionSettings,
        policy: RestartPolicy,
    ) -> Arc<Self> {
        let (events, event_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            slots: DashMap::new(),
            provider,
            launcher,
            diagnostics,
            settings,
            policy,
            events,
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(supervise(
            Arc::downgrade(&registry),
            event_rx,
            registry.shutdown.clone(),
        ));
        registry
    }

    /// Registry whose descriptors, timings and restart policy come from a config
    pub fn from_config(
        config: Arc<BridgeConfig>,
        launcher: Arc<dyn ProcessLauncher>,
        diagnostics: DiagnosticsAggregator,
    ) -> Arc<Self> {
        let settings = config.session_settings();
        let policy = config.restart.clone();
        Self::new(config, launcher, diagnostics, settings, policy)
    }

    pub fn diagnostics(&self) -> &DiagnosticsAggregator {
        &self.diagnostics
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Descriptor for a key, without starting anything
    pub fn descriptor(&self, key: &BackendKey) -> BridgeResult<BackendDescriptor> {
        self.provider.descriptor(key)
    }

    /// Return the key's ready session, starting one if needed
    ///
    /// Suspends until the session is ready or its start has failed. A
    /// permanently failed key fails fast naming the last failure. Dropping
    /// the returned future does not interrupt a start already under way.
    pub async fn get_or_create(
        self: &Arc<Self>,
        key: &BackendKey,
    ) -> BridgeResult<BackendSession> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(BridgeError::unavailable(key.id(), "bridge is shutting down"));
            }

            let slot = Arc::clone(
                self.slots
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Slot::default()))
                    .value(),
            );
            let mut state = Arc::clone(&slot.state).lock_owned().await;
            if state.retired {
                continue;
            }

            if state.failed {
                return Err(BridgeError::unavailable(
                    key.id(),
                    format!(
                        "restart limit exceeded after {} failures; last failure: {}",
                        state.failures,
                        state.last_failure.as_deref().unwrap_or("unknown")
                    ),
                ));
            }

            if let Some(session) = &state.session {
                match session.state() {
                    SessionState::Ready => return Ok(session.clone()),
                    SessionState::Draining => {
                        return Err(BridgeError::unavailable(key.id(), "session is draining"));
                    }
                    _ => {
                        debug!(backend = %key, state = %session.state(), "Clearing dead session");
                        state.session = None;
                    }
                }
            }

            let registry = Arc::clone(self);
            let starting = key.clone();
            let start = tokio::spawn(async move { registry.start_locked(&starting, state).await });
            return match start.await {
                Ok(result) => result,
                Err(e) => Err(BridgeError::unavailable(
                    key.id(),
                    format!("backend start failed: {}", e),
                )),
            };
        }
    }

    /// Start a session while holding the key's slot
    ///
    /// Runs on its own task, so callers that stop waiting never abandon a
    /// start that other callers are queued behind.
    async fn start_locked(
        &self,
        key: &BackendKey,
        mut state: OwnedMutexGuard<SlotState>,
    ) -> BridgeResult<BackendSession> {
        if let Some(not_before) = state.not_before {
            if not_before > Instant::now() {
                debug!(backend = %key, "Waiting for restart backoff");
                sleep_until(not_before).await;
            }
        }

        let descriptor = self.provider.descriptor(key)?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let options = SessionOptions {
            settings: self.settings.clone(),
            diagnostics: self.diagnostics.clone(),
            events: Some(self.events.clone()),
            generation,
        };

        match BackendSession::start(descriptor, self.launcher.as_ref(), options).await {
            Ok(session) => {
                state.session = Some(session.clone());
                state.not_before = None;
                info!(backend = %key, generation, "Backend session registered");
                Ok(session)
            }
            Err(e) => {
                self.record_failure(key, &mut state, e.to_string());
                Err(e)
            }
        }
    }

    /// The key's current session, if it is ready; never starts one
    pub fn session(&self, key: &BackendKey) -> Option<BackendSession> {
        let slot = self.slots.get(key)?;
        let state = slot.state.try_lock().ok()?;
        state.session.clone().filter(|s| s.is_ready())
    }

    fn record_failure(&self, key: &BackendKey, state: &mut SlotState, reason: String) {
        let now = Instant::now();
        let window = self.policy.window();
        if state
            .window_start
            .is_none_or(|start| now.duration_since(start) > window)
        {
            state.failures = 0;
            state.window_start = Some(now);
        }
        state.failures += 1;
        state.last_failure = Some(reason.clone());

        if state.failures > self.policy.max_restarts {
            state.failed = true;
            state.not_before = None;
            error!(
                backend = %key,
                failures = state.failures,
                reason = %reason,
                "Backend permanently failed"
            );
        } else {
            let delay = self.policy.backoff.delay_for_failures(state.failures);
            state.not_before = Some(deadline_after(now, delay));
            warn!(
                backend = %key,
                failures = state.failures,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Backend failure recorded"
            );
        }
    }

    async fn handle_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Crashed {
                key,
                generation,
                reason,
                uptime,
            } => {
                let Some(slot) = self.slots.get(&key).map(|s| Arc::clone(s.value())) else {
                    return;
                };
                let mut state = slot.state.lock().await;
                if state.retired {
                    return;
                }
                if state
                    .session
                    .as_ref()
                    .is_some_and(|s| s.generation() == generation)
                {
                    state.session = None;
                }
                warn!(
                    backend = %key,
                    generation,
                    uptime_secs = uptime.as_secs(),
                    "Evicting crashed backend"
                );
                self.record_failure(&key, &mut state, reason);

                let restart = self.policy.eager && !state.failed && state.session.is_none();
                drop(state);
                if restart {
                    self.spawn_restart(key);
                }
            }
        }
    }

    fn spawn_restart(self: &Arc<Self>, key: BackendKey) {
        let registry = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = registry.get_or_create(&key) => match result {
                    Ok(session) => info!(backend = %key, generation = session.generation(), "Backend restarted"),
                    Err(e) => warn!(backend = %key, error = %e, "Background restart failed"),
                },
            }
        });
    }

    /// Shut the key's session down and forget the key, failure history included
    pub async fn evict(&self, key: &BackendKey) -> bool {
        let Some((_, slot)) = self.slots.remove(key) else {
            return false;
        };
        let session = {
            let mut state = slot.state.lock().await;
            state.retired = true;
            state.session.take()
        };
        if let Some(session) = session {
            info!(backend = %key, "Evicting backend");
            session.shutdown().await;
        }
        true
    }

    /// Clear the key's failure history, lifting a permanent failure
    pub async fn reset(&self, key: &BackendKey) -> bool {
        let Some(slot) = self.slots.get(key).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut state = slot.state.lock().await;
        state.failures = 0;
        state.window_start = None;
        state.last_failure = None;
        state.failed = false;
        state.not_before = None;
        info!(backend = %key, "Backend failure history reset");
        true
    }

    /// Status of every known key, sorted by backend id
    pub fn snapshot(&self) -> Vec<BackendStatus> {
        let mut statuses: Vec<BackendStatus> = self
            .slots
            .iter()
            .map(|entry| {
                let key = entry.key();
                let mut status = BackendStatus {
                    backend: key.id(),
                    root: key.root.display().to_string(),
                    language: key.language.clone(),
                    status: "starting".to_string(),
                    pid: None,
                    generation: None,
                    failures: 0,
                    permanently_failed: false,
                    last_failure: None,
                };
                if let Ok(state) = entry.value().state.try_lock() {
                    status.failures = state.failures;
                    status.permanently_failed = state.failed;
                    status.last_failure = state.last_failure.clone();
                    status.status = match &state.session {
                        Some(session) => {
                            status.pid = session.pid();
                            status.generation = Some(session.generation());
                            session.state().to_string()
                        }
                        None if state.failed => "failed".to_string(),
                        None => "idle".to_string(),
                    };
                }
                status
            })
            .collect();
        statuses.sort_by(|a, b| a.backend.cmp(&b.backend));
        statuses
    }

    /// Stop the supervisor and shut every session down concurrently
    pub async fn shutdown_all(&self) {
        self.shutdown.cancel();
        let slots: Vec<Arc<Slot>> = self
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.slots.clear();

        let sessions = futures::future::join_all(slots.iter().map(|slot| async move {
            let mut state = slot.state.lock().await;
            state.retired = true;
            state.session.take()
        }))
        .await;

        let sessions: Vec<BackendSession> = sessions.into_iter().flatten().collect();
        info!(count = sessions.len(), "Shutting down all backends");
        futures::future::join_all(sessions.iter().map(|s| s.shutdown())).await;
    }
}

impl Drop for BackendRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn supervise(
    registry: Weak<BackendRegistry>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.handle_event(event).await;
    }
    debug!("Registry supervisor stopped");
}
