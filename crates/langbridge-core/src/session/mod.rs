//! Backend sessions
//!
//! A session owns one backend process and the framed channel to it. All of
//! its mutable state (channel halves, pending-request table, process link)
//! lives in a single driver task; [`BackendSession`] is a cheap handle that
//! talks to the driver over a command channel.
//!
//! # Lifecycle
//! `Starting → Handshaking → Ready → Draining → Terminated`, or `Crashed`
//! on unexpected exit or channel failure. Only `Ready` sessions accept
//! requests.

mod driver;
mod pending;
mod state;

pub use state::{SessionEvent, SessionState};

use crate::adapter::{Adapter, CapabilitySet, DocumentRef, NativeReply, NativeRequest};
use crate::channel::FramedChannel;
use crate::config::{BackendDescriptor, SessionSettings};
use crate::diagnostics::DiagnosticsAggregator;
use crate::error::{BridgeError, BridgeResult};
use crate::process::{LaunchedBackend, ProcessLauncher};
use crate::protocol::{Notification, RequestId};
use crate::types::BackendDetail;
use crate::workspace::BackendKey;
use driver::{Command, Driver};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, instrument, warn};

/// Commands buffered between handles and the driver
const COMMAND_BUFFER: usize = 256;

/// Stand-in for deadlines too far away to represent
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `from + timeout`, saturating at a far-future instant
pub(crate) fn deadline_after(from: Instant, timeout: Duration) -> Instant {
    from.checked_add(timeout).unwrap_or_else(|| from + FAR_FUTURE)
}

/// Everything a session needs besides its descriptor
#[derive(Clone)]
pub struct SessionOptions {
    pub settings: SessionSettings,
    pub diagnostics: DiagnosticsAggregator,
    /// Where crash events go; `None` for unmanaged sessions
    pub events: Option<mpsc::UnboundedSender<SessionEvent>>,
    /// Distinguishes successive sessions for the same key
    pub generation: u64,
}

impl SessionOptions {
    pub fn new(settings: SessionSettings, diagnostics: DiagnosticsAggregator) -> Self {
        Self {
            settings,
            diagnostics,
            events: None,
            generation: 0,
        }
    }
}

pub(crate) struct SessionShared {
    key: BackendKey,
    descriptor: BackendDescriptor,
    adapter: Adapter,
    generation: u64,
    pid: Option<u32>,
    started_at: Instant,
    settings: SessionSettings,
    state: watch::Sender<SessionState>,
    capabilities: RwLock<CapabilitySet>,
    next_id: AtomicI64,
    opened_documents: Mutex<HashSet<PathBuf>>,
}

impl SessionShared {
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn unavailable(&self, reason: impl Into<String>) -> BridgeError {
        BridgeError::unavailable(self.key.id(), reason)
    }
}

/// Handle to a running backend session
#[derive(Clone)]
pub struct BackendSession {
    shared: Arc<SessionShared>,
    commands: mpsc::Sender<Command>,
}

/// A forwarded request whose reply has not arrived yet
#[derive(Debug)]
pub struct PendingReply {
    id: RequestId,
    backend: String,
    reply: oneshot::Receiver<BridgeResult<NativeReply>>,
}

impl PendingReply {
    /// Native id assigned to the request
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the backend's reply, a timeout, a cancellation or a crash
    pub async fn recv(self) -> BridgeResult<NativeReply> {
        self.reply.await.map_err(|_| {
            BridgeError::unavailable(self.backend, "session stopped before replying")
        })?
    }
}

impl BackendSession {
    /// Spawn the backend, open its channel and complete the handshake
    ///
    /// Spawn and handshake together are bounded by the handshake timeout.
    /// On failure the process is killed before the error is returned.
    #[instrument(skip_all, fields(backend = %descriptor.key()))]
    pub async fn start(
        descriptor: BackendDescriptor,
        launcher: &dyn ProcessLauncher,
        options: SessionOptions,
    ) -> BridgeResult<Self> {
        let key = descriptor.key();
        let settings = options.settings.clone();
        let started_at = Instant::now();
        let deadline = deadline_after(started_at, settings.handshake_timeout);

        let LaunchedBackend {
            stdin,
            stdout,
            process,
        } = match timeout_at(deadline, launcher.launch(&descriptor)).await {
            Ok(launched) => launched?,
            Err(_) => {
                return Err(BridgeError::handshake(
                    key.id(),
                    "timed out while spawning the backend",
                ));
            }
        };
        let pid = process.id();

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(driver::watch_process(process, kill_rx, exit_tx));

        let (reader, writer) =
            FramedChannel::with_max_frame_len(stdout, stdin, settings.max_frame_len).split();
        let (state, _) = watch::channel(SessionState::Starting);

        let shared = Arc::new(SessionShared {
            key: key.clone(),
            adapter: Adapter::for_family(descriptor.family),
            descriptor,
            generation: options.generation,
            pid,
            started_at,
            settings: settings.clone(),
            state,
            capabilities: RwLock::new(CapabilitySet::default()),
            next_id: AtomicI64::new(1),
            opened_documents: Mutex::new(HashSet::new()),
        });

        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let driver = Driver::new(
            Arc::clone(&shared),
            reader,
            writer,
            command_rx,
            kill_tx,
            exit_rx,
            options.diagnostics.clone(),
            options.events.clone(),
        );
        tokio::spawn(driver::watch_driver(
            Arc::clone(&shared),
            tokio::spawn(driver.run()),
            options.diagnostics,
            options.events,
        ));

        let session = Self { shared, commands };

        let outcome = match timeout_at(deadline, session.handshake()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::handshake(
                key.id(),
                format!(
                    "handshake timed out after {} ms",
                    settings.handshake_timeout.as_millis()
                ),
            )),
        };

        match outcome {
            Ok(capabilities) => {
                *session.shared.capabilities.write() = capabilities;
                session.mark_ready().await?;
                info!(
                    backend = %key,
                    pid = ?pid,
                    family = %session.shared.adapter.family(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Backend ready"
                );
                Ok(session)
            }
            Err(e) => {
                warn!(backend = %key, error = %e, "Backend failed to start");
                session.abort(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> BridgeResult<CapabilitySet> {
        let backend = self.shared.key.id();
        let adapter = self.shared.adapter;
        let (method, params) = adapter.handshake_request(&self.shared.descriptor);

        let as_handshake = |e: BridgeError| match e {
            BridgeError::Handshake { .. } => e,
            other => BridgeError::handshake(backend.clone(), other.to_string()),
        };

        let reply = self
            .submit(
                method,
                params,
                None,
                self.shared.settings.handshake_timeout,
                true,
            )
            .await
            .map_err(as_handshake)?
            .recv()
            .await
            .map_err(as_handshake)?;

        let result = reply.map_err(|rpc| BridgeError::Handshake {
            backend: backend.clone(),
            message: rpc.message.clone(),
            detail: Some(BackendDetail {
                code: Some(rpc.code),
                message: rpc.message,
                data: rpc.data,
            }),
        })?;

        let capabilities = adapter.parse_capabilities(result).map_err(as_handshake)?;
        self.notify(adapter.initialized_notification())
            .await
            .map_err(as_handshake)?;
        Ok(capabilities)
    }

    pub fn key(&self) -> &BackendKey {
        &self.shared.key
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.shared.descriptor
    }

    pub fn adapter(&self) -> Adapter {
        self.shared.adapter
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.shared.capabilities.read().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Observe lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state().accepts_requests()
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// Register and write a request; the reply arrives through the returned handle
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Value,
        agent_id: Option<String>,
        timeout: Duration,
    ) -> BridgeResult<PendingReply> {
        let state = self.state();
        if !state.accepts_requests() {
            return Err(self.shared.unavailable(format!("session is {}", state)));
        }
        self.submit(method.into(), params, agent_id, timeout, false)
            .await
    }

    /// Open the request's document if needed, then send it
    pub async fn forward(
        &self,
        request: NativeRequest,
        agent_id: Option<String>,
        timeout: Duration,
    ) -> BridgeResult<PendingReply> {
        if let Some(document) = &request.document {
            self.ensure_document_open(document).await?;
        }
        self.send_request(request.method, request.params, agent_id, timeout)
            .await
    }

    async fn submit(
        &self,
        method: impl Into<String>,
        params: Value,
        agent_id: Option<String>,
        timeout: Duration,
        handshake: bool,
    ) -> BridgeResult<PendingReply> {
        let id = self.shared.next_id();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.commands
            .send(Command::Request {
                id: id.clone(),
                method: method.into(),
                params,
                agent_id,
                timeout,
                handshake,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.shared.unavailable("session has stopped"))?;

        Ok(PendingReply {
            id,
            backend: self.shared.key.id(),
            reply: reply_rx,
        })
    }

    /// Withdraw a pending request; its waiter gets `Cancelled`
    pub async fn cancel(&self, id: &RequestId) {
        if self
            .commands
            .send(Command::Cancel { id: id.clone() })
            .await
            .is_err()
        {
            debug!(backend = %self.shared.key, id = %id, "Cancel after session stopped");
        }
    }

    /// Write a notification
    pub async fn notify(&self, notification: Notification) -> BridgeResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Notify {
                notification,
                ack: ack_tx,
            })
            .await
            .map_err(|_| self.shared.unavailable("session has stopped"))?;
        ack_rx
            .await
            .map_err(|_| self.shared.unavailable("session has stopped"))?
    }

    /// Send the family's open-document notification once per file
    ///
    /// Files that cannot be read are skipped; the request still goes out.
    pub async fn ensure_document_open(&self, document: &DocumentRef) -> BridgeResult<()> {
        if !self.shared.opened_documents.lock().insert(document.path.clone()) {
            return Ok(());
        }

        let text = match tokio::fs::read_to_string(&document.path).await {
            Ok(text) => text,
            Err(e) => {
                debug!(
                    backend = %self.shared.key,
                    path = %document.path.display(),
                    error = %e,
                    "Skipping document sync for unreadable file"
                );
                self.shared.opened_documents.lock().remove(&document.path);
                return Ok(());
            }
        };

        let Some(notification) =
            self.shared
                .adapter
                .open_document(document, &self.shared.descriptor.language_id, text)
        else {
            return Ok(());
        };
        self.notify(notification).await
    }

    async fn mark_ready(&self) -> BridgeResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::MarkReady { ack: ack_tx })
            .await
            .map_err(|_| self.shared.unavailable("session stopped during startup"))?;
        ack_rx
            .await
            .map_err(|_| self.shared.unavailable("session stopped during startup"))?;
        if self.is_ready() {
            Ok(())
        } else {
            Err(self
                .shared
                .unavailable(format!("session is {} after handshake", self.state())))
        }
    }

    async fn abort(&self, reason: String) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Abort {
                reason,
                ack: ack_tx,
            })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }

    /// Drain, run the protocol shutdown exchange, and stop the process
    ///
    /// Returns once the session is terminal.
    pub async fn shutdown(&self) {
        if self.state().is_terminal() {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { ack: ack_tx })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }
}

impl std::fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSession")
            .field("key", &self.shared.key)
            .field("generation", &self.shared.generation)
            .field("state", &self.state())
            .field("pid", &self.shared.pid)
            .finish()
    }
}
