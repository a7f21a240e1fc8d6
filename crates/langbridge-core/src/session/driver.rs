//! Session driver task
//!
//! The driver is the only owner of a session's channel halves and pending
//! table. It multiplexes handle commands, inbound frames, process exit and
//! request deadlines in one loop.

use super::pending::{PendingRequest, PendingTable, ReplySender};
use super::{SessionEvent, SessionShared, SessionState, deadline_after};
use crate::channel::{DecodeError, FrameReader, FrameWriter};
use crate::diagnostics::{DiagnosticEvent, DiagnosticsAggregator, Severity};
use crate::error::{BridgeError, BridgeResult};
use crate::process::BackendProcess;
use crate::protocol::{Message, Notification, Request, RequestId};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, trace, warn};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Wake-up interval when nothing is pending
const IDLE_WAKE: Duration = Duration::from_secs(3600);

pub(super) enum Command {
    Request {
        id: RequestId,
        method: String,
        params: Value,
        agent_id: Option<String>,
        timeout: Duration,
        /// Allowed before the session is ready
        handshake: bool,
        reply: ReplySender,
    },
    Notify {
        notification: Notification,
        ack: oneshot::Sender<BridgeResult<()>>,
    },
    Cancel {
        id: RequestId,
    },
    MarkReady {
        ack: oneshot::Sender<()>,
    },
    Abort {
        reason: String,
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

enum Flow {
    Continue,
    Crash(String),
    Shutdown(oneshot::Sender<()>),
    Abort(String, oneshot::Sender<()>),
    Closed,
}

enum Pump {
    Done,
    Deadline,
    Lost(String),
}

/// Mark the session crashed if its driver dies without settling it
pub(super) async fn watch_driver(
    shared: Arc<SessionShared>,
    driver: JoinHandle<()>,
    diagnostics: DiagnosticsAggregator,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
) {
    let Err(e) = driver.await else {
        return;
    };
    let previous = shared.state.send_replace(SessionState::Crashed);
    error!(
        backend = %shared.key,
        generation = shared.generation,
        state = %previous,
        error = %e,
        "Session driver failed"
    );
    diagnostics.record(
        DiagnosticEvent::new(
            shared.key.id(),
            Severity::Error,
            format!("backend session failed: {}", e),
        )
        .with_source("langbridge"),
    );
    if matches!(previous, SessionState::Ready | SessionState::Draining) {
        if let Some(events) = events {
            let _ = events.send(SessionEvent::Crashed {
                key: shared.key.clone(),
                generation: shared.generation,
                reason: format!("session driver failed: {}", e),
                uptime: shared.started_at.elapsed(),
            });
        }
    }
}

/// Forward exit status and kill requests for a backend process
///
/// Losing the driver's end of `kill` kills the process as well.
pub(super) async fn watch_process(
    mut process: Box<dyn BackendProcess>,
    kill: oneshot::Receiver<()>,
    exited: oneshot::Sender<Option<i32>>,
) {
    let status = tokio::select! {
        status = process.wait() => status,
        _ = kill => {
            process.start_kill();
            process.wait().await
        }
    };
    let code = match status {
        Ok(code) => code,
        Err(e) => {
            warn!(error = %e, "Failed to wait for backend process");
            None
        }
    };
    let _ = exited.send(code);
}

pub(super) struct Driver {
    shared: Arc<SessionShared>,
    reader: FrameReader<BoxReader, Message>,
    writer: Option<FrameWriter<BoxWriter, Message>>,
    commands: mpsc::Receiver<Command>,
    commands_closed: bool,
    pending: PendingTable,
    kill: Option<oneshot::Sender<()>>,
    exit: oneshot::Receiver<Option<i32>>,
    /// Set once the process has been reaped; holds its exit code
    exit_status: Option<Option<i32>>,
    diagnostics: DiagnosticsAggregator,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ready_since: Option<Instant>,
    late_acks: Vec<oneshot::Sender<()>>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        shared: Arc<SessionShared>,
        reader: FrameReader<BoxReader, Message>,
        writer: FrameWriter<BoxWriter, Message>,
        commands: mpsc::Receiver<Command>,
        kill: oneshot::Sender<()>,
        exit: oneshot::Receiver<Option<i32>>,
        diagnostics: DiagnosticsAggregator,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Self {
        Self {
            shared,
            reader,
            writer: Some(writer),
            commands,
            commands_closed: false,
            pending: PendingTable::default(),
            kill: Some(kill),
            exit,
            exit_status: None,
            diagnostics,
            events,
            ready_since: None,
            late_acks: Vec::new(),
        }
    }

    pub(super) async fn run(mut self) {
        self.set_state(SessionState::Handshaking);

        loop {
            let wake = self
                .pending
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);

            let flow = tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.commands_closed = true;
                        Flow::Closed
                    }
                },
                frame = self.reader.next() => self.handle_frame(frame).await,
                status = &mut self.exit, if self.exit_status.is_none() => {
                    let code = status.ok().flatten();
                    self.exit_status = Some(code);
                    Flow::Crash(exit_reason(code))
                }
                _ = sleep_until(wake) => self.expire_overdue().await,
            };

            match flow {
                Flow::Continue => {}
                Flow::Crash(reason) => {
                    self.crash(reason).await;
                    break;
                }
                Flow::Shutdown(ack) => {
                    self.shutdown().await;
                    let _ = ack.send(());
                    break;
                }
                Flow::Closed => {
                    debug!(backend = %self.shared.key, "All session handles dropped");
                    self.shutdown().await;
                    break;
                }
                Flow::Abort(reason, ack) => {
                    self.abort(reason).await;
                    let _ = ack.send(());
                    break;
                }
            }
        }

        for ack in self.late_acks.drain(..) {
            let _ = ack.send(());
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!(backend = %self.shared.key, from = %previous, to = %state, "Session state changed");
        }
    }

    fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    async fn write(&mut self, message: Message) -> Result<(), String> {
        let Some(writer) = self.writer.as_mut() else {
            return Err("backend input already closed".to_string());
        };
        writer
            .send(message)
            .await
            .map_err(|e| format!("write failed: {}", e))
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Request {
                id,
                method,
                params,
                agent_id,
                timeout,
                handshake,
                reply,
            } => {
                let state = self.state();
                let allowed = state == SessionState::Ready
                    || (handshake && state == SessionState::Handshaking);
                if !allowed {
                    let _ = reply.send(Err(self.shared.unavailable(format!("session is {}", state))));
                    return Flow::Continue;
                }

                let now = Instant::now();
                trace!(backend = %self.shared.key, id = %id, method = %method, "Forwarding request");
                self.pending.insert(
                    id.clone(),
                    PendingRequest {
                        agent_id,
                        method: method.clone(),
                        issued_at: now,
                        deadline: deadline_after(now, timeout),
                        reply,
                    },
                );
                match self.write(Request::new(id, method).with_params(params).into()).await {
                    Ok(()) => Flow::Continue,
                    Err(reason) => Flow::Crash(reason),
                }
            }
            Command::Notify { notification, ack } => {
                match self.write(notification.into()).await {
                    Ok(()) => {
                        let _ = ack.send(Ok(()));
                        Flow::Continue
                    }
                    Err(reason) => {
                        let _ = ack.send(Err(BridgeError::transport(reason.clone())));
                        Flow::Crash(reason)
                    }
                }
            }
            Command::Cancel { id } => {
                let Some(pending) = self.pending.remove(&id) else {
                    return Flow::Continue;
                };
                debug!(
                    backend = %self.shared.key,
                    id = %id,
                    agent_id = ?pending.agent_id,
                    "Cancelling request"
                );
                pending.resolve(Err(BridgeError::Cancelled));
                let cancel = self.shared.adapter.cancel_notification(&id);
                match self.write(cancel.into()).await {
                    Ok(()) => Flow::Continue,
                    Err(reason) => Flow::Crash(reason),
                }
            }
            Command::MarkReady { ack } => {
                if self.state() == SessionState::Handshaking {
                    self.set_state(SessionState::Ready);
                    self.ready_since = Some(Instant::now());
                }
                let _ = ack.send(());
                Flow::Continue
            }
            Command::Abort { reason, ack } => Flow::Abort(reason, ack),
            Command::Shutdown { ack } => Flow::Shutdown(ack),
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Option<Result<Result<Message, DecodeError>, io::Error>>,
    ) -> Flow {
        match frame {
            None => Flow::Crash("backend closed its output".to_string()),
            Some(Err(e)) => Flow::Crash(format!("read failed: {}", e)),
            Some(Ok(Err(e))) if e.is_framing() => Flow::Crash(e.to_string()),
            Some(Ok(Err(e))) => {
                warn!(backend = %self.shared.key, error = %e, "Discarding undecodable frame");
                self.diagnostics.record(
                    DiagnosticEvent::new(
                        self.shared.key.id(),
                        Severity::Warning,
                        format!("discarded frame: {}", e),
                    )
                    .with_source("langbridge"),
                );
                Flow::Continue
            }
            Some(Ok(Ok(message))) => self.handle_message(message).await,
        }
    }

    async fn handle_message(&mut self, message: Message) -> Flow {
        match message {
            Message::Response(response) => {
                match self.pending.remove(&response.id) {
                    Some(pending) => {
                        trace!(
                            backend = %self.shared.key,
                            id = %response.id,
                            method = %pending.method,
                            elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                            "Reply received"
                        );
                        pending.resolve(Ok(response.into_result()));
                    }
                    None => {
                        debug!(backend = %self.shared.key, id = %response.id, "Discarding unmatched reply");
                        self.diagnostics.record(
                            DiagnosticEvent::new(
                                self.shared.key.id(),
                                Severity::Trace,
                                format!("discarded reply to request {}", response.id),
                            )
                            .with_source("langbridge"),
                        );
                    }
                }
                Flow::Continue
            }
            Message::Notification(notification) => {
                let backend = self.shared.key.id();
                for update in self
                    .shared
                    .adapter
                    .translate_notification(&self.shared.key, &notification)
                {
                    self.diagnostics.apply(&backend, update);
                }
                Flow::Continue
            }
            Message::Request(request) => {
                trace!(backend = %self.shared.key, method = %request.method, "Answering backend request");
                let answer = self
                    .shared
                    .adapter
                    .answer_backend_request(&request, &self.shared.descriptor);
                match self.write(answer.into()).await {
                    Ok(()) => Flow::Continue,
                    Err(reason) => Flow::Crash(reason),
                }
            }
        }
    }

    async fn expire_overdue(&mut self) -> Flow {
        for (id, pending) in self.pending.take_expired(Instant::now()) {
            let millis = (pending.deadline - pending.issued_at).as_millis() as u64;
            warn!(
                backend = %self.shared.key,
                id = %id,
                method = %pending.method,
                timeout_ms = millis,
                "Request timed out"
            );
            pending.resolve(Err(BridgeError::timeout(millis)));
            let cancel = self.shared.adapter.cancel_notification(&id);
            if let Err(reason) = self.write(cancel.into()).await {
                return Flow::Crash(reason);
            }
        }
        Flow::Continue
    }

    /// Kill the process if it is still running and collect its exit code
    async fn reap(&mut self) -> Option<i32> {
        if let Some(code) = self.exit_status {
            return code;
        }
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        match timeout(self.shared.settings.shutdown_grace, &mut self.exit).await {
            Ok(status) => {
                let code = status.ok().flatten();
                self.exit_status = Some(code);
                code
            }
            Err(_) => {
                warn!(backend = %self.shared.key, "Backend did not exit after kill");
                None
            }
        }
    }

    async fn crash(&mut self, reason: String) {
        let reaped = self.exit_status.is_some();
        let code = self.reap().await;
        let reason = match code {
            Some(code) if !reaped => format!("{}; process exited with code {}", reason, code),
            _ => reason,
        };

        let failed = self
            .pending
            .fail_all(&self.shared.unavailable(reason.clone()));
        self.set_state(SessionState::Crashed);
        error!(
            backend = %self.shared.key,
            generation = self.shared.generation,
            pending = failed,
            reason = %reason,
            "Backend crashed"
        );
        self.diagnostics.record(
            DiagnosticEvent::new(
                self.shared.key.id(),
                Severity::Error,
                format!("backend crashed: {}", reason),
            )
            .with_source("langbridge"),
        );

        if let (Some(since), Some(events)) = (self.ready_since, &self.events) {
            let _ = events.send(SessionEvent::Crashed {
                key: self.shared.key.clone(),
                generation: self.shared.generation,
                reason,
                uptime: since.elapsed(),
            });
        }
    }

    async fn abort(&mut self, reason: String) {
        self.writer.take();
        self.reap().await;
        self.pending
            .fail_all(&self.shared.unavailable(reason.clone()));
        self.set_state(SessionState::Terminated);
        debug!(backend = %self.shared.key, reason = %reason, "Session aborted");
    }

    async fn shutdown(&mut self) {
        let grace = self.shared.settings.shutdown_grace;
        self.set_state(SessionState::Draining);
        info!(
            backend = %self.shared.key,
            in_flight = self.pending.len(),
            "Draining backend session"
        );

        let drained_by = deadline_after(Instant::now(), grace);
        let mut lost = match self
            .pump_until(drained_by, |d| d.pending.is_empty())
            .await
        {
            Pump::Lost(reason) => Some(reason),
            Pump::Done | Pump::Deadline => None,
        };

        if lost.is_none() {
            if let Some(method) = self.shared.adapter.shutdown_method() {
                let id = self.shared.next_id();
                let (reply, _answer) = oneshot::channel();
                let now = Instant::now();
                let deadline = deadline_after(now, grace);
                self.pending.insert(
                    id.clone(),
                    PendingRequest {
                        agent_id: None,
                        method: method.to_string(),
                        issued_at: now,
                        deadline,
                        reply,
                    },
                );
                match self.write(Request::new(id.clone(), method).into()).await {
                    Ok(()) => {
                        if let Pump::Lost(reason) = self
                            .pump_until(deadline, |d| !d.pending.contains(&id))
                            .await
                        {
                            lost = Some(reason);
                        }
                    }
                    Err(reason) => lost = Some(reason),
                }
            }
        }

        if lost.is_none() {
            if let Some(exit) = self.shared.adapter.exit_notification() {
                let _ = self.write(exit.into()).await;
            }
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.close().await;
        }

        if self.exit_status.is_none() {
            match timeout(grace, &mut self.exit).await {
                Ok(status) => self.exit_status = Some(status.ok().flatten()),
                Err(_) => {
                    warn!(backend = %self.shared.key, "Backend ignored exit; killing it");
                    self.reap().await;
                }
            }
        }

        let failed = self
            .pending
            .fail_all(&self.shared.unavailable("session shut down"));
        self.set_state(SessionState::Terminated);
        info!(
            backend = %self.shared.key,
            exit_code = ?self.exit_status.flatten(),
            abandoned = failed,
            lost = ?lost,
            "Backend session terminated"
        );
    }

    /// Keep serving the session until `done` holds, the deadline passes, or
    /// the backend goes away
    async fn pump_until(&mut self, deadline: Instant, done: impl Fn(&Self) -> bool) -> Pump {
        loop {
            if done(self) {
                return Pump::Done;
            }
            if Instant::now() >= deadline {
                return Pump::Deadline;
            }
            let wake = self
                .pending
                .next_deadline()
                .map_or(deadline, |d| d.min(deadline));

            let flow = tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.commands_closed = true;
                        Flow::Continue
                    }
                },
                frame = self.reader.next() => self.handle_frame(frame).await,
                status = &mut self.exit, if self.exit_status.is_none() => {
                    let code = status.ok().flatten();
                    self.exit_status = Some(code);
                    Flow::Crash(exit_reason(code))
                }
                _ = sleep_until(wake) => self.expire_overdue().await,
            };

            match flow {
                Flow::Continue | Flow::Closed => {}
                Flow::Shutdown(ack) | Flow::Abort(_, ack) => self.late_acks.push(ack),
                Flow::Crash(reason) => return Pump::Lost(reason),
            }
        }
    }
}

fn exit_reason(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("process exited with code {}", code),
        None => "process exited".to_string(),
    }
}
