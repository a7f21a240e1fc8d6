//! Agent-facing gateway
//!
//! Reads framed agent messages from a byte stream, dispatches every call on
//! its own task, and writes responses back in completion order through a
//! single writer task. Cancels are applied immediately. With push enabled,
//! new diagnostic events are forwarded to the agent as they arrive.


use crate::channel::{DEFAULT_MAX_FRAME_LEN, DecodeError, FrameCodec};
use crate::diagnostics::DiagnosticEvent;
use crate::error::{BridgeError, BridgeResult};
use crate::router::Router;
use crate::types::{AgentRequest, AgentResponse};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Responses queued for the writer before callers wait
const OUTBOUND_BUFFER: usize = 256;

/// A message from the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    /// Withdraw the in-flight call with this id
    Cancel { cancel: String },
    Call(AgentRequest),
}

/// A message to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    Response(AgentResponse),
    Event {
        event: String,
        #[serde(flatten)]
        diagnostic: DiagnosticEvent,
    },
}

impl Outbound {
    pub fn diagnostic(event: DiagnosticEvent) -> Self {
        Self::Event {
            event: "diagnostic".to_string(),
            diagnostic: event,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Forward every new diagnostic event to the agent
    pub push_diagnostics: bool,
    pub max_frame_len: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            push_diagnostics: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Serves one agent connection
pub struct Gateway {
    router: Arc<Router>,
    options: GatewayOptions,
}

impl Gateway {
    pub fn new(router: Arc<Router>) -> Self {
        Self::with_options(router, GatewayOptions::default())
    }

    pub fn with_options(router: Arc<Router>, options: GatewayOptions) -> Self {
        Self { router, options }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Serve until the agent closes its stream or sends an unframeable message
    ///
    /// Calls still running at that point are allowed to finish and their
    /// responses are written before this returns. Backends are left running;
    /// shutting them down is up to the registry's owner.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> BridgeResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let max = self.options.max_frame_len;
        let mut frames = FramedRead::new(reader, FrameCodec::<Inbound>::with_max_frame_len(max));
        let sink = FramedWrite::new(writer, FrameCodec::<Outbound>::with_max_frame_len(max));

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let writer_task = tokio::spawn(write_loop(sink, outbound_rx));

        let stop_push = CancellationToken::new();
        let push_task = self.options.push_diagnostics.then(|| {
            let events = self.router.registry().diagnostics().subscribe();
            tokio::spawn(push_loop(events, outbound.clone(), stop_push.clone()))
        });

        info!(push_diagnostics = self.options.push_diagnostics, "Gateway serving");
        let mut calls = JoinSet::new();
        let mut call_ids: HashMap<task::Id, String> = HashMap::new();

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    None => {
                        debug!("Agent closed its stream");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Agent stream failed");
                        break;
                    }
                    Some(Ok(Ok(Inbound::Call(mut request)))) => {
                        let id = request
                            .id
                            .get_or_insert_with(|| Uuid::new_v4().to_string())
                            .clone();
                        let router = Arc::clone(&self.router);
                        let outbound = outbound.clone();
                        let handle = calls.spawn(async move {
                            let response = router.dispatch(request).await;
                            if outbound.send(Outbound::Response(response)).await.is_err() {
                                debug!("Response dropped; writer stopped");
                            }
                        });
                        call_ids.insert(handle.id(), id);
                    }
                    Some(Ok(Ok(Inbound::Cancel { cancel }))) => {
                        if !self.router.cancel(&cancel) {
                            debug!(request_id = %cancel, "Cancel for unknown request");
                        }
                    }
                    Some(Ok(Err(e))) => {
                        let fatal = e.is_framing();
                        let _ = outbound
                            .send(Outbound::Response(AgentResponse::failure(None, &undecodable(e))))
                            .await;
                        if fatal {
                            warn!("Agent stream is no longer framed; closing");
                            break;
                        }
                    }
                },
                Some(joined) = calls.join_next_with_id() => {
                    settle(joined, &mut call_ids, &outbound).await;
                }
            }
        }

        while let Some(joined) = calls.join_next_with_id().await {
            settle(joined, &mut call_ids, &outbound).await;
        }

        stop_push.cancel();
        if let Some(task) = push_task {
            let _ = task.await;
        }
        drop(outbound);

        match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(BridgeError::transport(format!("writer task failed: {}", e))),
        }
    }
}

/// Forget a finished call; a call that died without answering gets an error reply
async fn settle(
    joined: Result<(task::Id, ()), JoinError>,
    call_ids: &mut HashMap<task::Id, String>,
    outbound: &mpsc::Sender<Outbound>,
) {
    let e = match joined {
        Ok((task_id, ())) => {
            call_ids.remove(&task_id);
            return;
        }
        Err(e) => e,
    };
    let id = call_ids.remove(&e.id());
    error!(request_id = ?id, error = %e, "Call task failed");
    let failure = BridgeError::translation(format!("request handling failed: {}", e));
    let _ = outbound
        .send(Outbound::Response(AgentResponse::failure(id, &failure)))
        .await;
}

fn undecodable(error: DecodeError) -> BridgeError {
    if error.is_framing() {
        BridgeError::transport(error.to_string())
    } else {
        BridgeError::invalid_arguments(format!("undecodable request: {}", error))
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec<Outbound>>,
    mut outbound: mpsc::Receiver<Outbound>,
) -> BridgeResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        sink.send(message)
            .await
            .map_err(|e| BridgeError::transport(format!("write to agent failed: {}", e)))?;
    }
    Ok(())
}

async fn push_loop(
    mut events: broadcast::Receiver<DiagnosticEvent>,
    outbound: mpsc::Sender<Outbound>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                if outbound.send(Outbound::diagnostic(event)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Diagnostic push fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
