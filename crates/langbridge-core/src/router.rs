//! Request routing
//!
//! The router turns one [`AgentRequest`] into exactly one [`AgentResponse`]:
//! local tools are answered in place, everything else is classified to a
//! backend key, translated by the backend family's adapter and forwarded
//! through the registry's session.

use crate::adapter::{Adapter, LSP_TOOLS};
use crate::config::BridgeConfig;
use crate::diagnostics::{DiagnosticEvent, DiagnosticFilter};
use crate::error::{BridgeError, BridgeResult};
use crate::registry::BackendRegistry;
use crate::types::{AgentRequest, AgentResponse};
use crate::workspace::WorkspaceClassifier;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, instrument, warn};
use uuid::Uuid;

/// Tools the router answers without a backend
pub const LOCAL_TOOLS: &[(&str, &str)] = &[
    (
        "diagnostics",
        "Recent backend diagnostics; filter by backend, min_severity, file, limit",
    ),
    ("backends", "Status of every known backend"),
    ("list_tools", "Tools and languages this bridge serves"),
];

/// Dispatches agent requests to local tools or backends
pub struct Router {
    registry: Arc<BackendRegistry>,
    classifier: Arc<dyn WorkspaceClassifier>,
    config: Option<Arc<BridgeConfig>>,
    in_flight: DashMap<String, CancellationToken>,
}

/// Removes an agent id from the in-flight table when its dispatch ends
struct InFlightGuard<'a> {
    table: &'a DashMap<String, CancellationToken>,
    id: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

impl Router {
    pub fn new(registry: Arc<BackendRegistry>, classifier: Arc<dyn WorkspaceClassifier>) -> Self {
        Self {
            registry,
            classifier,
            config: None,
            in_flight: DashMap::new(),
        }
    }

    /// Configuration whose languages `list_tools` reports
    pub fn with_config(mut self, config: Arc<BridgeConfig>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Number of requests currently being served
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Withdraw an in-flight request; its caller gets a `Cancelled` error
    pub fn cancel(&self, agent_id: &str) -> bool {
        match self.in_flight.get(agent_id) {
            Some(token) => {
                debug!(request_id = agent_id, "Cancelling request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Serve one request; every outcome becomes a response carrying the request id
    #[instrument(skip_all, fields(tool = %request.tool, request_id = tracing::field::Empty))]
    pub async fn dispatch(&self, request: AgentRequest) -> AgentResponse {
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Span::current().record("request_id", id.as_str());

        let started = Instant::now();
        match self.serve(&id, &request).await {
            Ok(result) => {
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request succeeded"
                );
                AgentResponse::success(id, result)
            }
            Err(e) => {
                warn!(
                    code = e.error_code(),
                    retryable = e.is_retryable(),
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request failed"
                );
                AgentResponse::failure(Some(id), &e)
            }
        }
    }

    async fn serve(&self, id: &str, request: &AgentRequest) -> BridgeResult<Value> {
        let token = match self.in_flight.entry(id.to_string()) {
            Entry::Occupied(_) => {
                return Err(BridgeError::invalid_arguments(format!(
                    "request id '{}' is already in flight",
                    id
                )));
            }
            Entry::Vacant(entry) => {
                let token = CancellationToken::new();
                entry.insert(token.clone());
                token
            }
        };
        let _guard = InFlightGuard {
            table: &self.in_flight,
            id,
        };

        if let Some(result) = self.local_tool(request)? {
            return Ok(result);
        }
        self.forward(id, request, &token).await
    }

    fn local_tool(&self, request: &AgentRequest) -> BridgeResult<Option<Value>> {
        match request.tool.as_str() {
            "diagnostics" => {
                let filter: DiagnosticFilter = match &request.arguments {
                    Value::Null => DiagnosticFilter::default(),
                    arguments => serde_json::from_value(arguments.clone()).map_err(|e| {
                        BridgeError::invalid_arguments(format!("invalid diagnostics filter: {}", e))
                    })?,
                };
                let snapshot = self.registry.diagnostics().snapshot(filter);
                let events: Vec<&DiagnosticEvent> = snapshot.iter().collect();
                Ok(Some(json!({ "events": events })))
            }
            "backends" => Ok(Some(json!({ "backends": self.registry.snapshot() }))),
            "list_tools" => Ok(Some(self.catalogue())),
            _ => Ok(None),
        }
    }

    fn catalogue(&self) -> Value {
        let local = LOCAL_TOOLS.iter().map(|(name, description)| {
            json!({ "name": name, "description": description, "family": "local" })
        });
        let lsp = LSP_TOOLS.iter().map(|spec| {
            json!({
                "name": spec.name,
                "description": spec.description,
                "family": "lsp",
                "method": spec.method,
            })
        });
        let tools: Vec<Value> = local.chain(lsp).collect();

        let languages: Vec<Value> = self
            .config
            .iter()
            .flat_map(|config| config.languages.iter())
            .map(|(name, language)| {
                json!({
                    "name": name,
                    "protocol": language.protocol,
                    "extensions": language.extensions,
                    "tools": language.capabilities,
                })
            })
            .collect();

        json!({ "tools": tools, "languages": languages })
    }

    async fn forward(
        &self,
        id: &str,
        request: &AgentRequest,
        token: &CancellationToken,
    ) -> BridgeResult<Value> {
        let key = self
            .classifier
            .classify(request.str_arg("file"), &request.arguments)?;
        let descriptor = self.registry.descriptor(&key)?;

        // Rejections that need no backend happen before anything is spawned
        Adapter::for_family(descriptor.family).precheck(
            &request.tool,
            &request.arguments,
            &descriptor,
        )?;

        let session = tokio::select! {
            _ = token.cancelled() => return Err(BridgeError::Cancelled),
            session = self.registry.get_or_create(&key) => session?,
        };

        let adapter = session.adapter();
        let native = adapter.translate_request(
            &request.tool,
            &request.arguments,
            &session.capabilities(),
            session.descriptor(),
        )?;
        debug!(backend = %key, method = %native.method, "Forwarding to backend");

        let pending = session
            .forward(
                native,
                Some(id.to_string()),
                session.descriptor().request_timeout,
            )
            .await?;
        let native_id = pending.id().clone();

        let reply = tokio::select! {
            _ = token.cancelled() => {
                session.cancel(&native_id).await;
                return Err(BridgeError::Cancelled);
            }
            reply = pending.recv() => reply?,
        };
        adapter.translate_response(&request.tool, reply)
    }
}
