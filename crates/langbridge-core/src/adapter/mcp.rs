//! Model Context Protocol adapter
//!
//! Every agent tool becomes a `tools/call` on the server; the server decides
//! which tool names exist.

use super::{CapabilitySet, NativeReply, NativeRequest, native_error};
use crate::config::BackendDescriptor;
use crate::diagnostics::{DiagnosticEvent, DiagnosticUpdate, Severity};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Notification, Request, RequestId, RpcError};
use crate::workspace::BackendKey;
use serde_json::{Value, json};
use tracing::trace;
use url::Url;

/// Protocol revision requested in the handshake
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Arguments consumed by routing and never forwarded to the tool
const ROUTING_KEYS: &[&str] = &["workspace", "language"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct McpAdapter;

impl McpAdapter {
    pub fn precheck(&self, tool: &str, descriptor: &BackendDescriptor) -> BridgeResult<()> {
        if tool.is_empty() {
            return Err(BridgeError::invalid_arguments("tool name must not be empty"));
        }
        if !descriptor.allows(tool) {
            return Err(BridgeError::unsupported(
                tool,
                format!("not enabled for backend {}", descriptor.key()),
            ));
        }
        Ok(())
    }

    pub fn translate_request(
        &self,
        tool: &str,
        arguments: &Value,
        capabilities: &CapabilitySet,
        descriptor: &BackendDescriptor,
    ) -> BridgeResult<NativeRequest> {
        self.precheck(tool, descriptor)?;
        if !capabilities.supports("tools") {
            return Err(BridgeError::unsupported(
                tool,
                format!("backend {} does not advertise tools", descriptor.key()),
            ));
        }

        let arguments = match arguments {
            Value::Null => json!({}),
            Value::Object(map) => {
                let mut map = map.clone();
                for key in ROUTING_KEYS {
                    map.remove(*key);
                }
                Value::Object(map)
            }
            _ => return Err(BridgeError::invalid_arguments("'arguments' must be an object")),
        };

        Ok(NativeRequest::new(
            "tools/call",
            json!({ "name": tool, "arguments": arguments }),
        ))
    }

    pub fn translate_response(&self, _tool: &str, reply: NativeReply) -> BridgeResult<Value> {
        let result = reply.map_err(native_error)?;
        if !result.is_object() {
            return Err(BridgeError::translation(format!(
                "tools/call result is not an object: {}",
                result
            )));
        }

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let message = content_text(&result);
            let message = if message.is_empty() {
                "tool reported an error".to_string()
            } else {
                message
            };
            return Err(BridgeError::backend(None, message, Some(result)));
        }
        Ok(result)
    }

    pub fn handshake_request(&self) -> (&'static str, Value) {
        (
            "initialize",
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": { "roots": { "listChanged": false } },
                "clientInfo": {
                    "name": "langbridge",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
    }

    pub fn answer_backend_request(
        &self,
        request: &Request,
        descriptor: &BackendDescriptor,
    ) -> Result<Value, RpcError> {
        match request.method.as_str() {
            "ping" => Ok(json!({})),
            "roots/list" => {
                let roots = Url::from_directory_path(&descriptor.root)
                    .map(|uri| {
                        vec![json!({
                            "uri": uri.to_string(),
                            "name": descriptor.root.display().to_string(),
                        })]
                    })
                    .unwrap_or_default();
                Ok(json!({ "roots": roots }))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }

    pub fn translate_notification(
        &self,
        backend: &BackendKey,
        notification: &Notification,
    ) -> Vec<DiagnosticUpdate> {
        let params = notification.params.as_ref().unwrap_or(&Value::Null);
        match notification.method.as_str() {
            "notifications/message" => {
                let severity = params
                    .get("level")
                    .and_then(Value::as_str)
                    .map(Severity::from_mcp_level)
                    .unwrap_or(Severity::Info);
                let message = match params.get("data") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let mut event = DiagnosticEvent::new(backend.id(), severity, message);
                if let Some(logger) = params.get("logger").and_then(Value::as_str) {
                    event = event.with_source(logger);
                }
                vec![DiagnosticUpdate::Event(event)]
            }
            other => {
                trace!(backend = %backend, method = other, "Ignoring notification");
                Vec::new()
            }
        }
    }
}

pub(super) fn cancel_notification(id: &RequestId) -> Notification {
    Notification::new("notifications/cancelled").with_params(json!({
        "requestId": id,
        "reason": "cancelled by client",
    }))
}

/// Concatenated text blocks of a tool result
fn content_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}
