//! Protocol adapters
//!
//! An adapter translates agent tool calls into one backend family's native
//! requests and back, and owns everything else that differs between
//! families: the handshake, cancellation, shutdown, answers to
//! backend-initiated requests, and notification handling.
//!
//! Adapters are selected by the backend's [`ProtocolFamily`], never by tool
//! name.

mod lsp;
mod mcp;


pub use lsp::{LSP_TOOLS, LspAdapter};
pub use mcp::McpAdapter;

use crate::config::{BackendDescriptor, ProtocolFamily};
use crate::diagnostics::DiagnosticUpdate;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Notification, Request, RequestId, Response, RpcError};
use crate::workspace::BackendKey;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

/// Native reply as the backend sent it
pub type NativeReply = Result<Value, RpcError>;

/// Capabilities negotiated during the handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CapabilitySet {
    /// Capability object exactly as the backend reported it
    pub raw: Value,
    /// Backend self-description (`serverInfo`), when provided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Value>,
}

impl CapabilitySet {
    pub fn new(raw: Value) -> Self {
        Self {
            raw,
            server_info: None,
        }
    }

    /// Whether the backend advertises a capability
    ///
    /// Absent, `null` and `false` mean unsupported; `true` and any options
    /// object mean supported.
    pub fn supports(&self, name: &str) -> bool {
        match self.raw.get(name) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(_) => true,
        }
    }
}

/// A file the backend must have open before a request about it
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRef {
    pub path: PathBuf,
    pub uri: String,
}

/// A translated request, ready to hand to a session
#[derive(Debug, Clone, PartialEq)]
pub struct NativeRequest {
    pub method: String,
    pub params: Value,
    /// Document to synchronise first, for file-anchored requests
    pub document: Option<DocumentRef>,
}

impl NativeRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            document: None,
        }
    }

    pub fn with_document(mut self, document: DocumentRef) -> Self {
        self.document = Some(document);
        self
    }
}

/// Per-family translator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    Lsp(LspAdapter),
    Mcp(McpAdapter),
}

impl Adapter {
    pub fn for_family(family: ProtocolFamily) -> Self {
        match family {
            ProtocolFamily::Lsp => Self::Lsp(LspAdapter),
            ProtocolFamily::Mcp => Self::Mcp(McpAdapter),
        }
    }

    pub fn family(&self) -> ProtocolFamily {
        match self {
            Self::Lsp(_) => ProtocolFamily::Lsp,
            Self::Mcp(_) => ProtocolFamily::Mcp,
        }
    }

    /// Fail with `UnsupportedTool` or `InvalidArguments` when a call can be
    /// rejected before any backend exists
    pub fn precheck(
        &self,
        tool: &str,
        arguments: &Value,
        descriptor: &BackendDescriptor,
    ) -> BridgeResult<()> {
        match self {
            Self::Lsp(a) => a.precheck(tool, arguments, descriptor),
            Self::Mcp(a) => a.precheck(tool, descriptor),
        }
    }

    /// Method and params of the startup handshake request
    pub fn handshake_request(&self, descriptor: &BackendDescriptor) -> (&'static str, Value) {
        match self {
            Self::Lsp(a) => a.handshake_request(descriptor),
            Self::Mcp(a) => a.handshake_request(),
        }
    }

    /// Extract capabilities from the handshake result
    ///
    /// Both families answer `initialize` with `capabilities` and an optional
    /// `serverInfo`.
    pub fn parse_capabilities(&self, result: Value) -> BridgeResult<CapabilitySet> {
        let capabilities = result
            .get("capabilities")
            .filter(|c| c.is_object())
            .cloned()
            .ok_or_else(|| {
                BridgeError::translation("initialize result has no capabilities object")
            })?;
        Ok(CapabilitySet {
            raw: capabilities,
            server_info: result.get("serverInfo").cloned(),
        })
    }

    /// Sent once the handshake reply has been accepted
    pub fn initialized_notification(&self) -> Notification {
        match self {
            Self::Lsp(_) => Notification::new("initialized").with_params(Value::Object(Default::default())),
            Self::Mcp(_) => Notification::new("notifications/initialized"),
        }
    }

    /// Request that asks the backend to prepare for exit, if the family has one
    pub fn shutdown_method(&self) -> Option<&'static str> {
        match self {
            Self::Lsp(_) => Some("shutdown"),
            Self::Mcp(_) => None,
        }
    }

    /// Notification that tells the backend to exit, if the family has one
    pub fn exit_notification(&self) -> Option<Notification> {
        match self {
            Self::Lsp(_) => Some(Notification::new("exit")),
            Self::Mcp(_) => None,
        }
    }

    /// Advisory notification withdrawing an in-flight request
    pub fn cancel_notification(&self, id: &RequestId) -> Notification {
        match self {
            Self::Lsp(_) => lsp::cancel_notification(id),
            Self::Mcp(_) => mcp::cancel_notification(id),
        }
    }

    /// `didOpen`-style notification for a file, if the family tracks documents
    pub fn open_document(
        &self,
        document: &DocumentRef,
        language_id: &str,
        text: String,
    ) -> Option<Notification> {
        match self {
            Self::Lsp(_) => Some(lsp::did_open(document, language_id, text)),
            Self::Mcp(_) => None,
        }
    }

    /// Answer a request the backend sent to the bridge
    pub fn answer_backend_request(
        &self,
        request: &Request,
        descriptor: &BackendDescriptor,
    ) -> Response {
        let answer = match self {
            Self::Lsp(a) => a.answer_backend_request(request, descriptor),
            Self::Mcp(a) => a.answer_backend_request(request, descriptor),
        };
        match answer {
            Ok(result) => Response::success(request.id.clone(), result),
            Err(error) => Response::error(request.id.clone(), error),
        }
    }

    /// Diagnostics carried by a backend notification
    pub fn translate_notification(
        &self,
        backend: &BackendKey,
        notification: &Notification,
    ) -> Vec<DiagnosticUpdate> {
        match self {
            Self::Lsp(a) => a.translate_notification(backend, notification),
            Self::Mcp(a) => a.translate_notification(backend, notification),
        }
    }

    /// Agent tool call to native request
    pub fn translate_request(
        &self,
        tool: &str,
        arguments: &Value,
        capabilities: &CapabilitySet,
        descriptor: &BackendDescriptor,
    ) -> BridgeResult<NativeRequest> {
        match self {
            Self::Lsp(a) => a.translate_request(tool, arguments, capabilities, descriptor),
            Self::Mcp(a) => a.translate_request(tool, arguments, capabilities, descriptor),
        }
    }

    /// Native reply to agent result
    pub fn translate_response(&self, tool: &str, reply: NativeReply) -> BridgeResult<Value> {
        match self {
            Self::Lsp(a) => a.translate_response(tool, reply),
            Self::Mcp(a) => a.translate_response(tool, reply),
        }
    }
}

/// Convert a native error into a bridge error, keeping every field
pub(crate) fn native_error(error: RpcError) -> BridgeError {
    crate::error::BridgeError::backend(Some(error.code), error.message, error.data)
}
