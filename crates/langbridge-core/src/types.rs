//! Agent-facing request and response types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool call issued by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Correlation id chosen by the agent; assigned by the gateway when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Tool identifier (e.g. "hover", "definition")
    pub tool: String,
    /// Tool arguments
    #[serde(default)]
    pub arguments: Value,
}

impl AgentRequest {
    /// Create a request without an id
    pub fn new(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: None,
            tool: tool.into(),
            arguments,
        }
    }

    /// Set the correlation id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Read a string argument
    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }
}

/// Reply to an [`AgentRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Id of the request this answers; null when the request was undecodable
    pub id: Option<String>,
    #[serde(flatten)]
    pub outcome: AgentOutcome,
}

/// Success payload or error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentOutcome {
    Result(Value),
    Error(AgentError),
}

impl AgentResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            outcome: AgentOutcome::Result(result),
        }
    }

    pub fn failure(id: Option<String>, error: impl Into<AgentError>) -> Self {
        Self {
            id,
            outcome: AgentOutcome::Error(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AgentOutcome::Result(_))
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            AgentOutcome::Result(value) => Some(value),
            AgentOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&AgentError> {
        match &self.outcome {
            AgentOutcome::Result(_) => None,
            AgentOutcome::Error(err) => Some(err),
        }
    }
}

/// Error payload of an [`AgentResponse`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<BackendDetail>,
}

/// Agent-visible error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    TransportError,
    HandshakeError,
    UnsupportedTool,
    BackendError,
    TimeoutError,
    BackendUnavailable,
    InvalidArguments,
    ConfigurationError,
    TranslationError,
    Cancelled,
}

/// A source range as agents see it: 1-based lines and columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

/// Error detail exactly as the backend reported it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
