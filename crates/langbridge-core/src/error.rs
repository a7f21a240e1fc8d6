//! Bridge error types
//!
//! Every failure that can reach an agent is a [`BridgeError`]. Each variant
//! maps to exactly one agent-visible [`ErrorKind`], and backend-native error
//! detail is carried through untouched.

use crate::types::{AgentError, BackendDetail, ErrorKind};
use serde_json::Value;
use thiserror::Error;

/// Result alias used throughout the crate
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    /// Channel-level failure: malformed frame, stream closed, write failed
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The backend could not be spawned or did not complete its handshake
    #[error("Handshake with {backend} failed: {message}")]
    Handshake {
        backend: String,
        message: String,
        /// Native error returned by the backend, if it rejected the handshake
        detail: Option<BackendDetail>,
    },

    /// No adapter mapping or backend capability exists for the tool
    #[error("Unsupported tool '{tool}': {reason}")]
    UnsupportedTool { tool: String, reason: String },

    /// The backend answered with its own error
    #[error("Backend error{}: {message}", .code.map(|c| format!(" {c}")).unwrap_or_default())]
    Backend {
        code: Option<i64>,
        message: String,
        data: Option<Value>,
    },

    /// The request outlived its deadline
    #[error("Request timed out after {millis} ms")]
    Timeout { millis: u64 },

    /// The backend session is gone or will not be restarted
    #[error("Backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// Missing or ill-typed request arguments
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// No usable configuration for the requested backend
    #[error("Configuration error: {0}")]
    Config(String),

    /// A backend reply could not be mapped to an agent result
    #[error("Translation error: {0}")]
    Translation(String),

    /// The caller withdrew the request
    #[error("Request cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn handshake(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handshake {
            backend: backend.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn unsupported(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedTool {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn backend(code: Option<i64>, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::Backend {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn timeout(millis: u64) -> Self {
        Self::Timeout { millis }
    }

    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn translation(message: impl Into<String>) -> Self {
        Self::Translation(message.into())
    }

    /// Agent-visible category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::TransportError,
            Self::Handshake { .. } => ErrorKind::HandshakeError,
            Self::UnsupportedTool { .. } => ErrorKind::UnsupportedTool,
            Self::Backend { .. } => ErrorKind::BackendError,
            Self::Timeout { .. } => ErrorKind::TimeoutError,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::InvalidArguments(_) => ErrorKind::InvalidArguments,
            Self::Config(_) => ErrorKind::ConfigurationError,
            Self::Translation(_) => ErrorKind::TranslationError,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Stable machine-readable code for log fields
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "BRIDGE_TRANSPORT",
            Self::Handshake { .. } => "BRIDGE_HANDSHAKE",
            Self::UnsupportedTool { .. } => "BRIDGE_UNSUPPORTED_TOOL",
            Self::Backend { .. } => "BRIDGE_BACKEND",
            Self::Timeout { .. } => "BRIDGE_TIMEOUT",
            Self::BackendUnavailable { .. } => "BRIDGE_BACKEND_UNAVAILABLE",
            Self::InvalidArguments(_) => "BRIDGE_INVALID_ARGUMENTS",
            Self::Config(_) => "BRIDGE_CONFIG",
            Self::Translation(_) => "BRIDGE_TRANSLATION",
            Self::Cancelled => "BRIDGE_CANCELLED",
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Timeout { .. }
                | Self::BackendUnavailable { .. }
                | Self::Handshake { .. }
        )
    }

    /// Backend-native detail, when the backend produced this error
    pub fn backend_detail(&self) -> Option<BackendDetail> {
        match self {
            Self::Backend {
                code,
                message,
                data,
            } => Some(BackendDetail {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            }),
            Self::Handshake { detail, .. } => detail.clone(),
            _ => None,
        }
    }
}

impl From<&BridgeError> for AgentError {
    fn from(err: &BridgeError) -> Self {
        let message = match err {
            // Backend messages go out unprefixed
            BridgeError::Backend { message, .. } => message.clone(),
            other => other.to_string(),
        };
        AgentError {
            kind: err.kind(),
            message,
            detail: err.backend_detail(),
        }
    }
}

impl From<BridgeError> for AgentError {
    fn from(err: BridgeError) -> Self {
        AgentError::from(&err)
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::translation(err.to_string())
    }
}
