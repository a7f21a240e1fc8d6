//! Backend descriptors

use super::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::workspace::BackendKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Wire protocol family of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    /// Language Server Protocol
    #[default]
    Lsp,
    /// Model Context Protocol tool server
    Mcp,
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lsp => write!(f, "lsp"),
            Self::Mcp => write!(f, "mcp"),
        }
    }
}

/// Everything needed to start one backend; immutable once a session uses it
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDescriptor {
    pub family: ProtocolFamily,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Workspace root; also the process working directory
    pub root: PathBuf,
    /// Language name as configured
    pub language: String,
    /// Identifier sent to LSP servers in `didOpen`
    pub language_id: String,
    /// Tool allowlist; `None` allows everything the backend supports
    pub declared_capabilities: Option<Vec<String>>,
    pub initialization_options: Option<Value>,
    pub request_timeout: Duration,
}

impl BackendDescriptor {
    pub fn new(
        family: ProtocolFamily,
        command: impl Into<String>,
        root: impl Into<PathBuf>,
        language: impl Into<String>,
    ) -> Self {
        let language = language.into();
        Self {
            family,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            root: root.into(),
            language_id: language.clone(),
            language,
            declared_capabilities: None,
            initialization_options: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_declared_capabilities(mut self, tools: &[&str]) -> Self {
        self.declared_capabilities = Some(tools.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn key(&self) -> BackendKey {
        BackendKey::new(self.root.clone(), self.language.clone())
    }

    /// Whether the allowlist permits a tool
    pub fn allows(&self, tool: &str) -> bool {
        self.declared_capabilities
            .as_ref()
            .is_none_or(|tools| tools.iter().any(|t| t == tool))
    }
}

/// Supplies the descriptor for a backend key
pub trait BackendConfigProvider: Send + Sync {
    fn descriptor(&self, key: &BackendKey) -> BridgeResult<BackendDescriptor>;
}

impl BackendConfigProvider for BridgeConfig {
    fn descriptor(&self, key: &BackendKey) -> BridgeResult<BackendDescriptor> {
        let language = self.language(&key.language).ok_or_else(|| {
            BridgeError::config(format!(
                "no backend configured for language '{}'",
                key.language
            ))
        })?;

        Ok(BackendDescriptor {
            family: language.protocol,
            command: language.command.clone(),
            args: language.args.clone(),
            env: language.env.clone(),
            root: key.root.clone(),
            language: key.language.clone(),
            language_id: language
                .language_id
                .clone()
                .unwrap_or_else(|| key.language.clone()),
            declared_capabilities: language.capabilities.clone(),
            initialization_options: language.initialization_options.clone(),
            request_timeout: language
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| self.request_timeout()),
        })
    }
}
