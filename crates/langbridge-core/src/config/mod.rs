//! Bridge configuration
//!
//! A TOML file with global settings and one `[languages.<name>]` table per
//! backend. Every field except a language's `command` has a default.

mod descriptor;
mod loader;


pub use descriptor::{BackendConfigProvider, BackendDescriptor, ProtocolFamily};
pub use loader::{CONFIG_FILE_NAME, default_config_paths};

use crate::backoff::BackoffConfig;
use crate::channel::DEFAULT_MAX_FRAME_LEN;
use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted timeout or grace period
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_diagnostics_capacity() -> usize {
    256
}

fn default_max_restarts() -> u32 {
    3
}

fn default_window_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Workspace root used when a request names none
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Language used when a request carries neither `language` nor `file`
    #[serde(default)]
    pub default_language: Option<String>,
    /// Default deadline for forwarded requests
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Deadline for spawn plus handshake
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Time a backend gets to exit after the shutdown exchange
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Largest accepted frame body, in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Events retained per backend by the diagnostics aggregator
    #[serde(default = "default_diagnostics_capacity")]
    pub diagnostics_capacity: usize,
    /// Crash and restart handling
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Backends by language name
    #[serde(default)]
    pub languages: BTreeMap<String, LanguageConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            default_language: None,
            request_timeout_secs: default_request_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            diagnostics_capacity: default_diagnostics_capacity(),
            restart: RestartPolicy::default(),
            languages: BTreeMap::new(),
        }
    }
}

/// One backend definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Protocol family spoken by the backend
    #[serde(default)]
    pub protocol: ProtocolFamily,
    /// Executable to spawn
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// File extensions (without the dot) routed to this backend
    #[serde(default)]
    pub extensions: Vec<String>,
    /// LSP language identifier sent on `didOpen`; defaults to the table name
    #[serde(default)]
    pub language_id: Option<String>,
    /// Tool allowlist; absent means every tool the backend supports
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    /// Passed verbatim in the handshake
    #[serde(default)]
    pub initialization_options: Option<Value>,
    /// Overrides the global request timeout
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl LanguageConfig {
    pub fn new(protocol: ProtocolFamily, command: impl Into<String>) -> Self {
        Self {
            protocol,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            extensions: Vec::new(),
            language_id: None,
            capabilities: None,
            initialization_options: None,
            request_timeout_secs: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|e| e.to_string()).collect();
        self
    }
}

/// Restart handling for crashed or failing backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Failures tolerated within the window before a key is permanently failed
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Failures older than this no longer count
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Restart crashed backends in the background instead of on next use
    #[serde(default = "default_true")]
    pub eager: bool,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            window_secs: default_window_secs(),
            eager: true,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RestartPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Per-session timing and framing limits
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_frame_len: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(default_handshake_timeout_secs()),
            shutdown_grace: Duration::from_secs(default_shutdown_grace_secs()),
            max_frame_len: default_max_frame_bytes(),
        }
    }
}

fn check_timeout_bound(field: &str, secs: u64) -> BridgeResult<()> {
    if secs > MAX_TIMEOUT_SECS {
        return Err(BridgeError::config(format!(
            "{} must be at most {} seconds",
            field, MAX_TIMEOUT_SECS
        )));
    }
    Ok(())
}

impl BridgeConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> BridgeResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| BridgeError::config(format!("Failed to parse TOML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> BridgeResult<()> {
        if self.request_timeout_secs == 0 {
            return Err(BridgeError::config("request_timeout_secs must be positive"));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(BridgeError::config("handshake_timeout_secs must be positive"));
        }
        for (field, secs) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
            ("restart.window_secs", self.restart.window_secs),
        ] {
            check_timeout_bound(field, secs)?;
        }
        check_timeout_bound(
            "restart.backoff.max_delay_ms",
            self.restart.backoff.max_delay_ms.div_ceil(1000),
        )?;
        if self.max_frame_bytes == 0 {
            return Err(BridgeError::config("max_frame_bytes must be positive"));
        }
        if self.restart.backoff.multiplier < 1.0 {
            return Err(BridgeError::config("restart.backoff.multiplier must be >= 1.0"));
        }
        if let Some(language) = &self.default_language {
            if !self.languages.contains_key(language) {
                return Err(BridgeError::config(format!(
                    "default_language '{}' is not configured",
                    language
                )));
            }
        }

        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (name, language) in &self.languages {
            if language.command.trim().is_empty() {
                return Err(BridgeError::config(format!(
                    "languages.{}: command must not be empty",
                    name
                )));
            }
            if language.request_timeout_secs == Some(0) {
                return Err(BridgeError::config(format!(
                    "languages.{}: request_timeout_secs must be positive",
                    name
                )));
            }
            if let Some(secs) = language.request_timeout_secs {
                check_timeout_bound(&format!("languages.{}.request_timeout_secs", name), secs)?;
            }
            for extension in &language.extensions {
                if let Some(other) = seen.insert(extension.as_str(), name.as_str()) {
                    return Err(BridgeError::config(format!(
                        "extension '{}' claimed by both '{}' and '{}'",
                        extension, other, name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a language by name
    pub fn language(&self, name: &str) -> Option<&LanguageConfig> {
        self.languages.get(name)
    }

    /// Language that owns a file extension (given without the dot)
    pub fn language_for_extension(&self, extension: &str) -> Option<&str> {
        let extension = extension.trim_start_matches('.');
        self.languages
            .iter()
            .find(|(_, language)| {
                language
                    .extensions
                    .iter()
                    .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(extension))
            })
            .map(|(name, _)| name.as_str())
    }

    /// Add or replace a language
    pub fn with_language(mut self, name: impl Into<String>, language: LanguageConfig) -> Self {
        self.languages.insert(name.into(), language);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            max_frame_len: self.max_frame_bytes,
        }
    }
}
