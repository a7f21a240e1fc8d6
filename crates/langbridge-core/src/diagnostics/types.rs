//! Diagnostic event types

use crate::types::Location;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Event severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Hint,
    Info,
    Warning,
    Error,
}

impl Severity {
    /// LSP `DiagnosticSeverity` (1 = Error .. 4 = Hint)
    pub fn from_lsp_diagnostic(value: Option<i64>) -> Self {
        match value {
            Some(2) => Self::Warning,
            Some(3) => Self::Info,
            Some(4) => Self::Hint,
            _ => Self::Error,
        }
    }

    /// LSP `MessageType` (1 = Error .. 4 = Log, 5 = Debug)
    pub fn from_lsp_message(value: Option<i64>) -> Self {
        match value {
            Some(1) => Self::Error,
            Some(2) => Self::Warning,
            Some(3) => Self::Info,
            _ => Self::Trace,
        }
    }

    /// MCP logging level (RFC 5424 names)
    pub fn from_mcp_level(level: &str) -> Self {
        match level {
            "debug" => Self::Trace,
            "info" | "notice" => Self::Info,
            "warning" => Self::Warning,
            "error" | "critical" | "alert" | "emergency" => Self::Error,
            _ => Self::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "trace",
            Self::Hint => "hint",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "log" => Ok(Self::Trace),
            "hint" => Ok(Self::Hint),
            "info" | "information" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// One unsolicited backend report: a published problem or a log/trace line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    /// Backend id (`language@root`)
    pub backend: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub received_at: DateTime<Utc>,
}

impl DiagnosticEvent {
    pub fn new(backend: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            severity,
            message: message.into(),
            source: None,
            location: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// File this event is anchored to, if any
    pub fn file(&self) -> Option<&str> {
        self.location.as_ref().map(|l| l.file.as_str())
    }
}

/// A change produced by one backend notification
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticUpdate {
    /// Append a single event
    Event(DiagnosticEvent),
    /// The complete current problem set for one file
    Publish {
        file: String,
        events: Vec<DiagnosticEvent>,
    },
}

/// Read filter for [`super::DiagnosticsAggregator::snapshot`]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DiagnosticFilter {
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub min_severity: Option<Severity>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl DiagnosticFilter {
    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an event passes every criterion except the limit
    pub fn matches(&self, event: &DiagnosticEvent) -> bool {
        self.backend.as_ref().is_none_or(|b| *b == event.backend)
            && self.min_severity.is_none_or(|s| event.severity >= s)
            && self
                .file
                .as_ref()
                .is_none_or(|f| event.file().is_some_and(|ef| Path::new(ef).ends_with(f)))
    }
}
