//! Langbridge Core Library
//!
//! Protocol bridge between coding agents and language-intelligence
//! backends. Agents send tool calls over a framed request/response channel;
//! the bridge routes each call to a backend process (a language server or an
//! MCP tool server) keyed by workspace root and language, translates it into
//! the backend's native JSON-RPC, and translates the reply back.
//!
//! The pieces, bottom-up:
//! - [`channel`]: Content-Length framing over any byte stream
//! - [`session`]: one backend process, its handshake and pending requests
//! - [`registry`]: at most one session per key, with restart supervision
//! - [`adapter`]: per-protocol-family translation
//! - [`router`] and [`gateway`]: the agent-facing side
//! - [`diagnostics`]: bounded store of backend-reported events

pub mod adapter;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod gateway;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod types;
pub mod workspace;

// Re-export commonly used types
pub use adapter::{Adapter, CapabilitySet, LspAdapter, McpAdapter};
pub use backoff::BackoffConfig;
pub use channel::{DecodeError, FrameCodec, FramedChannel};
pub use config::{
    BackendConfigProvider, BackendDescriptor, BridgeConfig, LanguageConfig, ProtocolFamily,
    RestartPolicy, SessionSettings,
};
pub use diagnostics::{DiagnosticEvent, DiagnosticFilter, DiagnosticsAggregator, Severity};
pub use error::{BridgeError, BridgeResult};
pub use gateway::{Gateway, GatewayOptions};
pub use process::{BackendProcess, CommandLauncher, LaunchedBackend, ProcessLauncher};
pub use registry::{BackendRegistry, BackendStatus};
pub use router::Router;
pub use session::{BackendSession, PendingReply, SessionEvent, SessionOptions, SessionState};
pub use types::{AgentError, AgentRequest, AgentResponse, ErrorKind, Location};
pub use workspace::{BackendKey, ConfigClassifier, WorkspaceClassifier};
