//! Session lifecycle

use crate::workspace::BackendKey;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Lifecycle of a backend session
///
/// `Starting → Handshaking → Ready → Draining → Terminated`, with `Crashed`
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Handshaking,
    Ready,
    Draining,
    Terminated,
    Crashed,
}

impl SessionState {
    /// Only `Ready` sessions take new requests
    pub fn accepts_requests(self) -> bool {
        self == Self::Ready
    }

    /// `Terminated` and `Crashed` are absorbing
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Crashed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Lifecycle events a session reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A session that had been ready went away unexpectedly
    Crashed {
        key: BackendKey,
        generation: u64,
        reason: String,
        uptime: Duration,
    },
}
