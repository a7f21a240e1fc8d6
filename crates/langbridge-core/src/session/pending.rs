//! Requests awaiting a backend reply

use crate::adapter::NativeReply;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::RequestId;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Reply channel of one pending request
pub(crate) type ReplySender = oneshot::Sender<BridgeResult<NativeReply>>;

pub(crate) struct PendingRequest {
    /// Agent request this forwards, if any
    pub agent_id: Option<String>,
    pub method: String,
    pub issued_at: Instant,
    pub deadline: Instant,
    pub reply: ReplySender,
}

impl PendingRequest {
    pub fn resolve(self, outcome: BridgeResult<NativeReply>) {
        // The caller may have stopped waiting; nothing to do then
        let _ = self.reply.send(outcome);
    }
}

/// Pending requests keyed by native id; owned by the session driver
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<RequestId, PendingRequest>,
}

impl PendingTable {
    pub fn insert(&mut self, id: RequestId, request: PendingRequest) {
        self.entries.insert(id, request);
    }

    pub fn remove(&mut self, id: &RequestId) -> Option<PendingRequest> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest deadline among pending requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    /// Remove and return every request whose deadline has passed
    pub fn take_expired(&mut self, now: Instant) -> Vec<(RequestId, PendingRequest)> {
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Resolve everything still pending with the same error
    pub fn fail_all(&mut self, error: &BridgeError) -> usize {
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            pending.resolve(Err(error.clone()));
        }
        count
    }
}
