//! Diagnostics aggregation
//!
//! Collects unsolicited backend output (published problems, log and trace
//! lines) in a bounded per-backend buffer. Readers take snapshots; live
//! consumers subscribe to a broadcast of every new event.

mod types;


pub use types::{DiagnosticEvent, DiagnosticFilter, DiagnosticUpdate, Severity};

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Default per-backend capacity
pub const DEFAULT_CAPACITY: usize = 256;

const BROADCAST_CAPACITY: usize = 1024;

struct Inner {
    capacity: usize,
    buffers: Mutex<HashMap<String, VecDeque<DiagnosticEvent>>>,
    sender: broadcast::Sender<DiagnosticEvent>,
}

/// Shared diagnostics store; clones refer to the same buffers
#[derive(Clone)]
pub struct DiagnosticsAggregator {
    inner: Arc<Inner>,
}

impl DiagnosticsAggregator {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                buffers: Mutex::new(HashMap::new()),
                sender,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Append one event, evicting the backend's oldest past capacity
    pub fn record(&self, event: DiagnosticEvent) {
        {
            let mut buffers = self.inner.buffers.lock();
            let buffer = buffers.entry(event.backend.clone()).or_default();
            Self::push_bounded(buffer, event.clone(), self.inner.capacity);
        }
        self.broadcast(event);
    }

    /// Replace a backend's problems for one file with a new set
    pub fn publish(&self, backend: &str, file: &str, events: Vec<DiagnosticEvent>) {
        {
            let mut buffers = self.inner.buffers.lock();
            let buffer = buffers.entry(backend.to_string()).or_default();
            buffer.retain(|e| e.file() != Some(file));
            for event in &events {
                Self::push_bounded(buffer, event.clone(), self.inner.capacity);
            }
        }
        for event in events {
            self.broadcast(event);
        }
    }

    /// Apply an update produced by an adapter
    pub fn apply(&self, backend: &str, update: DiagnosticUpdate) {
        match update {
            DiagnosticUpdate::Event(event) => self.record(event),
            DiagnosticUpdate::Publish { file, events } => self.publish(backend, &file, events),
        }
    }

    /// Point-in-time view for reading with a filter
    ///
    /// Events come newest first, so a filter limit keeps the most recent ones.
    pub fn snapshot(&self, filter: DiagnosticFilter) -> DiagnosticSnapshot {
        let buffers = self.inner.buffers.lock();
        let mut events: Vec<DiagnosticEvent> = buffers
            .iter()
            .filter(|(backend, _)| filter.backend.as_ref().is_none_or(|b| b == *backend))
            .flat_map(|(_, buffer)| buffer.iter().rev().cloned())
            .collect();
        drop(buffers);

        // Stable sort: equal timestamps keep each backend's newest-first order
        events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        DiagnosticSnapshot { events, filter }
    }

    /// Receive every event recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.inner.sender.subscribe()
    }

    /// Backend ids that have recorded anything
    pub fn backends(&self) -> Vec<String> {
        let mut backends: Vec<String> = self.inner.buffers.lock().keys().cloned().collect();
        backends.sort();
        backends
    }

    /// Number of events held for a backend
    pub fn len(&self, backend: &str) -> usize {
        self.inner
            .buffers
            .lock()
            .get(backend)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buffers.lock().values().all(VecDeque::is_empty)
    }

    fn push_bounded(buffer: &mut VecDeque<DiagnosticEvent>, event: DiagnosticEvent, capacity: usize) {
        while buffer.len() >= capacity {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }

    fn broadcast(&self, event: DiagnosticEvent) {
        // No receivers is the normal case when nobody subscribed
        if self.inner.sender.send(event).is_err() {
            trace!("No diagnostic subscribers");
        }
    }
}

impl Default for DiagnosticsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Events captured at one point in time, newest first
///
/// Iterating is lazy and can be repeated; each pass applies the filter and
/// limit afresh.
#[derive(Debug, Clone)]
pub struct DiagnosticSnapshot {
    events: Vec<DiagnosticEvent>,
    filter: DiagnosticFilter,
}

impl DiagnosticSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &DiagnosticEvent> + '_ {
        self.events
            .iter()
            .filter(|e| self.filter.matches(e))
            .take(self.filter.limit.unwrap_or(usize::MAX))
    }

    pub fn filter(&self) -> &DiagnosticFilter {
        &self.filter
    }
}

impl<'a> IntoIterator for &'a DiagnosticSnapshot {
    type Item = &'a DiagnosticEvent;
    type IntoIter = Box<dyn Iterator<Item = &'a DiagnosticEvent> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
