//! Pending requests tracker
//!
//! Tracks control requests sent to peers and routes responses back to the
//! callers waiting on them, keyed by correlation id.

use dashmap::DashMap;
use meepo_proto::ControlMessage;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Tracks control requests awaiting responses
#[derive(Clone, Default)]
pub struct PendingRequests {
    /// Maps correlation id -> oneshot sender for the response
    requests: Arc<DashMap<String, oneshot::Sender<ControlMessage>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request
    /// Returns a receiver that will receive the response
    pub fn register(&self, correlation_id: &str) -> oneshot::Receiver<ControlMessage> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(correlation_id.to_string(), tx);
        debug!(correlation_id, "registered pending request");
        rx
    }

    /// Deliver a response to its waiting caller
    /// Returns false when nobody waits for it (late or unknown)
    pub fn respond(&self, response: ControlMessage) -> bool {
        let correlation_id = response.correlation_id().to_string();
        let Some((_, tx)) = self.requests.remove(&correlation_id) else {
            warn!(%correlation_id, method = response.method(), "dropping response without pending request");
            return false;
        };
        if tx.send(response).is_err() {
            warn!(%correlation_id, "receiver for response dropped");
            return false;
        }
        true
    }

    /// Cancel a pending request (e.g., on timeout or error)
    pub fn cancel(&self, correlation_id: &str) {
        if self.requests.remove(correlation_id).is_some() {
            debug!(correlation_id, "cancelled pending request");
        }
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}
