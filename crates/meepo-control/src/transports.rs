//! Transports to peers, by peer id

use crate::error::{MeepoError, MeepoResult};
use meepo_transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// Whether two handles point at the same transport
pub(crate) fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Manages the live transport to each peer
#[derive(Clone, Default)]
pub struct TransportManager {
    transports: Arc<RwLock<HashMap<String, Arc<dyn Transport>>>>,
}

impl TransportManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport, returning the one it replaced
    pub fn add(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let peer_id = transport.peer_id().to_string();
        let old = self
            .transports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer_id.clone(), transport);

        if old.is_some() {
            warn!(peer_id = %peer_id, "replaced existing transport");
        } else {
            info!(peer_id = %peer_id, "added transport");
        }
        old
    }

    pub fn get(&self, peer_id: &str) -> MeepoResult<Arc<dyn Transport>> {
        self.transports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
            .ok_or_else(|| MeepoError::TransportNotExist(peer_id.to_string()))
    }

    /// Remove `transport` if it is still the one registered for its peer
    pub fn remove(&self, transport: &Arc<dyn Transport>) -> bool {
        let mut transports = self
            .transports
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let peer_id = transport.peer_id();
        let current = transports
            .get(peer_id)
            .is_some_and(|t| same_transport(t, transport));
        if current {
            transports.remove(peer_id);
            info!(peer_id = %peer_id, "removed transport");
        }
        current
    }

    /// Whether `transport` is the one registered for its peer and still usable
    pub fn is_current(&self, transport: &Arc<dyn Transport>) -> bool {
        !transport.state().is_terminal()
            && self
                .transports
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(transport.peer_id())
                .is_some_and(|t| same_transport(t, transport))
    }

    pub fn list(&self) -> Vec<Arc<dyn Transport>> {
        self.transports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.transports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
