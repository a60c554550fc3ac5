//! Teleportation registry
//!
//! Source halves (tunnels this node initiated) and sink halves (tunnels a
//! peer initiated towards this node) live in two independent maps, so the
//! same name may exist once in each. Lookups that don't know the role search
//! one map and fall back to the other.

use crate::error::{MeepoError, MeepoResult};
use crate::transports::same_transport;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use meepo_proto::Addr;
use meepo_teleportation::{Teleportation, TeleportationSink, TeleportationSource};
use meepo_transport::Transport;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Which map [`TeleportationRegistry::get_teleportation`] searches first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOrder {
    SourceFirst,
    SinkFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Sink,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Sink => f.write_str("sink"),
        }
    }
}

/// Snapshot of one registered half
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeleportationInfo {
    pub name: String,
    pub role: Role,
    pub source: Addr,
    pub sink: Addr,
    pub peer_id: String,
    pub active_streams: usize,
}

impl TeleportationInfo {
    fn of(role: Role, ts: &dyn Teleportation) -> Self {
        Self {
            name: ts.name().to_string(),
            role,
            source: ts.source(),
            sink: ts.sink(),
            peer_id: ts.transport().peer_id().to_string(),
            active_streams: ts.active_streams(),
        }
    }
}

/// Registry of teleportation halves by name
#[derive(Default)]
pub struct TeleportationRegistry {
    sources: Arc<DashMap<String, Arc<TeleportationSource>>>,
    sinks: Arc<DashMap<String, Arc<TeleportationSink>>>,
    /// Source names with a creation in flight
    reserved: Arc<DashSet<String>>,
}

/// Claim on a source name while its teleportation is being created
///
/// Dropping the reservation without registering releases the name.
#[must_use]
pub struct SourceReservation {
    name: String,
    reserved: Arc<DashSet<String>>,
}

impl SourceReservation {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SourceReservation {
    fn drop(&mut self) {
        self.reserved.remove(&self.name);
    }
}

impl TeleportationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `name` for a source about to be created
    pub fn reserve_source(&self, name: &str) -> MeepoResult<SourceReservation> {
        if self.sources.contains_key(name) || !self.reserved.insert(name.to_string()) {
            return Err(MeepoError::TeleportationAlreadyExist(name.to_string()));
        }
        // A source may have been registered between the two checks
        if self.sources.contains_key(name) {
            self.reserved.remove(name);
            return Err(MeepoError::TeleportationAlreadyExist(name.to_string()));
        }
        Ok(SourceReservation {
            name: name.to_string(),
            reserved: self.reserved.clone(),
        })
    }

    /// Register a source under the name it reserved
    pub fn add_source(
        &self,
        reservation: SourceReservation,
        ts: Arc<TeleportationSource>,
    ) -> MeepoResult<()> {
        match self.sources.entry(reservation.name.clone()) {
            Entry::Occupied(_) => Err(MeepoError::TeleportationAlreadyExist(reservation.name.clone())),
            Entry::Vacant(slot) => {
                trace!(name = %reservation.name, "add teleportation source");
                slot.insert(ts);
                Ok(())
            }
        }
    }

    pub fn add_sink(&self, ts: Arc<TeleportationSink>) -> MeepoResult<()> {
        match self.sinks.entry(ts.name().to_string()) {
            Entry::Occupied(slot) => Err(MeepoError::TeleportationAlreadyExist(slot.key().clone())),
            Entry::Vacant(slot) => {
                trace!(name = %slot.key(), "add teleportation sink");
                slot.insert(ts);
                Ok(())
            }
        }
    }

    /// Remove `ts` if it is still the source registered under `name`
    pub fn remove_source(&self, name: &str, ts: &Arc<TeleportationSource>) -> bool {
        let removed = self
            .sources
            .remove_if(name, |_, current| Arc::ptr_eq(current, ts))
            .is_some();
        if removed {
            trace!(name, "remove teleportation source");
        }
        removed
    }

    /// Remove `ts` if it is still the sink registered under `name`
    pub fn remove_sink(&self, name: &str, ts: &Arc<TeleportationSink>) -> bool {
        let removed = self
            .sinks
            .remove_if(name, |_, current| Arc::ptr_eq(current, ts))
            .is_some();
        if removed {
            trace!(name, "remove teleportation sink");
        }
        removed
    }

    pub fn get_source(&self, name: &str) -> Option<Arc<TeleportationSource>> {
        self.sources.get(name).map(|entry| entry.value().clone())
    }

    pub fn get_sink(&self, name: &str) -> Option<Arc<TeleportationSink>> {
        self.sinks.get(name).map(|entry| entry.value().clone())
    }

    /// Look a half up in both maps, in the given order
    pub fn get_teleportation(
        &self,
        name: &str,
        order: SearchOrder,
    ) -> MeepoResult<Arc<dyn Teleportation>> {
        let source = || {
            self.get_source(name)
                .map(|ts| ts as Arc<dyn Teleportation>)
        };
        let sink = || self.get_sink(name).map(|ts| ts as Arc<dyn Teleportation>);

        let found = match order {
            SearchOrder::SourceFirst => source().or_else(sink),
            SearchOrder::SinkFirst => sink().or_else(source),
        };
        found.ok_or(MeepoError::TeleportationNotExist)
    }

    /// Source halves whose transport leads to `peer_id`
    pub fn list_by_peer_id(&self, peer_id: &str) -> Vec<Arc<TeleportationSource>> {
        self.sources
            .iter()
            .filter(|entry| entry.value().transport().peer_id() == peer_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every half, of either role, carried by `transport`
    pub fn bound_to(&self, transport: &Arc<dyn Transport>) -> Vec<Arc<dyn Teleportation>> {
        self.all()
            .into_iter()
            .filter(|ts| same_transport(&ts.transport(), transport))
            .collect()
    }

    /// Snapshot of every registered half, sources first
    pub fn list(&self) -> Vec<TeleportationInfo> {
        let mut infos: Vec<TeleportationInfo> = self
            .sources
            .iter()
            .map(|entry| TeleportationInfo::of(Role::Source, entry.value().as_ref()))
            .collect();
        infos.extend(
            self.sinks
                .iter()
                .map(|entry| TeleportationInfo::of(Role::Sink, entry.value().as_ref())),
        );
        infos
    }

    /// Every registered half, for shutdown
    pub fn all(&self) -> Vec<Arc<dyn Teleportation>> {
        let mut all: Vec<Arc<dyn Teleportation>> = self
            .sources
            .iter()
            .map(|entry| entry.value().clone() as Arc<dyn Teleportation>)
            .collect();
        all.extend(
            self.sinks
                .iter()
                .map(|entry| entry.value().clone() as Arc<dyn Teleportation>),
        );
        all
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.sinks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use meepo_teleportation::{SinkConfig, SourceConfig, TeleportationError};
    use meepo_transport::{MemoryTransport, Transport};
    use tokio::sync::mpsc;

    fn transport(peer: &str) -> Arc<dyn Transport> {
        let (local, _remote) = MemoryTransport::pair("alice", peer);
        local
    }

    fn source(name: &str, peer: &str, sink: &str) -> Arc<TeleportationSource> {
        let (_tx, rx) = mpsc::unbounded_channel();
        let config = SourceConfig::builder()
            .name(name)
            .source("127.0.0.1:40000".parse().unwrap())
            .sink(sink.parse().unwrap())
            .transport(transport(peer))
            .dial_requests(rx)
            .do_teleport(Arc::new(
                |_: String| -> BoxFuture<'static, Result<(), TeleportationError>> {
                    Box::pin(async { Ok(()) })
                },
            ))
            .build()
            .unwrap();
        TeleportationSource::new(config)
    }

    fn sink(name: &str) -> Arc<TeleportationSink> {
        sink_on(name, transport("bob"))
    }

    fn sink_on(name: &str, transport: Arc<dyn Transport>) -> Arc<TeleportationSink> {
        let config = SinkConfig::builder()
            .name(name)
            .source("127.0.0.1:40000".parse().unwrap())
            .sink("127.0.0.1:9000".parse().unwrap())
            .transport(transport)
            .build()
            .unwrap();
        TeleportationSink::new(config)
    }

    #[tokio::test]
    async fn test_reservation_blocks_duplicate_names() {
        let registry = TeleportationRegistry::new();

        let reservation = registry.reserve_source("ssh").unwrap();
        assert!(matches!(
            registry.reserve_source("ssh"),
            Err(MeepoError::TeleportationAlreadyExist(_))
        ));

        registry
            .add_source(reservation, source("ssh", "bob", "127.0.0.1:22"))
            .unwrap();
        assert!(registry.reserve_source("ssh").is_err());
    }

    #[tokio::test]
    async fn test_dropped_reservation_releases_name() {
        let registry = TeleportationRegistry::new();
        drop(registry.reserve_source("ssh").unwrap());
        assert!(registry.reserve_source("ssh").is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_sink_rejected() {
        let registry = TeleportationRegistry::new();
        registry.add_sink(sink("web")).unwrap();
        assert!(matches!(
            registry.add_sink(sink("web")),
            Err(MeepoError::TeleportationAlreadyExist(name)) if name == "web"
        ));
    }

    #[tokio::test]
    async fn test_remove_is_identity_checked() {
        let registry = TeleportationRegistry::new();
        let old = sink("web");
        registry.add_sink(old.clone()).unwrap();
        assert!(registry.remove_sink("web", &old));
        assert!(!registry.remove_sink("web", &old));

        let new = sink("web");
        registry.add_sink(new.clone()).unwrap();

        // A stale callback for the old half leaves the new one alone
        assert!(!registry.remove_sink("web", &old));
        assert!(Arc::ptr_eq(&registry.get_sink("web").unwrap(), &new));
    }

    #[tokio::test]
    async fn test_search_order() {
        let registry = TeleportationRegistry::new();
        let reservation = registry.reserve_source("both").unwrap();
        registry
            .add_source(reservation, source("both", "bob", "127.0.0.1:22"))
            .unwrap();
        registry.add_sink(sink("both")).unwrap();
        registry.add_sink(sink("only-sink")).unwrap();

        let found = registry
            .get_teleportation("both", SearchOrder::SourceFirst)
            .unwrap();
        assert_eq!(found.sink().to_string(), "127.0.0.1:22");

        let found = registry
            .get_teleportation("both", SearchOrder::SinkFirst)
            .unwrap();
        assert_eq!(found.sink().to_string(), "127.0.0.1:9000");

        // Falls back to the other map
        assert!(registry
            .get_teleportation("only-sink", SearchOrder::SourceFirst)
            .is_ok());

        let err = registry
            .get_teleportation("missing", SearchOrder::SinkFirst)
            .unwrap_err();
        assert_eq!(err.to_string(), "teleportation not exist");
    }

    #[tokio::test]
    async fn test_list_by_peer_id() {
        let registry = TeleportationRegistry::new();
        for (name, peer) in [("a", "bob"), ("b", "carol"), ("c", "bob")] {
            let reservation = registry.reserve_source(name).unwrap();
            registry
                .add_source(reservation, source(name, peer, "127.0.0.1:22"))
                .unwrap();
        }
        registry.add_sink(sink("d")).unwrap();

        let mut names: Vec<String> = registry
            .list_by_peer_id("bob")
            .iter()
            .map(|ts| ts.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "c"]);

        let infos = registry.list();
        assert_eq!(infos.len(), 4);
        assert_eq!(infos.iter().filter(|i| i.role == Role::Sink).count(), 1);
    }

    #[tokio::test]
    async fn test_bound_to_matches_transport_identity() {
        let registry = TeleportationRegistry::new();
        let old = transport("bob");
        let new = transport("bob");
        registry.add_sink(sink_on("a", old.clone())).unwrap();
        registry.add_sink(sink_on("b", new.clone())).unwrap();

        let bound: Vec<String> = registry
            .bound_to(&old)
            .iter()
            .map(|ts| ts.name().to_string())
            .collect();
        assert_eq!(bound, vec!["a"]);
        assert_eq!(registry.bound_to(&new).len(), 1);
    }
}
