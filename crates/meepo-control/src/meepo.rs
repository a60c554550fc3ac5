//! The meepo node

use crate::config::{MeepoConfig, TeleportationOptions};
use crate::error::{MeepoError, MeepoResult};
use crate::pending_requests::PendingRequests;
use crate::registry::{SearchOrder, TeleportationInfo, TeleportationRegistry};
use crate::transports::TransportManager;
use futures::future::join_all;
use meepo_proto::{Addr, DecoderRegistry, MessageCodec};
use meepo_teleportation::{Teleportation, TeleportationSource};
use meepo_transport::{HandleId, Transport, TransportConnector, TransportListener, TransportState};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// A node of the teleportation network
///
/// Cheap to clone; every clone drives the same node.
#[derive(Clone)]
pub struct Meepo {
    inner: Arc<MeepoInner>,
}

pub(crate) struct MeepoInner {
    pub(crate) config: MeepoConfig,
    pub(crate) connector: Arc<dyn TransportConnector>,
    pub(crate) transports: TransportManager,
    pub(crate) registry: TeleportationRegistry,
    pub(crate) pending: PendingRequests,
    pub(crate) codec: MessageCodec,
    pub(crate) shutdown: CancellationToken,
}

impl Meepo {
    pub fn new(config: MeepoConfig, connector: Arc<dyn TransportConnector>) -> Self {
        Self::with_decoders(config, connector, DecoderRegistry::with_defaults())
    }

    /// Build a node whose control channel understands extra methods
    pub fn with_decoders(
        config: MeepoConfig,
        connector: Arc<dyn TransportConnector>,
        decoders: DecoderRegistry,
    ) -> Self {
        info!(id = %config.id, "meepo node created");
        Self {
            inner: Arc::new(MeepoInner {
                config,
                connector,
                transports: TransportManager::new(),
                registry: TeleportationRegistry::new(),
                pending: PendingRequests::new(),
                codec: MessageCodec::new(Arc::new(decoders)),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Peer id of this node
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn config(&self) -> &MeepoConfig {
        &self.inner.config
    }

    /// Attach a transport: route its control channel and track its lifecycle
    pub fn add_transport(&self, transport: Arc<dyn Transport>) -> MeepoResult<()> {
        self.inner.add_transport(transport)
    }

    pub fn get_transport(&self, peer_id: &str) -> MeepoResult<Arc<dyn Transport>> {
        self.inner.transports.get(peer_id)
    }

    pub fn list_transports(&self) -> Vec<Arc<dyn Transport>> {
        self.inner.transports.list()
    }

    /// Connect to `peer_id` and wait for the transport to settle
    pub async fn new_transport(&self, peer_id: &str) -> MeepoResult<Arc<dyn Transport>> {
        self.inner.new_transport(peer_id).await
    }

    /// Accept transports initiated by peers until the listener ends or the
    /// node closes
    pub fn serve<L>(&self, listener: L) -> JoinHandle<()>
    where
        L: TransportListener + 'static,
    {
        let inner = self.inner.clone();
        let span = tracing::info_span!("serve", id = %inner.config.id);
        tokio::spawn(
            async move {
                loop {
                    let accepted = tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };
                    match accepted {
                        Ok(Some(transport)) => {
                            let peer_id = transport.peer_id().to_string();
                            if let Err(e) = inner.add_transport(transport) {
                                warn!(peer_id = %peer_id, "failed to attach transport: {}", e);
                            }
                        }
                        Ok(None) => {
                            debug!("transport listener ended");
                            break;
                        }
                        Err(e) => {
                            error!("failed to accept transport: {}", e);
                            break;
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Create a teleportation to `remote` through `peer_id`
    pub async fn new_teleportation(
        &self,
        peer_id: &str,
        remote: Addr,
        opts: TeleportationOptions,
    ) -> MeepoResult<Arc<TeleportationSource>> {
        self.inner.new_teleportation(peer_id, remote, opts).await
    }

    /// Close a teleportation on both peers
    ///
    /// Returns once the peer acknowledged; the local half closes in the
    /// background.
    pub async fn close_teleportation(&self, name: &str) -> MeepoResult<()> {
        self.inner.close_teleportation(name).await
    }

    pub fn get_teleportation(
        &self,
        name: &str,
        order: SearchOrder,
    ) -> MeepoResult<Arc<dyn Teleportation>> {
        self.inner.registry.get_teleportation(name, order)
    }

    pub fn list_teleportations(&self) -> Vec<TeleportationInfo> {
        self.inner.registry.list()
    }

    /// Expose `remote` (as seen from `peer_id`) on a local address
    ///
    /// Reuses an existing teleportation to the same remote.
    pub async fn teleport(
        &self,
        peer_id: &str,
        remote: Addr,
        opts: TeleportationOptions,
    ) -> MeepoResult<Addr> {
        self.inner.teleport(peer_id, remote, opts).await
    }

    /// Close every teleportation and transport
    pub async fn close(&self) {
        self.inner.close().await
    }
}

impl fmt::Debug for Meepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meepo")
            .field("id", &self.inner.config.id)
            .field("transports", &self.inner.transports.count())
            .field("pending_requests", &self.inner.pending.count())
            .finish()
    }
}

impl MeepoInner {
    pub(crate) fn add_transport(self: &Arc<Self>, transport: Arc<dyn Transport>) -> MeepoResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(MeepoError::TransportNotConnected(format!(
                "{}: node closed",
                transport.peer_id()
            )));
        }

        for state in [TransportState::Failed, TransportState::Closed] {
            let weak_inner = Arc::downgrade(self);
            let weak_transport = Arc::downgrade(&transport);
            transport.on_transport_state(
                state,
                Arc::new(move |handle: HandleId| {
                    let Some(transport) = weak_transport.upgrade() else {
                        return;
                    };
                    transport.unset_on_transport_state(state, handle);
                    let Some(inner) = weak_inner.upgrade() else {
                        return;
                    };
                    inner.transports.remove(&transport);
                    // Halves only tear themselves down on failure
                    if state == TransportState::Closed {
                        inner.close_bound_to(&transport);
                    }
                }),
            );
        }

        // Registered first so handlers of the first requests can find it
        self.transports.add(transport.clone());
        if let Err(e) = self.spawn_dispatch(transport.clone()) {
            self.transports.remove(&transport);
            return Err(e);
        }
        // Settled before the observers were in place
        if transport.state().is_terminal() {
            self.transports.remove(&transport);
        }
        Ok(())
    }

    pub(crate) async fn new_transport(self: &Arc<Self>, peer_id: &str) -> MeepoResult<Arc<dyn Transport>> {
        debug!(peer_id, "connecting transport");
        let transport = self.connector.connect(peer_id).await?;
        self.add_transport(transport.clone())?;
        crate::teleport::wait_settled(&transport, self.config.connect_timeout).await?;
        info!(peer_id, "transport connected");
        Ok(transport)
    }

    /// Close, in the background, every half carried by `transport`
    fn close_bound_to(&self, transport: &Arc<dyn Transport>) {
        let halves = self.registry.bound_to(transport);
        if halves.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(peer_id = %transport.peer_id(), "no runtime to close teleportations on");
            return;
        };
        debug!(
            peer_id = %transport.peer_id(),
            teleportations = halves.len(),
            "transport closed, closing its teleportations"
        );
        runtime.spawn(async move {
            for ts in halves {
                if let Err(e) = ts.close().await {
                    warn!(name = %ts.name(), "failed to close teleportation: {}", e);
                }
            }
        });
    }

    pub(crate) async fn close(&self) {
        self.shutdown.cancel();

        let halves = self.registry.all();
        debug!(teleportations = halves.len(), "closing teleportations");
        for ts in halves {
            if let Err(e) = ts.close().await {
                warn!(name = %ts.name(), "failed to close teleportation: {}", e);
            }
        }

        let transports = self.transports.list();
        let results = join_all(transports.iter().map(|t| t.close())).await;
        for (transport, result) in transports.iter().zip(results) {
            if let Err(e) = result {
                warn!(peer_id = %transport.peer_id(), "failed to close transport: {}", e);
            }
        }
        info!(id = %self.config.id, "meepo node closed");
    }
}
