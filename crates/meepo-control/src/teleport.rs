//! The `teleport` front door

use crate::config::TeleportationOptions;
use crate::error::{MeepoError, MeepoResult};
use crate::meepo::MeepoInner;
use crate::transports::same_transport;
use meepo_proto::Addr;
use meepo_teleportation::Teleportation;
use meepo_transport::{HandleId, Transport, TransportState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const SETTLED_STATES: [TransportState; 3] = [
    TransportState::Connected,
    TransportState::Failed,
    TransportState::Closed,
];

/// Wait for the first of Connected, Failed or Closed
///
/// Only `Connected` is a success.
pub(crate) async fn wait_settled(transport: &Arc<dyn Transport>, timeout: Duration) -> MeepoResult<()> {
    let settled = Arc::new(Notify::new());
    let handles: Vec<(TransportState, HandleId)> = SETTLED_STATES
        .iter()
        .map(|&state| {
            let settled = settled.clone();
            let handle = transport.on_transport_state(state, Arc::new(move |_: HandleId| settled.notify_one()));
            (state, handle)
        })
        .collect();

    let outcome = match transport.state() {
        TransportState::Connecting => tokio::time::timeout(timeout, settled.notified())
            .await
            .map_err(|_| MeepoError::Timeout),
        _ => Ok(()),
    };
    for (state, handle) in handles {
        transport.unset_on_transport_state(state, handle);
    }
    outcome?;

    match transport.state() {
        TransportState::Connected => Ok(()),
        state => Err(MeepoError::TransportNotConnected(format!(
            "{}: {}",
            transport.peer_id(),
            state
        ))),
    }
}

impl MeepoInner {
    pub(crate) async fn teleport(
        self: &Arc<Self>,
        peer_id: &str,
        remote: Addr,
        opts: TeleportationOptions,
    ) -> MeepoResult<Addr> {
        let transport = match self.transports.get(peer_id) {
            Ok(transport) => transport,
            Err(MeepoError::TransportNotExist(_)) => self.new_transport(peer_id).await?,
            Err(e) => return Err(e),
        };

        let (live, stale): (Vec<_>, Vec<_>) = self
            .registry
            .list_by_peer_id(peer_id)
            .into_iter()
            .filter(|ts| {
                let sink = ts.sink();
                sink.network() == remote.network() && sink.to_string() == remote.to_string()
            })
            .partition(|ts| same_transport(&ts.transport(), &transport));
        if let Some(ts) = live.first() {
            debug!(peer_id, name = %ts.name(), raddr = %remote, "reuse teleportation");
            return Ok(ts.source());
        }
        // Left over from an earlier transport to this peer
        for ts in stale {
            debug!(peer_id, name = %ts.name(), "close stale teleportation");
            if let Err(e) = ts.close().await {
                warn!(peer_id, name = %ts.name(), "failed to close stale teleportation: {}", e);
            }
        }

        let ts = self.new_teleportation(peer_id, remote, opts).await?;
        info!(peer_id, name = %ts.name(), laddr = %ts.source(), raddr = %remote, "teleported");
        Ok(ts.source())
    }
}
