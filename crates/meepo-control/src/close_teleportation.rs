//! Tearing a teleportation down on both peers
//!
//! Both sides acknowledge first and release their half in the background,
//! so a successful call only means the peer agreed to close.

use crate::error::{MeepoError, MeepoResult};
use crate::meepo::MeepoInner;
use crate::registry::SearchOrder;
use crate::rpc::check_response;
use meepo_proto::{CloseTeleportationRequest, CloseTeleportationResponse, METHOD_CLOSE_TELEPORTATION};
use meepo_teleportation::Teleportation;
use meepo_transport::DataChannel;
use std::sync::Arc;
use tracing::{debug, error, info, Instrument};

/// Close `ts` on a detached task; failures are only logged
fn spawn_close(ts: Arc<dyn Teleportation>) {
    let span = tracing::debug_span!("close", name = %ts.name());
    tokio::spawn(
        async move {
            match ts.close().await {
                Ok(()) => info!("teleportation closed"),
                Err(e) => error!("failed to close teleportation: {}", e),
            }
        }
        .instrument(span),
    );
}

impl MeepoInner {
    pub(crate) async fn close_teleportation(&self, name: &str) -> MeepoResult<()> {
        let ts = self.registry.get_teleportation(name, SearchOrder::SourceFirst)?;
        let transport = ts.transport();
        let peer_id = transport.peer_id();

        let request = CloseTeleportationRequest {
            message: self.create_request(METHOD_CLOSE_TELEPORTATION),
            name: name.to_string(),
        };
        let response = self.do_request(peer_id, request.into()).await?;
        if let Err(e) = check_response(&response, METHOD_CLOSE_TELEPORTATION) {
            error!(peer_id, name, "failed to close teleportation by peer: {}", e);
            return Err(e);
        }

        spawn_close(ts);
        debug!(peer_id, name, "close teleportation");
        Ok(())
    }

    pub(crate) async fn on_close_teleportation(
        &self,
        dc: &dyn DataChannel,
        request: CloseTeleportationRequest,
    ) {
        // Only the peer on the other end of a half may close it
        let found = self
            .registry
            .get_teleportation(&request.name, SearchOrder::SinkFirst)
            .and_then(|ts| {
                if ts.transport().peer_id() == request.message.peer_id {
                    Ok(ts)
                } else {
                    Err(MeepoError::TeleportationNotExist)
                }
            });
        let reply = match found {
            Ok(ts) => {
                spawn_close(ts);
                debug!(name = %request.name, "on close teleportation");
                self.invert_message(&request.message)
            }
            Err(e) => {
                error!(name = %request.name, "failed to get teleportation: {}", e);
                self.invert_message_with_error(&request.message, &e)
            }
        };
        self.reply(dc, CloseTeleportationResponse::from(reply).into())
            .await;
    }
}
