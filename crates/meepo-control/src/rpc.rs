//! Request/response correlation over the control data channel
//!
//! ```text
//!  caller              MeepoInner                 transport "sys" channel
//!    │  do_request(peer, req) │                              │
//!    │───────────────────────>│ pending.register(corr_id)    │
//!    │                        │─────────── frame ───────────>│──> peer
//!    │                        │                              │
//!    │                        │<──────── response frame ─────│<── peer
//!    │                        │ dispatch loop:               │
//!    │                        │   pending.respond(response)  │
//!    │<───────────────────────│                              │
//! ```
//!
//! A call ends with exactly one of: the response, a send error, `Timeout`,
//! or `Disconnected` when the transport fails or closes first.

use crate::error::{MeepoError, MeepoResult};
use crate::meepo::MeepoInner;
use crate::pending_requests::PendingRequests;
use bytes::BytesMut;
use meepo_proto::{CodecError, ControlMessage, Message, MessageCodec, CONTROL_CHANNEL_LABEL};
use meepo_transport::{DataChannel, HandleId, Transport, TransportError, TransportState};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn, Instrument};

/// Cleans up a pending call however it ends, including cancellation
struct PendingCall<'a> {
    pending: &'a PendingRequests,
    correlation_id: String,
    transport: Arc<dyn Transport>,
    observers: Vec<(TransportState, HandleId)>,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.cancel(&self.correlation_id);
        for (state, handle) in self.observers.drain(..) {
            self.transport.unset_on_transport_state(state, handle);
        }
    }
}

/// Fail with the peer's error text when the response carries one
pub(crate) fn check_response(response: &ControlMessage, method: &str) -> MeepoResult<()> {
    if response.method() != method || response.message().is_request() {
        return Err(MeepoError::UnexpectedResponse(method.to_string()));
    }
    match response.message().error() {
        Some(err) => Err(MeepoError::Peer(err.to_string())),
        None => Ok(()),
    }
}

impl MeepoInner {
    pub(crate) fn create_request(&self, method: &str) -> Message {
        Message::request(method, self.config.id.as_str())
    }

    pub(crate) fn invert_message(&self, request: &Message) -> Message {
        request.invert(self.config.id.as_str())
    }

    pub(crate) fn invert_message_with_error(&self, request: &Message, err: impl fmt::Display) -> Message {
        request.invert_with_error(self.config.id.as_str(), err)
    }

    /// Encode and write without waiting for anything back
    pub(crate) async fn send_message(
        &self,
        dc: &dyn DataChannel,
        message: ControlMessage,
    ) -> MeepoResult<()> {
        let frame = MessageCodec::encode(&message)?;
        trace!(method = message.method(), correlation_id = message.correlation_id(), "send message");
        dc.send(frame).await?;
        Ok(())
    }

    /// Send a reply from a request handler; failures are only logged
    pub(crate) async fn reply(&self, dc: &dyn DataChannel, message: ControlMessage) {
        if let Err(e) = self.send_message(dc, message).await {
            warn!("failed to send response: {}", e);
        }
    }

    /// Send `request` to `peer_id` and wait for its response
    pub(crate) async fn do_request(
        &self,
        peer_id: &str,
        request: ControlMessage,
    ) -> MeepoResult<ControlMessage> {
        let transport = self.transports.get(peer_id)?;
        let dc = control_channel(transport.as_ref())?;
        let correlation_id = request.correlation_id().to_string();

        let lost = Arc::new(Notify::new());
        let mut call = PendingCall {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
            transport: transport.clone(),
            observers: Vec::with_capacity(2),
        };
        for state in [TransportState::Failed, TransportState::Closed] {
            let lost = lost.clone();
            let handle = transport.on_transport_state(state, Arc::new(move |_: HandleId| lost.notify_one()));
            call.observers.push((state, handle));
        }
        if transport.state().is_terminal() {
            return Err(MeepoError::Disconnected);
        }

        let response = self.pending.register(&correlation_id);
        debug!(peer_id, method = request.method(), %correlation_id, "do request");
        self.send_message(dc.as_ref(), request).await?;

        let outcome = tokio::select! {
            response = response => response.map_err(|_| MeepoError::Disconnected),
            _ = lost.notified() => Err(MeepoError::Disconnected),
            _ = tokio::time::sleep(self.config.request_timeout) => Err(MeepoError::Timeout),
        };
        drop(call);

        if let Err(e) = &outcome {
            warn!(peer_id, %correlation_id, "request failed: {}", e);
        }
        outcome
    }

    /// Start reading the control channel of `transport`
    pub(crate) fn spawn_dispatch(self: &Arc<Self>, transport: Arc<dyn Transport>) -> MeepoResult<()> {
        let dc = control_channel(transport.as_ref())?;
        let span = tracing::debug_span!("dispatch", peer_id = %transport.peer_id());
        tokio::spawn(dispatch_loop(Arc::downgrade(self), dc).instrument(span));
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, dc: &Arc<dyn DataChannel>, message: ControlMessage) {
        if !message.message().is_request() {
            self.pending.respond(message);
            return;
        }

        let inner = self.clone();
        let dc = dc.clone();
        let span = tracing::debug_span!(
            "request",
            method = message.method(),
            peer_id = %message.message().peer_id
        );
        tokio::spawn(
            async move {
                match message {
                    ControlMessage::NewTeleportationRequest(req) => {
                        inner.on_new_teleportation(dc.as_ref(), req).await
                    }
                    ControlMessage::DoTeleportRequest(req) => {
                        inner.on_do_teleport(dc.as_ref(), req).await
                    }
                    ControlMessage::CloseTeleportationRequest(req) => {
                        inner.on_close_teleportation(dc.as_ref(), req).await
                    }
                    other => warn!(method = other.method(), "no handler for request"),
                }
            }
            .instrument(span),
        );
    }
}

fn control_channel(transport: &dyn Transport) -> MeepoResult<Arc<dyn DataChannel>> {
    transport
        .data_channel(CONTROL_CHANNEL_LABEL)
        .ok_or_else(|| TransportError::DataChannelNotFound(CONTROL_CHANNEL_LABEL.to_string()).into())
}

async fn dispatch_loop(inner: Weak<MeepoInner>, dc: Arc<dyn DataChannel>) {
    let Some(shutdown) = inner.upgrade().map(|i| i.shutdown.clone()) else {
        return;
    };
    let mut buf = BytesMut::new();

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = dc.recv() => received,
        };
        match received {
            Ok(Some(data)) => buf.extend_from_slice(&data),
            Ok(None) => {
                debug!("control channel closed");
                break;
            }
            Err(e) => {
                warn!("failed to read control channel: {}", e);
                break;
            }
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        loop {
            match inner.codec.decode(&mut buf) {
                Ok(Some(message)) => inner.dispatch(&dc, message),
                Ok(None) => break,
                Err(CodecError::MessageTooLarge(size)) => {
                    // Framing is lost past this point
                    error!(size, "oversized control frame, stopping dispatch");
                    return;
                }
                Err(e) => warn!("dropping undecodable message: {}", e),
            }
        }
    }
    trace!("dispatch loop stopped");
}
