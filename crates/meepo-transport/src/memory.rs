//! In-process transport
//!
//! Two [`MemoryTransport`]s form a connected pair: the control data channel is
//! a pair of unbounded queues and every tunneled stream is a
//! `tokio::io::duplex` pipe handed over by label. The state machine is driven
//! explicitly (`connect`, `fail`, `close`), which makes the pair useful for
//! exercising the control plane without a network stack.

use crate::state::{HandleId, StateBridge, StateCallback};
use crate::{
    BoxedStream, DataChannel, Transport, TransportConnector, TransportError, TransportListener,
    TransportResult, TransportState,
};
use async_trait::async_trait;
use bytes::Bytes;
use meepo_proto::CONTROL_CHANNEL_LABEL;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Buffer size of each in-memory stream pipe
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Control data channel backed by unbounded queues
pub struct MemoryDataChannel {
    label: String,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    bridge: Arc<StateBridge>,
}

impl fmt::Debug for MemoryDataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDataChannel")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> TransportResult<()> {
        if self.bridge.current().is_terminal() {
            return Err(TransportError::ChannelClosed);
        }
        self.tx.send(data).map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&self) -> TransportResult<Option<Bytes>> {
        let mut state = self.bridge.watch();
        let mut rx = self.rx.lock().await;
        loop {
            if state.borrow_and_update().is_terminal() {
                return Ok(None);
            }
            tokio::select! {
                msg = rx.recv() => return Ok(msg),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

enum Slot {
    Waiting(oneshot::Sender<DuplexStream>),
    Ready(DuplexStream),
    /// Nobody will take this label; a late stream is dropped on arrival
    Released,
}

/// Hands streams opened by the peer to whoever waits for their label
#[derive(Default)]
struct StreamRendezvous {
    slots: Mutex<HashMap<String, Slot>>,
}

impl StreamRendezvous {
    fn deliver(&self, label: &str, stream: DuplexStream) -> TransportResult<()> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.remove(label) {
            Some(Slot::Waiting(tx)) => tx.send(stream).map_err(|_| TransportError::ChannelClosed),
            Some(ready @ Slot::Ready(_)) => {
                slots.insert(label.to_string(), ready);
                Err(TransportError::StreamAlreadyExists(label.to_string()))
            }
            Some(Slot::Released) => Err(TransportError::StreamReleased(label.to_string())),
            None => {
                slots.insert(label.to_string(), Slot::Ready(stream));
                Ok(())
            }
        }
    }

    async fn take(&self, label: &str) -> TransportResult<DuplexStream> {
        let rx = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(Slot::Ready(stream)) = slots.remove(label) {
                return Ok(stream);
            }
            let (tx, rx) = oneshot::channel();
            slots.insert(label.to_string(), Slot::Waiting(tx));
            rx
        };
        let mut guard = AbandonedWait {
            rendezvous: self,
            label,
            armed: true,
        };
        let stream = rx.await.map_err(|_| TransportError::ChannelClosed)?;
        guard.armed = false;
        Ok(stream)
    }

    fn release(&self, label: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.remove(label) {
            // Dropping a parked stream closes the opener's end
            Some(Slot::Ready(_)) => {}
            _ => {
                slots.insert(label.to_string(), Slot::Released);
            }
        }
    }

    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Drops the waiting slot of a `take` cancelled before its stream arrived
struct AbandonedWait<'a> {
    rendezvous: &'a StreamRendezvous,
    label: &'a str,
    armed: bool,
}

impl Drop for AbandonedWait<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self
            .rendezvous
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(slots.get(self.label), Some(Slot::Waiting(_))) {
            slots.remove(self.label);
        }
    }
}

/// One side of an in-process transport pair
pub struct MemoryTransport {
    local_id: String,
    peer_id: String,
    bridge: Arc<StateBridge>,
    channel: Arc<MemoryDataChannel>,
    incoming: Arc<StreamRendezvous>,
    outgoing: Arc<StreamRendezvous>,
    remote: OnceLock<Weak<MemoryTransport>>,
}

impl MemoryTransport {
    /// Create a connected pair; both sides start `Connecting`
    ///
    /// The first transport belongs to `a` and points at `b`, the second the
    /// other way round.
    pub fn pair(a: &str, b: &str) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a_incoming = Arc::new(StreamRendezvous::default());
        let b_incoming = Arc::new(StreamRendezvous::default());

        let ta = Self::side(a, b, a_tx, a_rx, &a_incoming, &b_incoming);
        let tb = Self::side(b, a, b_tx, b_rx, &b_incoming, &a_incoming);
        let _ = ta.remote.set(Arc::downgrade(&tb));
        let _ = tb.remote.set(Arc::downgrade(&ta));

        (ta, tb)
    }

    fn side(
        local: &str,
        peer: &str,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        incoming: &Arc<StreamRendezvous>,
        outgoing: &Arc<StreamRendezvous>,
    ) -> Arc<Self> {
        let bridge = Arc::new(StateBridge::new(TransportState::Connecting));
        Arc::new(Self {
            local_id: local.to_string(),
            peer_id: peer.to_string(),
            channel: Arc::new(MemoryDataChannel {
                label: CONTROL_CHANNEL_LABEL.to_string(),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                bridge: bridge.clone(),
            }),
            bridge,
            incoming: incoming.clone(),
            outgoing: outgoing.clone(),
            remote: OnceLock::new(),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Mark both sides connected
    pub fn connect(&self) {
        self.set_state(TransportState::Connected);
        if let Some(remote) = self.remote() {
            remote.set_state(TransportState::Connected);
        }
    }

    /// Fail this side only, as when the local agent detects a broken path
    pub fn fail(&self) {
        self.set_state(TransportState::Failed);
    }

    /// Drive this side's state machine directly
    pub fn set_state(&self, state: TransportState) -> bool {
        let changed = self.bridge.transition(state);
        if changed {
            debug!(local = %self.local_id, peer = %self.peer_id, %state, "memory transport state");
            if state.is_terminal() {
                self.incoming.clear();
            }
        }
        changed
    }

    fn remote(&self) -> Option<Arc<MemoryTransport>> {
        self.remote.get().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("local_id", &self.local_id)
            .field("peer_id", &self.peer_id)
            .field("state", &self.bridge.current())
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn state(&self) -> TransportState {
        self.bridge.current()
    }

    fn on_transport_state(&self, state: TransportState, callback: StateCallback) -> HandleId {
        self.bridge.subscribe(state, callback)
    }

    fn unset_on_transport_state(&self, state: TransportState, handle: HandleId) {
        self.bridge.unsubscribe(state, handle);
    }

    fn data_channel(&self, label: &str) -> Option<Arc<dyn DataChannel>> {
        if label == self.channel.label {
            Some(self.channel.clone())
        } else {
            None
        }
    }

    async fn open_stream(&self, label: &str) -> TransportResult<BoxedStream> {
        let state = self.state();
        if state != TransportState::Connected {
            return Err(TransportError::NotConnected(state));
        }
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        self.outgoing.deliver(label, remote)?;
        Ok(Box::new(local))
    }

    async fn accept_stream(&self, label: &str) -> TransportResult<BoxedStream> {
        let state = self.state();
        if state.is_terminal() {
            return Err(TransportError::NotConnected(state));
        }
        let stream = self.incoming.take(label).await?;
        Ok(Box::new(stream))
    }

    fn release_stream(&self, label: &str) {
        if !self.state().is_terminal() {
            self.incoming.release(label);
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.set_state(TransportState::Closed);
        if let Some(remote) = self.remote() {
            remote.set_state(TransportState::Closed);
        }
        Ok(())
    }
}

/// How a [`MemoryConnector`] finishes the handshake of new transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Move both sides to `Connected` after the delay
    Succeed(Duration),
    /// Move the initiating side to `Failed`
    Fail,
}

impl Default for Handshake {
    fn default() -> Self {
        Handshake::Succeed(Duration::ZERO)
    }
}

/// Process-local rendezvous for memory transports
#[derive(Debug, Default)]
pub struct MemoryHub {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<Arc<dyn Transport>>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept transports addressed to `peer_id`
    ///
    /// Registering the same id again replaces the previous listener.
    pub fn listen(&self, peer_id: &str) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer_id.to_string(), tx);
        MemoryListener {
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Connector dialing from `local_id`
    pub fn connector(self: &Arc<Self>, local_id: &str) -> MemoryConnector {
        MemoryConnector {
            local_id: local_id.to_string(),
            hub: self.clone(),
            handshake: Handshake::default(),
        }
    }

    fn deliver(&self, peer_id: &str, transport: Arc<dyn Transport>) -> TransportResult<()> {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = listeners
            .get(peer_id)
            .ok_or_else(|| TransportError::PeerNotFound(peer_id.to_string()))?;
        tx.send(transport)
            .map_err(|_| TransportError::PeerNotFound(peer_id.to_string()))
    }
}

#[derive(Debug)]
pub struct MemoryListener {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn Transport>>>,
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn accept(&self) -> TransportResult<Option<Arc<dyn Transport>>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    local_id: String,
    hub: Arc<MemoryHub>,
    handshake: Handshake,
}

impl MemoryConnector {
    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, peer_id: &str) -> TransportResult<Arc<dyn Transport>> {
        let (local, remote) = MemoryTransport::pair(&self.local_id, peer_id);
        self.hub.deliver(peer_id, remote)?;

        let handshake = self.handshake;
        let weak = Arc::downgrade(&local);
        tokio::spawn(async move {
            match handshake {
                Handshake::Succeed(delay) => {
                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                    if let Some(transport) = weak.upgrade() {
                        transport.connect();
                    }
                }
                Handshake::Fail => {
                    if let Some(transport) = weak.upgrade() {
                        warn!(peer = %transport.peer_id, "memory handshake failed");
                        transport.fail();
                    }
                }
            }
        });

        Ok(local)
    }
}
