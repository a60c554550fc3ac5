//! Initiator half of a teleportation

use crate::lifecycle::{CloseGate, Phase};
use crate::task_tracker::StreamTracker;
use crate::{
    DialRequest, DoTeleportFn, OnCloseHandler, OnErrorHandler, SourceConfig, Teleportation,
    TeleportationError,
};
use async_trait::async_trait;
use meepo_proto::Addr;
use meepo_transport::Transport;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};
use uuid::Uuid;

/// Relays accepted local connections to the peer
///
/// Every dial request gets a fresh label. The do-teleport round trip for that
/// label must succeed before the transport stream is opened, so the peer's
/// sink is always waiting when bytes start to flow.
pub struct TeleportationSource {
    name: String,
    source: Addr,
    sink: Addr,
    transport: Arc<dyn Transport>,
    span: Span,
    gate: CloseGate,
    shutdown: CancellationToken,
    streams: Arc<StreamTracker>,
    do_teleport: DoTeleportFn,
    on_close: Option<OnCloseHandler>,
    on_error: Option<OnErrorHandler>,
}

impl TeleportationSource {
    /// Build the half and start consuming its dial requests
    pub fn new(config: SourceConfig) -> Arc<Self> {
        let SourceConfig {
            span,
            name,
            source,
            sink,
            transport,
            on_close,
            on_error,
            dial_requests,
            do_teleport,
        } = config;

        let ts = Arc::new(Self {
            name,
            source,
            sink,
            transport,
            span,
            gate: CloseGate::new(),
            shutdown: CancellationToken::new(),
            streams: StreamTracker::new(),
            do_teleport,
            on_close,
            on_error,
        });

        let span = ts.span.clone();
        tokio::spawn(ts.clone().serve(dial_requests).instrument(span));
        ts.gate.activate();

        info!(parent: &ts.span, name = %ts.name, laddr = %ts.source, raddr = %ts.sink, "teleportation source started");
        ts
    }

    async fn serve(self: Arc<Self>, mut dial_requests: mpsc::UnboundedReceiver<DialRequest>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = dial_requests.recv() => match request {
                    Some(request) => self.spawn_stream(request),
                    None => {
                        debug!(name = %self.name, "dial requests ended");
                        let _ = self.close().await;
                        break;
                    }
                },
            }
        }
    }

    fn spawn_stream(self: &Arc<Self>, request: DialRequest) {
        let label = Uuid::new_v4().to_string();
        let span = tracing::debug_span!(parent: &self.span, "stream", %label, peer = %request.peer_addr());
        let this = self.clone();
        let key = label.clone();

        let spawned = self.streams.spawn(
            key,
            async move {
                match this.teleport_stream(&label, request).await {
                    Ok(()) => debug!("stream finished"),
                    Err(err) if err.is_transport_lost() => {
                        warn!("transport lost: {}", err);
                        this.fail(err);
                    }
                    Err(err) => warn!("stream failed: {}", err),
                }
            }
            .instrument(span),
        );
        if !spawned {
            debug!(name = %self.name, "dropping dial request after close");
        }
    }

    async fn teleport_stream(
        &self,
        label: &str,
        request: DialRequest,
    ) -> Result<(), TeleportationError> {
        let (mut conn, _) = request.into_parts();

        // The connection is dropped unrelayed if the peer refuses the label
        (self.do_teleport)(label.to_string()).await?;

        let mut stream = self.transport.open_stream(label).await?;
        debug!("relaying");
        let (up, down) = tokio::io::copy_bidirectional(&mut conn, &mut stream).await?;
        debug!(up, down, "relay done");
        Ok(())
    }

    /// Tear down in response to an error; at most one teardown ever runs
    pub fn fail(&self, err: TeleportationError) {
        if !self.gate.begin_close() {
            return;
        }
        warn!(parent: &self.span, name = %self.name, "teleportation source failed: {}", err);
        self.teardown();
        if let Some(on_error) = &self.on_error {
            on_error(err);
        }
        self.gate.finish_close();
    }

    fn teardown(&self) {
        self.shutdown.cancel();
        self.streams.shutdown();
    }
}

#[async_trait]
impl Teleportation for TeleportationSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> Addr {
        self.source
    }

    fn sink(&self) -> Addr {
        self.sink
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    fn phase(&self) -> Phase {
        self.gate.phase()
    }

    fn active_streams(&self) -> usize {
        self.streams.len()
    }

    async fn close(&self) -> Result<(), TeleportationError> {
        if !self.gate.begin_close() {
            return Ok(());
        }
        self.teardown();
        if let Some(on_close) = &self.on_close {
            on_close();
        }
        self.gate.finish_close();
        info!(parent: &self.span, name = %self.name, "teleportation source closed");
        Ok(())
    }
}

impl fmt::Debug for TeleportationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeleportationSource")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("sink", &self.sink)
            .field("peer_id", &self.transport.peer_id())
            .field("phase", &self.gate.phase())
            .finish()
    }
}
