//! Receiver half of a teleportation

use crate::lifecycle::{CloseGate, Phase};
use crate::task_tracker::StreamTracker;
use crate::{OnCloseHandler, OnErrorHandler, SinkConfig, Teleportation, TeleportationError};
use async_trait::async_trait;
use meepo_proto::Addr;
use meepo_transport::Transport;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn, Instrument, Span};

/// Dials the sink address once per label and relays the matching stream
pub struct TeleportationSink {
    name: String,
    source: Addr,
    sink: Addr,
    transport: Arc<dyn Transport>,
    span: Span,
    gate: CloseGate,
    streams: Arc<StreamTracker>,
    dial_timeout: Duration,
    stream_timeout: Duration,
    on_close: Option<OnCloseHandler>,
    on_error: Option<OnErrorHandler>,
}

impl TeleportationSink {
    pub fn new(config: SinkConfig) -> Arc<Self> {
        let ts = Arc::new(Self {
            name: config.name,
            source: config.source,
            sink: config.sink,
            transport: config.transport,
            span: config.span,
            gate: CloseGate::new(),
            streams: StreamTracker::new(),
            dial_timeout: config.dial_timeout,
            stream_timeout: config.stream_timeout,
            on_close: config.on_close,
            on_error: config.on_error,
        });
        ts.gate.activate();
        info!(parent: &ts.span, name = %ts.name, laddr = %ts.source, raddr = %ts.sink, "teleportation sink started");
        ts
    }

    /// Prepare the relay for `label`
    ///
    /// Returns once the sink address is dialed; the transport stream is then
    /// awaited in the background so the source can open it after this
    /// handshake completes.
    pub async fn on_do_teleport(self: &Arc<Self>, label: &str) -> Result<(), TeleportationError> {
        if self.gate.is_closing() {
            return Err(TeleportationError::Closed);
        }

        let span = tracing::debug_span!(parent: &self.span, "stream", %label);
        let conn = tokio::time::timeout(
            self.dial_timeout,
            TcpStream::connect(self.sink.socket_addr()),
        )
        .instrument(span.clone())
        .await
        .map_err(|_| TeleportationError::DialTimeout(self.sink))??;
        debug!(parent: &span, raddr = %self.sink, "sink dialed");

        let this = self.clone();
        let owned = label.to_string();
        let spawned = self.streams.spawn(
            label.to_string(),
            async move {
                match this.relay(&owned, conn).await {
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
            return Err(TeleportationError::Closed);
        }
        Ok(())
    }

    async fn relay(&self, label: &str, mut conn: TcpStream) -> Result<(), TeleportationError> {
        let accepted = tokio::time::timeout(self.stream_timeout, self.transport.accept_stream(label)).await;
        let Ok(accepted) = accepted else {
            self.transport.release_stream(label);
            return Err(TeleportationError::StreamTimeout(label.to_string()));
        };
        let mut stream = accepted?;
        debug!("relaying");
        let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut conn).await?;
        debug!(up, down, "relay done");
        Ok(())
    }

    /// Tear down in response to an error; at most one teardown ever runs
    pub fn fail(&self, err: TeleportationError) {
        if !self.gate.begin_close() {
            return;
        }
        warn!(parent: &self.span, name = %self.name, "teleportation sink failed: {}", err);
        self.streams.shutdown();
        if let Some(on_error) = &self.on_error {
            on_error(err);
        }
        self.gate.finish_close();
    }
}

#[async_trait]
impl Teleportation for TeleportationSink {
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
        self.streams.shutdown();
        if let Some(on_close) = &self.on_close {
            on_close();
        }
        self.gate.finish_close();
        info!(parent: &self.span, name = %self.name, "teleportation sink closed");
        Ok(())
    }
}

impl fmt::Debug for TeleportationSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeleportationSink")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("sink", &self.sink)
            .field("peer_id", &self.transport.peer_id())
            .field("phase", &self.gate.phase())
            .finish()
    }
}
