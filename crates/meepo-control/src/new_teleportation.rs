//! Creating teleportations and the per-stream handshake
//!
//! The initiator asks the peer to build a sink first; only after a successful
//! response does it build and register its source. Each accepted local
//! connection then runs a `doTeleport` round trip before any byte is relayed.

use crate::config::TeleportationOptions;
use crate::error::{MeepoError, MeepoResult};
use crate::listener::ListenerGuard;
use crate::meepo::MeepoInner;
use crate::registry::SourceReservation;
use crate::resolve::{
    check_addr_is_listenable, get_listenable_addr, resolve_teleportation_sink_addr,
    resolve_teleportation_source_addr,
};
use crate::rpc::check_response;
use futures::future::BoxFuture;
use meepo_proto::{
    Addr, CloseTeleportationRequest, DoTeleportRequest, DoTeleportResponse,
    NewTeleportationRequest, NewTeleportationResponse, METHOD_CLOSE_TELEPORTATION,
    METHOD_DO_TELEPORT, METHOD_NEW_TELEPORTATION,
};
use meepo_teleportation::{
    DoTeleportFn, OnCloseHandler, OnErrorHandler, SinkConfig, SourceConfig, Teleportation,
    TeleportationError, TeleportationSink, TeleportationSource,
};
use meepo_transport::{DataChannel, HandleId, Transport, TransportError, TransportState};
use std::sync::{Arc, OnceLock, Weak};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

/// Subscribe a one-shot handler that fails `ts` when the transport fails
///
/// Returns the handle so the half can detach it when it goes away first.
fn fail_on_transport_failure<T, F>(transport: &Arc<dyn Transport>, ts: &Arc<T>, fail: F) -> HandleId
where
    T: Send + Sync + 'static,
    F: Fn(&T, TeleportationError) + Send + Sync + 'static,
{
    let weak_ts = Arc::downgrade(ts);
    let weak_transport = Arc::downgrade(transport);
    transport.on_transport_state(
        TransportState::Failed,
        Arc::new(move |handle: HandleId| {
            if let Some(transport) = weak_transport.upgrade() {
                transport.unset_on_transport_state(TransportState::Failed, handle);
            }
            if let Some(ts) = weak_ts.upgrade() {
                fail(&ts, TransportError::NotConnected(TransportState::Failed).into());
            }
        }),
    )
}

/// Late-bound references a half's teardown handlers need
struct Teardown<T> {
    half: OnceLock<Weak<T>>,
    failed_handle: OnceLock<HandleId>,
}

impl<T> Default for Teardown<T> {
    fn default() -> Self {
        Self {
            half: OnceLock::new(),
            failed_handle: OnceLock::new(),
        }
    }
}

impl<T> Teardown<T> {
    fn half(&self) -> Option<Arc<T>> {
        self.half.get().and_then(Weak::upgrade)
    }

    fn detach(&self, transport: &Weak<dyn Transport>) {
        if let (Some(handle), Some(transport)) = (self.failed_handle.get(), transport.upgrade()) {
            transport.unset_on_transport_state(TransportState::Failed, *handle);
        }
    }
}

impl MeepoInner {
    pub(crate) async fn new_teleportation(
        self: &Arc<Self>,
        peer_id: &str,
        remote: Addr,
        opts: TeleportationOptions,
    ) -> MeepoResult<Arc<TeleportationSource>> {
        let (listener, local) = match opts.local {
            Some(local) => check_addr_is_listenable(local).await,
            None => get_listenable_addr(&self.config.listen_host).await,
        }
        .inspect_err(|e| error!(peer_id, "failed to check address: {}", e))?;

        let name = opts
            .name
            .unwrap_or_else(|| format!("{}:{}", remote.network(), remote));
        let span = tracing::info_span!(
            "teleportation",
            peer_id,
            name = %name,
            laddr = %local,
            raddr = %remote
        );

        let reservation = self.registry.reserve_source(&name)?;

        let request = NewTeleportationRequest {
            message: self.create_request(METHOD_NEW_TELEPORTATION),
            name: name.clone(),
            local_network: local.network().to_string(),
            local_address: local.to_string(),
            remote_network: remote.network().to_string(),
            remote_address: remote.to_string(),
        };
        let response = match self.do_request(peer_id, request.into()).instrument(span.clone()).await {
            Ok(response) => response,
            Err(MeepoError::Timeout) => {
                // The peer may still build the sink after we gave up
                error!(parent: &span, "new teleportation request timed out");
                self.spawn_compensating_close(peer_id, &name, span, Some(reservation));
                return Err(MeepoError::Timeout);
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = check_response(&response, METHOD_NEW_TELEPORTATION) {
            error!(parent: &span, "failed to new teleportation by peer: {}", e);
            return Err(e);
        }

        // The peer holds a sink from here on
        match self.build_source(peer_id, reservation, listener, local, remote, span.clone()) {
            Ok(ts) => {
                info!(parent: &span, "new teleportation source");
                Ok(ts)
            }
            Err(e) => {
                error!(parent: &span, "failed to new teleportation source: {}", e);
                self.spawn_compensating_close(peer_id, &name, span, None);
                Err(e)
            }
        }
    }

    fn build_source(
        self: &Arc<Self>,
        peer_id: &str,
        reservation: SourceReservation,
        listener: TcpListener,
        local: Addr,
        remote: Addr,
        span: Span,
    ) -> MeepoResult<Arc<TeleportationSource>> {
        let name = reservation.name().to_string();
        let transport = self.transports.get(peer_id)?;

        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let guard = Arc::new(ListenerGuard::spawn(listener, dial_tx, span.clone()));
        let teardown: Arc<Teardown<TeleportationSource>> = Arc::default();

        let deregister = {
            let inner = Arc::downgrade(self);
            let transport = Arc::downgrade(&transport);
            let teardown = teardown.clone();
            let guard = guard.clone();
            let name = name.clone();
            move || {
                guard.close();
                teardown.detach(&transport);
                if let (Some(inner), Some(ts)) = (inner.upgrade(), teardown.half()) {
                    inner.registry.remove_source(&name, &ts);
                }
            }
        };
        let deregister = Arc::new(deregister);
        let on_close: OnCloseHandler = {
            let deregister = deregister.clone();
            Arc::new(move || {
                deregister();
                trace!("remove teleportation source");
            })
        };
        let on_error: OnErrorHandler = Arc::new(move |err: TeleportationError| {
            deregister();
            trace!("remove teleportation source after error: {}", err);
        });

        let config = SourceConfig::builder()
            .span(span.clone())
            .name(name.clone())
            .source(local)
            .sink(remote)
            .transport(transport.clone())
            .dial_requests(dial_rx)
            .do_teleport(self.do_teleport_fn(peer_id, &name))
            .on_close(on_close)
            .on_error(on_error)
            .build()?;
        let ts = TeleportationSource::new(config);
        let _ = teardown.half.set(Arc::downgrade(&ts));

        let handle = fail_on_transport_failure(&transport, &ts, TeleportationSource::fail);
        let _ = teardown.failed_handle.set(handle);

        self.registry.add_source(reservation, ts.clone())?;
        trace!(parent: &span, "add teleportation source");

        // The transport may have failed before the handler was in place
        if transport.state().is_terminal() {
            ts.fail(TransportError::NotConnected(transport.state()).into());
            return Err(MeepoError::Disconnected);
        }
        Ok(ts)
    }

    fn do_teleport_fn(self: &Arc<Self>, peer_id: &str, name: &str) -> DoTeleportFn {
        let inner = Arc::downgrade(self);
        let peer_id = peer_id.to_string();
        let name = name.to_string();
        Arc::new(move |label: String| -> BoxFuture<'static, Result<(), TeleportationError>> {
            let inner = inner.clone();
            let peer_id = peer_id.clone();
            let name = name.clone();
            Box::pin(async move {
                let inner = inner.upgrade().ok_or(TeleportationError::Closed)?;
                inner
                    .do_teleport(&peer_id, &name, label)
                    .await
                    .map_err(|e| TeleportationError::DoTeleport(e.to_string()))
            })
        })
    }

    /// The `doTeleport` round trip for one stream
    pub(crate) async fn do_teleport(&self, peer_id: &str, name: &str, label: String) -> MeepoResult<()> {
        let request = DoTeleportRequest {
            message: self.create_request(METHOD_DO_TELEPORT),
            name: name.to_string(),
            label,
        };
        let response = self.do_request(peer_id, request.into()).await?;
        if let Err(e) = check_response(&response, METHOD_DO_TELEPORT) {
            error!(peer_id, name, "failed to do teleport by peer: {}", e);
            return Err(e);
        }
        trace!(peer_id, name, "do teleport");
        Ok(())
    }

    /// Best effort: drop the sink the peer just created for us
    ///
    /// `hold` keeps the name reserved until the peer answered, so a retry
    /// cannot have its fresh sink closed by this request.
    fn spawn_compensating_close(
        self: &Arc<Self>,
        peer_id: &str,
        name: &str,
        span: Span,
        hold: Option<SourceReservation>,
    ) {
        let inner = self.clone();
        let peer_id = peer_id.to_string();
        let request = CloseTeleportationRequest {
            message: self.create_request(METHOD_CLOSE_TELEPORTATION),
            name: name.to_string(),
        };
        tokio::spawn(
            async move {
                match inner.do_request(&peer_id, request.into()).await {
                    Ok(response) => {
                        if let Err(e) = check_response(&response, METHOD_CLOSE_TELEPORTATION) {
                            warn!("peer refused compensating close: {}", e);
                        }
                    }
                    Err(e) => warn!("failed to send compensating close: {}", e),
                }
                drop(hold);
            }
            .instrument(span),
        );
    }

    pub(crate) async fn on_new_teleportation(
        self: &Arc<Self>,
        dc: &dyn DataChannel,
        request: NewTeleportationRequest,
    ) {
        let span = tracing::debug_span!(
            "on_new_teleportation",
            peer_id = %request.message.peer_id,
            name = %request.name,
            laddr = %request.local_address,
            raddr = %request.remote_address
        );

        let reply = match self.accept_new_teleportation(&request).instrument(span.clone()).await {
            Ok(()) => {
                debug!(parent: &span, "new teleportation sink");
                self.invert_message(&request.message)
            }
            Err(e) => {
                debug!(parent: &span, "failed to new teleportation sink: {}", e);
                self.invert_message_with_error(&request.message, &e)
            }
        };
        self.reply(dc, NewTeleportationResponse::from(reply).into())
            .instrument(span)
            .await;
    }

    async fn accept_new_teleportation(self: &Arc<Self>, request: &NewTeleportationRequest) -> MeepoResult<()> {
        let transport = self.transports.get(&request.message.peer_id)?;
        let source =
            resolve_teleportation_source_addr(&request.local_network, &request.local_address).await?;
        let sink =
            resolve_teleportation_sink_addr(&request.remote_network, &request.remote_address).await?;

        if let Some(existing) = self.registry.get_sink(&request.name) {
            if !self.is_stale_sink(&existing, &request.message.peer_id) {
                return Err(MeepoError::TeleportationAlreadyExist(request.name.clone()));
            }
            debug!("replace stale teleportation sink");
            let _ = existing.close().await;
        }

        let teardown: Arc<Teardown<TeleportationSink>> = Arc::default();
        let deregister = {
            let inner = Arc::downgrade(self);
            let transport = Arc::downgrade(&transport);
            let teardown = teardown.clone();
            let name = request.name.clone();
            Arc::new(move || {
                teardown.detach(&transport);
                if let (Some(inner), Some(ts)) = (inner.upgrade(), teardown.half()) {
                    inner.registry.remove_sink(&name, &ts);
                }
            })
        };
        let on_close: OnCloseHandler = {
            let deregister = deregister.clone();
            Arc::new(move || {
                deregister();
                trace!("remove teleportation sink");
            })
        };
        let on_error: OnErrorHandler = Arc::new(move |err: TeleportationError| {
            deregister();
            trace!("remove teleportation sink after error: {}", err);
        });

        let config = SinkConfig::builder()
            .span(Span::current())
            .name(request.name.clone())
            .source(source)
            .sink(sink)
            .transport(transport.clone())
            .on_close(on_close)
            .on_error(on_error)
            .build()?;
        let ts = TeleportationSink::new(config);
        let _ = teardown.half.set(Arc::downgrade(&ts));

        let handle = fail_on_transport_failure(&transport, &ts, TeleportationSink::fail);
        let _ = teardown.failed_handle.set(handle);

        if let Err(e) = self.registry.add_sink(ts.clone()) {
            // Lost a race with a concurrent request for the same name
            let _ = ts.close().await;
            return Err(e);
        }
        trace!("add teleportation sink");

        if transport.state().is_terminal() {
            ts.fail(TransportError::NotConnected(transport.state()).into());
            return Err(MeepoError::Disconnected);
        }
        Ok(())
    }

    /// A sink the initiator can no longer be using
    ///
    /// Initiators reserve names locally, so a repeat request from the owning
    /// peer means its previous attempt is gone.
    fn is_stale_sink(&self, sink: &TeleportationSink, peer_id: &str) -> bool {
        let transport = sink.transport();
        transport.peer_id() == peer_id || !self.transports.is_current(&transport)
    }

    pub(crate) async fn on_do_teleport(&self, dc: &dyn DataChannel, request: DoTeleportRequest) {
        let label = request.label.as_str();
        let result = match self.registry.get_sink(&request.name) {
            Some(ts) => ts.on_do_teleport(label).await.map_err(MeepoError::from),
            None => Err(MeepoError::TeleportationNotExist),
        };

        let reply = match result {
            Ok(()) => {
                trace!(name = %request.name, label, "do teleport");
                self.invert_message(&request.message)
            }
            Err(e) => {
                error!(name = %request.name, label, "failed to do teleport: {}", e);
                self.invert_message_with_error(&request.message, &e)
            }
        };
        self.reply(dc, DoTeleportResponse::from(reply).into()).await;
    }
}
