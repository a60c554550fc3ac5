//! Construction parameters for teleportation halves

use crate::{
    DialRequest, DoTeleportFn, OnCloseHandler, OnErrorHandler, TeleportationError,
    DEFAULT_DIAL_TIMEOUT, DEFAULT_STREAM_TIMEOUT,
};
use meepo_proto::Addr;
use meepo_transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Span;

/// Everything a [`crate::TeleportationSource`] needs
pub struct SourceConfig {
    pub span: Span,
    pub name: String,
    pub source: Addr,
    pub sink: Addr,
    pub transport: Arc<dyn Transport>,
    pub on_close: Option<OnCloseHandler>,
    pub on_error: Option<OnErrorHandler>,
    pub dial_requests: mpsc::UnboundedReceiver<DialRequest>,
    pub do_teleport: DoTeleportFn,
}

impl SourceConfig {
    pub fn builder() -> SourceConfigBuilder {
        SourceConfigBuilder::default()
    }
}

/// Builder for SourceConfig
#[derive(Default)]
pub struct SourceConfigBuilder {
    span: Option<Span>,
    name: Option<String>,
    source: Option<Addr>,
    sink: Option<Addr>,
    transport: Option<Arc<dyn Transport>>,
    on_close: Option<OnCloseHandler>,
    on_error: Option<OnErrorHandler>,
    dial_requests: Option<mpsc::UnboundedReceiver<DialRequest>>,
    do_teleport: Option<DoTeleportFn>,
}

impl SourceConfigBuilder {
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn source(mut self, addr: Addr) -> Self {
        self.source = Some(addr);
        self
    }

    pub fn sink(mut self, addr: Addr) -> Self {
        self.sink = Some(addr);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn on_close(mut self, handler: OnCloseHandler) -> Self {
        self.on_close = Some(handler);
        self
    }

    pub fn on_error(mut self, handler: OnErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    pub fn dial_requests(mut self, rx: mpsc::UnboundedReceiver<DialRequest>) -> Self {
        self.dial_requests = Some(rx);
        self
    }

    pub fn do_teleport(mut self, f: DoTeleportFn) -> Self {
        self.do_teleport = Some(f);
        self
    }

    pub fn build(self) -> Result<SourceConfig, TeleportationError> {
        let name = self.name.ok_or(TeleportationError::MissingOption("name"))?;
        Ok(SourceConfig {
            span: self.span.unwrap_or_else(Span::current),
            name,
            source: self.source.ok_or(TeleportationError::MissingOption("source"))?,
            sink: self.sink.ok_or(TeleportationError::MissingOption("sink"))?,
            transport: self
                .transport
                .ok_or(TeleportationError::MissingOption("transport"))?,
            on_close: self.on_close,
            on_error: self.on_error,
            dial_requests: self
                .dial_requests
                .ok_or(TeleportationError::MissingOption("dial_requests"))?,
            do_teleport: self
                .do_teleport
                .ok_or(TeleportationError::MissingOption("do_teleport"))?,
        })
    }
}

/// Everything a [`crate::TeleportationSink`] needs
pub struct SinkConfig {
    pub span: Span,
    pub name: String,
    pub source: Addr,
    pub sink: Addr,
    pub transport: Arc<dyn Transport>,
    pub on_close: Option<OnCloseHandler>,
    pub on_error: Option<OnErrorHandler>,
    /// Budget for dialing the sink address
    pub dial_timeout: Duration,
    /// Budget for the source to open a label's stream
    pub stream_timeout: Duration,
}

impl SinkConfig {
    pub fn builder() -> SinkConfigBuilder {
        SinkConfigBuilder::default()
    }
}

/// Builder for SinkConfig
#[derive(Default)]
pub struct SinkConfigBuilder {
    span: Option<Span>,
    name: Option<String>,
    source: Option<Addr>,
    sink: Option<Addr>,
    transport: Option<Arc<dyn Transport>>,
    on_close: Option<OnCloseHandler>,
    on_error: Option<OnErrorHandler>,
    dial_timeout: Option<Duration>,
    stream_timeout: Option<Duration>,
}

impl SinkConfigBuilder {
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn source(mut self, addr: Addr) -> Self {
        self.source = Some(addr);
        self
    }

    pub fn sink(mut self, addr: Addr) -> Self {
        self.sink = Some(addr);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn on_close(mut self, handler: OnCloseHandler) -> Self {
        self.on_close = Some(handler);
        self
    }

    pub fn on_error(mut self, handler: OnErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<SinkConfig, TeleportationError> {
        let name = self.name.ok_or(TeleportationError::MissingOption("name"))?;
        Ok(SinkConfig {
            span: self.span.unwrap_or_else(Span::current),
            name,
            source: self.source.ok_or(TeleportationError::MissingOption("source"))?,
            sink: self.sink.ok_or(TeleportationError::MissingOption("sink"))?,
            transport: self
                .transport
                .ok_or(TeleportationError::MissingOption("transport"))?,
            on_close: self.on_close,
            on_error: self.on_error,
            dial_timeout: self.dial_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT),
            stream_timeout: self.stream_timeout.unwrap_or(DEFAULT_STREAM_TIMEOUT),
        })
    }
}
