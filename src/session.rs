//! The session state machine and its event loop.
//!
//! One task owns all session state. Side work (the user's metadata fetch,
//! the transport pump, timers) runs in spawned tasks that communicate with
//! the loop exclusively by posting [`Event`]s tagged with the
//! connect-generation they were started under; stale events are dropped on
//! arrival. No state is mutated from inside an async continuation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::backoff::Backoff;
use crate::channel::{
    Chan0Callback, Channel, ChannelCallback, ChannelStatus, CleanupFn, CloseReason, DebugFn,
    FatalFn, Initiator, StatusCell,
};
use crate::config::SessionConfig;
use crate::error::{FatalError, MetadataError, SessionError};
use crate::frame::{Frame, CHAN0};
use crate::metadata::{AbortSignal, ConnectionMetadata, MetadataCache, MetadataRequest};
use crate::mux::{dispatch_open, run_cleanup, ChannelMux};
use crate::registry::{ChannelOptions, ChannelRegistry, ChannelRequest};
use crate::transport::SharedFactory;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No `open()` yet, or closed and reopenable.
    Inert,
    /// Waiting on the user's metadata fetch.
    FetchingMetadata,
    /// Transport dial in flight.
    Connecting,
    /// Live.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Torn down. `open()` starts a fresh session.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inert => write!(f, "inert"),
            Self::FetchingMetadata => write!(f, "fetching-metadata"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// User intent posted from the [`Client`](crate::Client) façade.
pub(crate) enum Command<C> {
    Open {
        config: SessionConfig<C>,
        chan0: Chan0Callback<C>,
    },
    OpenChannel {
        id: u64,
        options: ChannelOptions<C>,
        callback: ChannelCallback<C>,
        status: StatusCell,
    },
    CloseChannel {
        id: u64,
    },
    Close,
    /// Close and stop the event loop. Posted when the client is dropped.
    Shutdown,
    SetDebug(Option<DebugFn>),
    SetFatal(Option<FatalFn>),
}

/// Everything the event loop reacts to.
pub(crate) enum Event<C> {
    Command(Command<C>),
    MetadataResolved {
        generation: u64,
        result: Result<ConnectionMetadata, MetadataError>,
    },
    FetchRetry {
        generation: u64,
    },
    ConnectFailed {
        generation: u64,
        timed_out: bool,
        error: String,
    },
    TransportOpen {
        generation: u64,
    },
    TransportFrame {
        generation: u64,
        frame: Frame,
    },
    TransportClosed {
        generation: u64,
        error: Option<String>,
    },
    RetryTimer {
        generation: u64,
    },
    OpenTimeout {
        epoch: u64,
    },
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

/// Spawn the session event loop; returns the sender side of its queue.
pub(crate) fn spawn<C: Send + 'static>() -> mpsc::UnboundedSender<Event<C>> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = Session::new(events_tx.clone());
    tokio::spawn(session.run(events_rx));
    events_tx
}

struct Session<C> {
    state: SessionState,

    /// Tags every async outcome with the attempt it belongs to. Stale
    /// events fail the equality test and are dropped.
    generation: u64,

    /// Bumped per `open()`; guards the open-timeout timer across
    /// close-and-reopen.
    open_epoch: u64,

    events: mpsc::UnboundedSender<Event<C>>,
    config: Option<SessionConfig<C>>,

    chan0_callback: Option<Chan0Callback<C>>,
    chan0_cleanup: Option<CleanupFn>,
    chan0_inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    chan0_status: Option<StatusCell>,

    /// The one-shot `"Failed to open"` delivery happened this epoch.
    failed_open_delivered: bool,
    /// The session reached `Connected` at least once this epoch.
    reached_connected: bool,

    registry: ChannelRegistry<C>,
    mux: ChannelMux,

    /// Outbound queue of the live transport pump, present from
    /// `Connecting` until disconnect. Dropping it makes the pump close the
    /// socket and exit.
    outbound: Option<mpsc::UnboundedSender<Frame>>,

    fetch_abort: Option<AbortSignal>,
    backoff: Backoff,
    cache: MetadataCache,
    try_count: u32,
    using_cached: bool,
    fallback_engaged: bool,

    debug: Option<DebugFn>,
    fatal: Option<FatalFn>,
}

impl<C: Send + 'static> Session<C> {
    fn new(events: mpsc::UnboundedSender<Event<C>>) -> Self {
        Self {
            state: SessionState::Inert,
            generation: 0,
            open_epoch: 0,
            events,
            config: None,
            chan0_callback: None,
            chan0_cleanup: None,
            chan0_inbound: None,
            chan0_status: None,
            failed_open_delivered: false,
            reached_connected: false,
            registry: ChannelRegistry::default(),
            mux: ChannelMux::default(),
            outbound: None,
            fetch_abort: None,
            backoff: Backoff::new(Default::default()),
            cache: MetadataCache::default(),
            try_count: 0,
            using_cached: false,
            fallback_engaged: false,
            debug: None,
            fatal: None,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event<C>>) {
        while let Some(event) = events.recv().await {
            if self.handle(event) == Flow::Stop {
                break;
            }
        }
    }

    fn current(&self, generation: u64) -> bool {
        if generation == self.generation {
            true
        } else {
            trace!(
                generation,
                current = self.generation,
                "stale event dropped"
            );
            false
        }
    }

    fn handle(&mut self, event: Event<C>) -> Flow {
        match event {
            Event::Command(command) => return self.handle_command(command),
            Event::MetadataResolved { generation, result } => {
                if self.current(generation) && self.state == SessionState::FetchingMetadata {
                    self.on_metadata(result);
                }
            }
            Event::FetchRetry { generation } => {
                if self.current(generation) && self.state == SessionState::FetchingMetadata {
                    self.start_fetch();
                }
            }
            Event::ConnectFailed {
                generation,
                timed_out,
                error,
            } => {
                if self.current(generation) && self.state == SessionState::Connecting {
                    self.on_connect_failed(timed_out, error);
                }
            }
            Event::TransportOpen { generation } => {
                if self.current(generation) && self.state == SessionState::Connecting {
                    self.on_transport_open();
                }
            }
            Event::TransportFrame { generation, frame } => {
                if self.current(generation) && self.state == SessionState::Connected {
                    self.on_frame(frame);
                }
            }
            Event::TransportClosed { generation, error } => {
                if self.current(generation) {
                    self.on_transport_closed(error);
                }
            }
            Event::RetryTimer { generation } => {
                if self.current(generation) && self.state == SessionState::Reconnecting {
                    self.generation += 1;
                    self.breadcrumb("retrying");
                    self.start_fetch();
                }
            }
            Event::OpenTimeout { epoch } => self.on_open_timeout(epoch),
        }
        Flow::Continue
    }

    fn handle_command(&mut self, command: Command<C>) -> Flow {
        match command {
            Command::Open { config, chan0 } => self.on_open(config, chan0),
            Command::OpenChannel {
                id,
                options,
                callback,
                status,
            } => {
                let request = ChannelRequest::new(id, options, callback, status.clone());
                match self.registry.insert(request) {
                    Err(error) => {
                        status.set(ChannelStatus::Closed);
                        self.report_fatal(error);
                    }
                    Ok(()) => {
                        if self.state == SessionState::Connected {
                            if let (Some(config), Some(outbound)) =
                                (self.config.as_ref(), self.outbound.as_ref())
                            {
                                self.mux.open_one(
                                    &mut self.registry,
                                    id,
                                    &config.context,
                                    outbound,
                                );
                            }
                        }
                    }
                }
            }
            Command::CloseChannel { id } => {
                self.mux
                    .request_close(&mut self.registry, id, self.outbound.as_ref());
            }
            Command::Close => self.close_session(),
            Command::Shutdown => {
                self.close_session();
                return Flow::Stop;
            }
            Command::SetDebug(debug) => self.debug = debug,
            Command::SetFatal(fatal) => self.fatal = fatal,
        }
        Flow::Continue
    }

    fn on_open(&mut self, config: SessionConfig<C>, chan0: Chan0Callback<C>) {
        if !matches!(self.state, SessionState::Inert | SessionState::Closed) {
            self.report_fatal(FatalError::AlreadyOpen);
            return;
        }

        let timeout = config.open_timeout();
        self.backoff = Backoff::new(config.retry.clone());
        self.config = Some(config);
        self.chan0_callback = Some(chan0);
        self.chan0_cleanup = None;
        self.failed_open_delivered = false;
        self.reached_connected = false;
        self.try_count = 0;
        self.using_cached = false;
        self.fallback_engaged = false;
        self.cache = MetadataCache::default();

        self.generation += 1;
        self.open_epoch += 1;
        let epoch = self.open_epoch;
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::OpenTimeout { epoch });
        });

        self.start_fetch();
    }

    fn start_fetch(&mut self) {
        if let Some(metadata) = self.cache.take_reusable() {
            self.using_cached = true;
            self.start_connect(metadata);
            return;
        }
        self.using_cached = false;

        let Some(config) = self.config.as_ref() else {
            return;
        };
        let fetch = config.fetch_metadata.clone();

        self.state = SessionState::FetchingMetadata;
        self.try_count += 1;
        let signal = AbortSignal::new();
        self.fetch_abort = Some(signal.clone());

        let generation = self.generation;
        let try_count = self.try_count;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = fetch(MetadataRequest { signal, try_count }).await;
            let _ = events.send(Event::MetadataResolved { generation, result });
        });
    }

    fn on_metadata(&mut self, result: Result<ConnectionMetadata, MetadataError>) {
        match result {
            Ok(metadata) => {
                self.fetch_abort = None;
                self.cache.fill(metadata.clone());
                self.start_connect(metadata);
            }
            Err(MetadataError::Retriable(reason)) => {
                debug!(%reason, "metadata fetch failed, retrying");
                self.breadcrumb("retrying");
                let delay = self.backoff.next_delay();
                self.spawn_timer(delay, |generation| Event::FetchRetry { generation });
            }
            Err(MetadataError::Aborted) => {
                self.fetch_abort = None;
                self.close_session();
            }
            Err(MetadataError::Fatal(message)) => {
                self.fetch_abort = None;
                self.report_fatal(FatalError::Metadata(message));
                self.close_session();
            }
        }
    }

    fn start_connect(&mut self, metadata: ConnectionMetadata) {
        let (factory, connect_timeout) = {
            let Some(config) = self.config.as_ref() else {
                return;
            };
            let factory: SharedFactory = if self.fallback_engaged {
                config
                    .fallback_factory
                    .clone()
                    .unwrap_or_else(|| config.factory.clone())
            } else {
                config.factory.clone()
            };
            (factory, config.open_timeout())
        };

        self.state = SessionState::Connecting;
        self.breadcrumb("connecting");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);
        let generation = self.generation;
        let events = self.events.clone();
        tokio::spawn(run_transport(
            factory,
            metadata,
            connect_timeout,
            generation,
            events,
            outbound_rx,
        ));
    }

    fn on_transport_open(&mut self) {
        self.state = SessionState::Connected;
        self.reached_connected = true;
        self.using_cached = false;
        self.backoff.reset();

        let Some(outbound) = self.outbound.clone() else {
            return;
        };

        // Chan0 first: the session-level callback observes `Connected`
        // before any channel opens.
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let cell = StatusCell::new(ChannelStatus::Open);
        self.chan0_inbound = Some(inbound_tx);
        self.chan0_status = Some(cell.clone());
        let chan0 = Channel::new(CHAN0, cell, outbound.clone(), inbound_rx);
        if let (Some(callback), Some(config)) =
            (self.chan0_callback.as_mut(), self.config.as_ref())
        {
            self.chan0_cleanup = dispatch_open(callback, Ok(chan0), &config.context);
        }

        if let Some(config) = self.config.as_ref() {
            self.mux
                .open_pending(&mut self.registry, &config.context, &outbound);
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        let frame = match frame {
            Frame::Data {
                channel: CHAN0,
                payload,
            } => {
                if let Some(inbound) = &self.chan0_inbound {
                    let _ = inbound.send(payload);
                }
                return;
            }
            other => other,
        };
        let Some(outbound) = self.outbound.clone() else {
            return;
        };
        if let Some(config) = self.config.as_ref() {
            self.mux
                .handle_frame(&mut self.registry, &config.context, &outbound, frame);
        }
    }

    fn on_connect_failed(&mut self, timed_out: bool, error: String) {
        warn!(%error, timed_out, "transport failed to connect");
        if timed_out {
            self.engage_fallback();
        }
        if self.using_cached {
            self.cache.invalidate();
            self.using_cached = false;
        }
        self.enter_reconnecting();
    }

    fn on_transport_closed(&mut self, error: Option<String>) {
        match self.state {
            SessionState::Connected => {
                warn!(error = error.as_deref(), "transport lost, reconnecting");
                self.disconnect_cleanups();
                self.enter_reconnecting();
            }
            SessionState::Connecting => {
                if self.using_cached {
                    self.cache.invalidate();
                    self.using_cached = false;
                }
                self.enter_reconnecting();
            }
            _ => {}
        }
    }

    /// Cleanup pass for an unexpected disconnect: every channel cleanup
    /// first, chan0 cleanup last, all before the next attempt is scheduled.
    fn disconnect_cleanups(&mut self) {
        self.mux.on_disconnect(&mut self.registry);
        if let Some(cell) = self.chan0_status.take() {
            cell.set(ChannelStatus::Closed);
        }
        self.chan0_inbound = None;
        if let Some(cleanup) = self.chan0_cleanup.take() {
            run_cleanup(
                cleanup,
                CloseReason {
                    will_reconnect: true,
                    initiator: Initiator::Client,
                },
            );
        }
    }

    fn enter_reconnecting(&mut self) {
        self.outbound = None;
        self.state = SessionState::Reconnecting;
        self.breadcrumb("reconnecting");
        let delay = self.backoff.next_delay();
        self.spawn_timer(delay, |generation| Event::RetryTimer { generation });
    }

    fn on_open_timeout(&mut self, epoch: u64) {
        if epoch != self.open_epoch || self.reached_connected {
            return;
        }
        if matches!(
            self.state,
            SessionState::Inert | SessionState::Closed | SessionState::Connected
        ) {
            return;
        }
        self.deliver_failed_open();
        if self.state == SessionState::Connecting {
            // The transport never came up inside the open timeout; switch to
            // the fallback for every later attempt this session.
            self.engage_fallback();
            if self.using_cached {
                self.cache.invalidate();
                self.using_cached = false;
            }
            self.enter_reconnecting();
        }
    }

    fn engage_fallback(&mut self) {
        if self.fallback_engaged {
            return;
        }
        self.fallback_engaged = true;
        self.breadcrumb("polling fallback");
    }

    fn deliver_failed_open(&mut self) {
        if self.failed_open_delivered {
            return;
        }
        self.failed_open_delivered = true;
        if let (Some(callback), Some(config)) =
            (self.chan0_callback.as_mut(), self.config.as_ref())
        {
            // An error delivery is not an open; any cleanup returned here
            // has no incarnation to bracket and is dropped.
            dispatch_open(callback, Err(SessionError::FailedToOpen), &config.context);
        }
    }

    /// Teardown. Safe to run from any state, any number of times.
    fn close_session(&mut self) {
        if let Some(signal) = self.fetch_abort.take() {
            signal.abort();
        }

        self.mux
            .teardown(&mut self.registry, self.outbound.as_ref());

        if let Some(cell) = self.chan0_status.take() {
            cell.set(ChannelStatus::Closed);
        }
        self.chan0_inbound = None;
        if let Some(cleanup) = self.chan0_cleanup.take() {
            run_cleanup(
                cleanup,
                CloseReason {
                    will_reconnect: false,
                    initiator: Initiator::Client,
                },
            );
        }

        if !self.reached_connected {
            self.deliver_failed_open();
        }

        // Dropping the outbound queue makes the pump close the socket.
        self.outbound = None;
        self.state = SessionState::Closed;
    }

    fn report_fatal(&mut self, error: FatalError) {
        warn!(%error, "unrecoverable error");
        if let Some(handler) = self.fatal.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                tracing::error!("unrecoverable-error handler panicked");
            }
        }
    }

    fn breadcrumb(&mut self, label: &'static str) {
        debug!(state = %self.state, generation = self.generation, "{label}");
        if let Some(debug_fn) = self.debug.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| debug_fn(label))).is_err() {
                tracing::error!("debug sink panicked");
            }
        }
    }

    fn spawn_timer(&self, delay: Duration, make: impl FnOnce(u64) -> Event<C> + Send + 'static) {
        let event = make(self.generation);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }
}

/// Transport pump: dial, then shuttle frames until either side lets go.
///
/// Owns the transport for its whole life. The session communicates with it
/// only through the outbound queue and the posted events, so a pump of a
/// stale generation can die at its own pace without touching anything.
async fn run_transport<C: Send + 'static>(
    factory: SharedFactory,
    metadata: ConnectionMetadata,
    connect_timeout: Duration,
    generation: u64,
    events: mpsc::UnboundedSender<Event<C>>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    let connect = factory.connect(&metadata.url, &metadata.token);
    let mut transport = match tokio::time::timeout(connect_timeout, connect).await {
        Err(_) => {
            let _ = events.send(Event::ConnectFailed {
                generation,
                timed_out: true,
                error: "connect timed out".into(),
            });
            return;
        }
        Ok(Err(error)) => {
            let _ = events.send(Event::ConnectFailed {
                generation,
                timed_out: false,
                error: error.to_string(),
            });
            return;
        }
        Ok(Ok(transport)) => transport,
    };

    let _ = events.send(Event::TransportOpen { generation });

    loop {
        let mut to_send = None;
        let mut session_gone = false;

        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(frame) => to_send = Some(frame),
                None => session_gone = true,
            },
            received = transport.recv() => match received {
                Ok(Some(frame)) => {
                    let _ = events.send(Event::TransportFrame { generation, frame });
                }
                Ok(None) => {
                    let _ = events.send(Event::TransportClosed { generation, error: None });
                    return;
                }
                Err(error) => {
                    let _ = events.send(Event::TransportClosed {
                        generation,
                        error: Some(error.to_string()),
                    });
                    return;
                }
            },
        }

        if session_gone {
            transport.close().await;
            return;
        }

        if let Some(frame) = to_send {
            if let Err(error) = transport.send(frame).await {
                let _ = events.send(Event::TransportClosed {
                    generation,
                    error: Some(error.to_string()),
                });
                return;
            }
        }
    }
}
