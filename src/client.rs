//! The client façade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::{
    Chan0Callback, ChannelCallback, ChannelCloser, ChannelStatus, CleanupFn, StatusCell,
};
use crate::config::SessionConfig;
use crate::error::{ChannelError, FatalError, SessionError};
use crate::channel::Channel;
use crate::registry::ChannelOptions;
use crate::session::{self, Command, Event};

/// Client for a durable multiplexed session.
///
/// All methods are non-blocking: they post intent to the session event loop
/// and return immediately. Results arrive through the callbacks.
///
/// Channels may be requested in any session state; requests made before
/// `open()` behave exactly like requests made right after the session
/// connects, and they survive reconnects until explicitly closed.
pub struct Client<C> {
    events: mpsc::UnboundedSender<Event<C>>,
    request_ids: Arc<AtomicU64>,
}

impl<C: Send + 'static> Client<C> {
    /// Create the client and spawn its session event loop. Must be called
    /// from within a tokio runtime.
    pub fn new() -> Self {
        Self {
            events: session::spawn(),
            // Start at 1 so a ref id can never read as chan0 in traces.
            request_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Bring the session up.
    ///
    /// `chan0` is invoked with `Ok(channel)` on every `Connected` (so again
    /// after each reconnect), or exactly once with
    /// `Err(SessionError::FailedToOpen)` if the session cannot be brought
    /// up. A returned cleanup runs when the session leaves `Connected`.
    pub fn open<F>(&self, config: SessionConfig<C>, chan0: F)
    where
        F: FnMut(Result<Channel, SessionError>, &C) -> Option<CleanupFn> + Send + 'static,
    {
        self.post(Command::Open {
            config,
            chan0: Box::new(chan0) as Chan0Callback<C>,
        });
    }

    /// Register a channel. Legal in any session state.
    ///
    /// The callback is invoked with `Ok(channel)` once per `Connected` in
    /// which the skip predicate passes, and with `Err` if the remote
    /// rejects the open. A returned cleanup runs when that incarnation
    /// ends. The returned closer removes the request; after it is used the
    /// callback never fires again.
    pub fn open_channel<F>(&self, options: ChannelOptions<C>, callback: F) -> ChannelCloser
    where
        F: FnMut(Result<Channel, ChannelError>, &C) -> Option<CleanupFn> + Send + 'static,
    {
        let id = self.request_ids.fetch_add(1, Ordering::Relaxed);
        let status = StatusCell::new(ChannelStatus::Pending);

        self.post(Command::OpenChannel {
            id,
            options,
            callback: Box::new(callback) as ChannelCallback<C>,
            status: status.clone(),
        });

        let events = self.events.clone();
        ChannelCloser::new(
            status,
            Box::new(move || {
                let _ = events.send(Event::Command(Command::CloseChannel { id }));
            }),
        )
    }

    /// Tear the session down. Idempotent; a later `open()` starts fresh.
    pub fn close(&self) {
        self.post(Command::Close);
    }

    /// Install a breadcrumb sink (`connecting`, `reconnecting`,
    /// `retrying`, `polling fallback`). Pass-through for debugging; the
    /// same breadcrumbs go to `tracing` regardless.
    pub fn set_debug_func<F>(&self, debug: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.post(Command::SetDebug(Some(Box::new(debug))));
    }

    /// Install the sink for non-retriable failures: fatal metadata errors
    /// and invariant violations such as duplicate channel names.
    pub fn set_unrecoverable_error_handler<F>(&self, handler: F)
    where
        F: FnMut(FatalError) + Send + 'static,
    {
        self.post(Command::SetFatal(Some(Box::new(handler))));
    }

    fn post(&self, command: Command<C>) {
        let _ = self.events.send(Event::Command(command));
    }
}

impl<C: Send + 'static> Default for Client<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Drop for Client<C> {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Command(Command::Shutdown));
    }
}
