//! User-facing channel handles and the callback lifecycle contract.
//!
//! A channel's open callback is invoked once per incarnation (so again
//! after every reconnect). If it returns a cleanup function, that cleanup
//! runs exactly once when the incarnation ends, with a [`CloseReason`]
//! saying whether the library intends to bring the channel back up.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{ChannelError, SessionError};
use crate::frame::Frame;

/// Observable lifecycle state of a channel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Registered, waiting for a `Connected` session.
    Pending,
    /// Open-control sent, waiting for the server ack.
    Opening,
    /// Live.
    Open,
    /// Close-control sent, waiting for the server ack.
    Closing,
    /// Done. Terminal for the incarnation; a request driven back to
    /// `Pending` by a reconnect starts a new incarnation.
    Closed,
}

const STATUS_PENDING: u8 = 0;
const STATUS_OPENING: u8 = 1;
const STATUS_OPEN: u8 = 2;
const STATUS_CLOSING: u8 = 3;
const STATUS_CLOSED: u8 = 4;

fn status_from(raw: u8) -> ChannelStatus {
    match raw {
        STATUS_PENDING => ChannelStatus::Pending,
        STATUS_OPENING => ChannelStatus::Opening,
        STATUS_OPEN => ChannelStatus::Open,
        STATUS_CLOSING => ChannelStatus::Closing,
        _ => ChannelStatus::Closed,
    }
}

fn status_raw(status: ChannelStatus) -> u8 {
    match status {
        ChannelStatus::Pending => STATUS_PENDING,
        ChannelStatus::Opening => STATUS_OPENING,
        ChannelStatus::Open => STATUS_OPEN,
        ChannelStatus::Closing => STATUS_CLOSING,
        ChannelStatus::Closed => STATUS_CLOSED,
    }
}

/// Shared status cell. The session event loop is the only writer, with one
/// exception: [`ChannelCloser::close`] flips an active channel straight to
/// `Closing` so a close issued inside the open callback is observable
/// before the callback returns.
#[derive(Clone, Debug)]
pub(crate) struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    pub fn new(status: ChannelStatus) -> Self {
        Self(Arc::new(AtomicU8::new(status_raw(status))))
    }

    pub fn get(&self) -> ChannelStatus {
        status_from(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: ChannelStatus) {
        self.0.store(status_raw(status), Ordering::Release);
    }

    /// `Opening | Open -> Closing`. Other states are left for the event
    /// loop to resolve.
    pub fn begin_close(&self) {
        for active in [STATUS_OPEN, STATUS_OPENING] {
            if self
                .0
                .compare_exchange(active, STATUS_CLOSING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

/// Who initiated the end of an incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    /// The session (disconnect, reconnect, or `Client::close`).
    Client,
    /// The channel's own close handle.
    Channel,
}

/// Passed to cleanup callbacks when an incarnation ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    /// True iff the library will bring this channel back up automatically.
    pub will_reconnect: bool,
    pub initiator: Initiator,
}

/// Cleanup returned by an open callback; runs exactly once per incarnation.
pub type CleanupFn = Box<dyn FnOnce(CloseReason) + Send>;

/// Per-channel open callback. Invoked with `Ok(channel)` once per
/// incarnation, or with `Err` if the remote rejected the open.
pub type ChannelCallback<C> =
    Box<dyn FnMut(Result<Channel, ChannelError>, &C) -> Option<CleanupFn> + Send>;

/// Session-wide chan0 callback. Invoked with `Ok` on each `Connected`, or
/// exactly once with `Err` if the session could not be brought up.
pub type Chan0Callback<C> =
    Box<dyn FnMut(Result<Channel, SessionError>, &C) -> Option<CleanupFn> + Send>;

/// Breadcrumb sink installed with [`Client::set_debug_func`](crate::Client::set_debug_func).
pub type DebugFn = Box<dyn FnMut(&str) + Send>;

/// Fatal-error sink installed with
/// [`Client::set_unrecoverable_error_handler`](crate::Client::set_unrecoverable_error_handler).
pub type FatalFn = Box<dyn FnMut(crate::error::FatalError) + Send>;

/// A live channel incarnation, handed to the open callback.
///
/// Dropping the handle does not close the channel; use the
/// [`ChannelCloser`] returned by `open_channel` for that.
pub struct Channel {
    wire_id: u64,
    status: StatusCell,
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Channel {
    pub(crate) fn new(
        wire_id: u64,
        status: StatusCell,
        outbound: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            wire_id,
            status,
            outbound,
            inbound,
        }
    }

    /// Server-assigned wire id (0 for chan0).
    pub fn wire_id(&self) -> u64 {
        self.wire_id
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.get()
    }

    /// Send an opaque payload. Fails once the incarnation is over.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        if self.status.get() != ChannelStatus::Open {
            return Err(ChannelError::NotOpen);
        }
        self.outbound
            .send(Frame::Data {
                channel: self.wire_id,
                payload,
            })
            .map_err(|_| ChannelError::NotOpen)
    }

    /// Receive the next payload. `None` once the incarnation is over and
    /// all buffered payloads are drained.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("wire_id", &self.wire_id)
            .field("status", &self.status.get())
            .finish()
    }
}

/// Opaque close handle returned by `open_channel`.
///
/// Safe to call from anywhere, in any session state, any number of times.
pub struct ChannelCloser {
    status: StatusCell,
    post: Box<dyn Fn() + Send + Sync>,
}

impl ChannelCloser {
    pub(crate) fn new(status: StatusCell, post: Box<dyn Fn() + Send + Sync>) -> Self {
        Self { status, post }
    }

    /// Close the underlying request: drop it if still pending, cancel it if
    /// opening, send close-control if open, no-op if already closed.
    pub fn close(&self) {
        self.status.begin_close();
        (self.post)();
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.get()
    }
}
