//! Error types for the session client.
//!
//! Nothing in this crate throws across an async boundary: every failure is
//! delivered through a callback (chan0, channel, cleanup) or the
//! unrecoverable-error handler. These types are what those callbacks carry.

use thiserror::Error;

/// The message delivered to the chan0 callback when the session could not be
/// brought up (timeout, abort, fatal metadata failure).
pub const FAILED_TO_OPEN: &str = "Failed to open";

/// Error returned by a user-supplied metadata fetch.
///
/// Anything that is not `Retriable` or `Aborted` is treated as fatal and
/// routed to the unrecoverable-error handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// Transient failure; the session retries the fetch after backoff.
    #[error("retriable metadata failure: {0}")]
    Retriable(String),

    /// The fetch observed the abort signal after `close()`.
    #[error("metadata fetch aborted")]
    Aborted,

    /// Unrecoverable failure; the session moves to `Closed`.
    #[error("fatal metadata failure: {0}")]
    Fatal(String),
}

/// Session-level failure delivered to the chan0 callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session could not reach `Connected` before the open timeout, the
    /// fetch was aborted, or metadata failed fatally.
    #[error("Failed to open")]
    FailedToOpen,
}

/// Failure delivered to a channel's open callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The remote service refused to open the channel.
    #[error("service rejected channel: {0}")]
    Rejected(String),

    /// The channel is not open (send on a stale incarnation, or the
    /// transport is gone).
    #[error("channel is not open")]
    NotOpen,
}

/// Fatal conditions routed to the handler installed with
/// [`Client::set_unrecoverable_error_handler`](crate::Client::set_unrecoverable_error_handler).
#[derive(Error, Debug)]
pub enum FatalError {
    /// Another non-closing channel request already holds this name.
    #[error("channel name {0:?} is already in use")]
    DuplicateChannelName(String),

    /// The metadata fetch failed with a non-retriable, non-abort error.
    #[error("metadata fetch failed: {0}")]
    Metadata(String),

    /// `open()` was called while a session is already in flight.
    #[error("session is already open")]
    AlreadyOpen,
}
