#![deny(unsafe_code)]

//! Durable multiplexed session client.
//!
//! One socket, many channels. A [`Client`] keeps a long-lived session to a
//! remote service: it resolves connection metadata (URL + token) through a
//! user-supplied fetch, dials a message transport (WebSocket by default),
//! and multiplexes independently-addressed channels over it. Disconnects
//! are absorbed: the session backs off, refetches metadata, redials, and
//! re-opens every registered channel — user intent survives the churn.
//!
//! The callback contract does the heavy lifting: an open callback is
//! invoked once per connection in which its channel comes up, and may
//! return a cleanup that runs exactly once when that incarnation ends,
//! told whether the channel will come back (`will_reconnect`).
//!
//! ```ignore
//! let client = Client::new();
//! client.open(
//!     SessionConfig::new(
//!         metadata_fn(|req| async move { fetch_from_control_plane(req).await }),
//!         Arc::new(WsFactory),
//!         MyContext::default(),
//!     ),
//!     |result, _ctx| {
//!         let session = result.ok()?;
//!         tracing::info!("session up");
//!         Some(Box::new(move |reason| {
//!             tracing::info!(?reason, "session down");
//!         }))
//!     },
//! );
//!
//! let closer = client.open_channel(ChannelOptions::service("shell"), |result, _ctx| {
//!     let channel = result.ok()?;
//!     // read/write channel...
//!     None
//! });
//! ```

mod backoff;
mod channel;
mod client;
mod config;
mod error;
mod frame;
mod metadata;
mod mux;
mod registry;
mod session;
mod transport;

pub use backoff::{Backoff, RetryPolicy};
pub use channel::{
    Chan0Callback, Channel, ChannelCallback, ChannelCloser, ChannelStatus, CleanupFn, CloseReason,
    DebugFn, FatalFn, Initiator,
};
pub use client::Client;
pub use config::{SessionConfig, DEFAULT_OPEN_TIMEOUT};
pub use error::{ChannelError, FatalError, MetadataError, SessionError, FAILED_TO_OPEN};
pub use frame::{Frame, CHAN0};
pub use metadata::{
    metadata_fn, AbortSignal, ConnectionMetadata, MetadataFetchFn, MetadataRequest,
};
pub use registry::{ChannelOptions, ServiceSelector};
pub use session::SessionState;
pub use transport::{
    websocket::{WsFactory, WsTransport},
    BoxTransport, FactoryFn, SharedFactory, Transport, TransportFactory,
};
