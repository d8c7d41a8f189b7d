//! Message transport abstraction.
//!
//! A transport is a connected, message-oriented, bidirectional pipe. The
//! session owns exactly one at a time and drives it from a pump task; the
//! trait is object-safe so the session can swap implementations at runtime
//! (the polling fallback) and tests can substitute in-memory fakes.

use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::frame::Frame;

pub mod websocket;

/// A live, connected transport.
pub trait Transport: Send {
    /// Send one frame.
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, io::Result<()>>;

    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed cleanly. Transport-internal
    /// traffic (pings, pongs) is absorbed here and never surfaces.
    fn recv(&mut self) -> BoxFuture<'_, io::Result<Option<Frame>>>;

    /// Close the underlying connection. Best effort.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub type BoxTransport = Box<dyn Transport>;

/// Dials new transports. Invoked once per connect attempt with the URL and
/// token from the current connection metadata.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, url: &str, token: &str) -> BoxFuture<'static, io::Result<BoxTransport>>;
}

pub type SharedFactory = Arc<dyn TransportFactory>;

/// Adapter turning a plain closure into a [`TransportFactory`]. Handy for
/// tests and for callers that dial with something other than WebSocket.
pub struct FactoryFn<F>(pub F);

impl<F> TransportFactory for FactoryFn<F>
where
    F: Fn(&str, &str) -> BoxFuture<'static, io::Result<BoxTransport>> + Send + Sync,
{
    fn connect(&self, url: &str, token: &str) -> BoxFuture<'static, io::Result<BoxTransport>> {
        (self.0)(url, token)
    }
}
