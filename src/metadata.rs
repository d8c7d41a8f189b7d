//! Connection-metadata acquisition.
//!
//! The user supplies an async function that resolves connection parameters
//! (URL, token) against some external endpoint. This module adds the
//! plumbing around it: an abort signal wired to `close()`, an invocation
//! counter, and a one-shot token cache that lets a reconnect reuse the last
//! good metadata once before going back to the endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::Notify;

use crate::error::MetadataError;

/// Connection parameters produced by a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionMetadata {
    /// Transport endpoint to dial.
    pub url: String,

    /// Credential presented to the endpoint.
    pub token: String,

    /// Anything else the metadata endpoint returned; opaque to the session.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConnectionMetadata {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Argument handed to the user fetch function on each invocation.
pub struct MetadataRequest {
    /// Fires when the session is closed while the fetch is in flight.
    pub signal: AbortSignal,

    /// 1-based count of fetch-function invocations this session. Cache
    /// reuses do not count.
    pub try_count: u32,
}

/// The user-supplied metadata source.
pub type MetadataFetchFn = Arc<
    dyn Fn(MetadataRequest) -> BoxFuture<'static, Result<ConnectionMetadata, MetadataError>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`MetadataFetchFn`].
pub fn metadata_fn<F, Fut>(f: F) -> MetadataFetchFn
where
    F: Fn(MetadataRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<ConnectionMetadata, MetadataError>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

#[derive(Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation signal for a metadata fetch.
///
/// A fetch that never observes the signal is fine: the session drops its
/// result by generation instead of waiting for it.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Resolves once the signal fires. Resolves immediately if it already
    /// has.
    pub async fn aborted(&self) {
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        // Register interest before the flag check so an abort landing in
        // between cannot be lost.
        notified.as_mut().enable();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }

    pub(crate) fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }
}

/// Single-reuse cache of the last successful fetch result.
///
/// A reconnect may consume the cached value once without invoking the user
/// function (metadata endpoints are often quota-limited). If the attempt
/// built on the reused value fails to reach `Connected`, the cache is
/// invalidated and the next attempt fetches fresh.
#[derive(Default)]
pub(crate) struct MetadataCache {
    value: Option<ConnectionMetadata>,
    reused: bool,
}

impl MetadataCache {
    /// Store a fresh successful fetch result, re-arming the single reuse.
    pub fn fill(&mut self, metadata: ConnectionMetadata) {
        self.value = Some(metadata);
        self.reused = false;
    }

    /// Take the cached value if it has not been reused yet.
    pub fn take_reusable(&mut self) -> Option<ConnectionMetadata> {
        if self.reused {
            return None;
        }
        let value = self.value.clone()?;
        self.reused = true;
        Some(value)
    }

    pub fn invalidate(&mut self) {
        self.value = None;
        self.reused = false;
    }
}
