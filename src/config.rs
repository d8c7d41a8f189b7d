//! Session configuration.

use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::metadata::MetadataFetchFn;
use crate::transport::SharedFactory;

/// Ceiling on how long a session may sit in non-connected states before the
/// chan0 callback hears `"Failed to open"`. Also bounds each individual
/// transport connect attempt.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything `open()` needs to bring a session up.
///
/// `C` is an arbitrary user context, passed by reference to every open
/// callback, service thunk, and skip predicate.
pub struct SessionConfig<C> {
    /// Resolves connection parameters against the metadata endpoint.
    pub fetch_metadata: MetadataFetchFn,

    /// Dials the primary transport (WebSocket in production).
    pub factory: SharedFactory,

    /// Substitute factory engaged after the primary transport fails to
    /// come up within the open timeout. Long polling, typically. When
    /// absent the primary keeps being used, but attempt accounting and
    /// breadcrumbs behave identically.
    pub fallback_factory: Option<SharedFactory>,

    /// User context handed to callbacks, service thunks and skip
    /// predicates.
    pub context: C,

    /// Open timeout; [`DEFAULT_OPEN_TIMEOUT`] when unset.
    pub timeout: Option<Duration>,

    /// Reconnect pacing.
    pub retry: RetryPolicy,
}

impl<C> SessionConfig<C> {
    pub fn new(fetch_metadata: MetadataFetchFn, factory: SharedFactory, context: C) -> Self {
        Self {
            fetch_metadata,
            factory,
            fallback_factory: None,
            context,
            timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn fallback_factory(mut self, factory: SharedFactory) -> Self {
        self.fallback_factory = Some(factory);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn open_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_OPEN_TIMEOUT)
    }
}
