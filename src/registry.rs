//! The channel registry: durable records of user intent.
//!
//! A [`ChannelRequest`] outlives any single connection. It is created by
//! `open_channel`, re-driven on every `Connected`, and only leaves the
//! registry when the user closes it or the session is torn down.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use crate::channel::{ChannelCallback, ChannelStatus, CleanupFn, StatusCell};
use crate::error::FatalError;

/// How a channel picks its remote service: a fixed name, or a function of
/// the user context evaluated at every (re)open.
pub enum ServiceSelector<C> {
    Name(String),
    Thunk(Box<dyn Fn(&C) -> String + Send>),
}

impl<C> ServiceSelector<C> {
    pub(crate) fn resolve(&self, ctx: &C) -> String {
        match self {
            ServiceSelector::Name(name) => name.clone(),
            ServiceSelector::Thunk(thunk) => thunk(ctx),
        }
    }
}

/// Options for `open_channel`.
pub struct ChannelOptions<C> {
    pub service: ServiceSelector<C>,

    /// Optional stable name. At most one non-closing request may hold a
    /// given name at any instant.
    pub name: Option<String>,

    /// Evaluated against the user context on every `Connected`; when true,
    /// the channel is not opened for that incarnation and the callback is
    /// not invoked. The request stays registered.
    pub skip: Option<Box<dyn Fn(&C) -> bool + Send>>,
}

impl<C> ChannelOptions<C> {
    /// Target a fixed service name.
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: ServiceSelector::Name(name.into()),
            name: None,
            skip: None,
        }
    }

    /// Pick the service from the user context at each open attempt.
    pub fn service_with(thunk: impl Fn(&C) -> String + Send + 'static) -> Self {
        Self {
            service: ServiceSelector::Thunk(Box::new(thunk)),
            name: None,
            skip: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn skip_when(mut self, predicate: impl Fn(&C) -> bool + Send + 'static) -> Self {
        self.skip = Some(Box::new(predicate));
        self
    }
}

/// One registered channel request. Owned by the registry; the user holds a
/// [`ChannelCloser`](crate::ChannelCloser) referencing it by id.
pub(crate) struct ChannelRequest<C> {
    pub id: u64,
    pub name: Option<String>,
    pub service: ServiceSelector<C>,
    pub skip: Option<Box<dyn Fn(&C) -> bool + Send>>,
    pub callback: ChannelCallback<C>,
    pub status: StatusCell,

    /// Cleanup returned by the callback for the current incarnation.
    pub cleanup: Option<CleanupFn>,

    /// Server-assigned wire id while open or closing.
    pub wire_id: Option<u64>,

    /// Inbound route for the current incarnation's [`Channel`](crate::Channel).
    pub inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,

    /// Close was requested while the open ack was still in flight; close
    /// immediately once it lands.
    pub cancel_on_ack: bool,

    /// Close-control has gone out for the current incarnation.
    pub close_sent: bool,
}

impl<C> ChannelRequest<C> {
    pub fn new(
        id: u64,
        options: ChannelOptions<C>,
        callback: ChannelCallback<C>,
        status: StatusCell,
    ) -> Self {
        Self {
            id,
            name: options.name,
            service: options.service,
            skip: options.skip,
            callback,
            status,
            cleanup: None,
            wire_id: None,
            inbound: None,
            cancel_on_ack: false,
            close_sent: false,
        }
    }

    /// Drop all per-incarnation state, returning the cleanup (if any) so
    /// the caller can run it in the right order.
    pub fn end_incarnation(&mut self) -> Option<CleanupFn> {
        self.wire_id = None;
        self.inbound = None;
        self.cancel_on_ack = false;
        self.close_sent = false;
        self.cleanup.take()
    }
}

/// Registry of channel requests, iterated in registration order.
pub(crate) struct ChannelRegistry<C> {
    requests: BTreeMap<u64, ChannelRequest<C>>,
}

impl<C> Default for ChannelRegistry<C> {
    fn default() -> Self {
        Self {
            requests: BTreeMap::new(),
        }
    }
}

impl<C> ChannelRegistry<C> {
    /// Register a request, enforcing name uniqueness among requests that
    /// are not on their way out.
    pub fn insert(&mut self, request: ChannelRequest<C>) -> Result<(), FatalError> {
        if let Some(name) = &request.name {
            let taken = self.requests.values().any(|r| {
                r.name.as_deref() == Some(name.as_str())
                    && !matches!(
                        r.status.get(),
                        ChannelStatus::Closing | ChannelStatus::Closed
                    )
            });
            if taken {
                return Err(FatalError::DuplicateChannelName(name.clone()));
            }
        }
        self.requests.insert(request.id, request);
        Ok(())
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut ChannelRequest<C>> {
        self.requests.get_mut(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<ChannelRequest<C>> {
        self.requests.remove(&id)
    }

    pub fn id_by_wire(&self, wire_id: u64) -> Option<u64> {
        self.requests
            .values()
            .find(|r| r.wire_id == Some(wire_id))
            .map(|r| r.id)
    }

    /// Request ids in registration order.
    pub fn ids(&self) -> Vec<u64> {
        self.requests.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64, name: Option<&str>) -> ChannelRequest<()> {
        let mut options = ChannelOptions::<()>::service("svc");
        if let Some(name) = name {
            options = options.named(name);
        }
        ChannelRequest::new(
            id,
            options,
            Box::new(|_, _| None),
            StatusCell::new(ChannelStatus::Pending),
        )
    }

    #[test]
    fn duplicate_live_name_rejected() {
        let mut registry = ChannelRegistry::default();
        registry.insert(request(1, Some("term"))).unwrap();

        let err = registry.insert(request(2, Some("term"))).unwrap_err();
        assert!(matches!(err, FatalError::DuplicateChannelName(n) if n == "term"));
    }

    #[test]
    fn closing_request_frees_its_name() {
        let mut registry = ChannelRegistry::default();
        registry.insert(request(1, Some("term"))).unwrap();
        registry
            .get_mut(1)
            .unwrap()
            .status
            .set(ChannelStatus::Closing);

        registry.insert(request(2, Some("term"))).unwrap();
        assert_eq!(registry.ids(), vec![1, 2]);
    }

    #[test]
    fn unnamed_requests_never_collide() {
        let mut registry = ChannelRegistry::default();
        registry.insert(request(1, None)).unwrap();
        registry.insert(request(2, None)).unwrap();
        assert_eq!(registry.ids(), vec![1, 2]);
    }
}
