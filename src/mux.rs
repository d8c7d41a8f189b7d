//! Channel multiplexing over the live transport.
//!
//! The mux issues open/close control frames for registered requests,
//! matches server acks back to requests, routes inbound data, and runs the
//! user callbacks. It only touches the transport while the session is
//! `Connected`; all per-connection bookkeeping is dropped on disconnect.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::channel::{Channel, ChannelStatus, CleanupFn, CloseReason, Initiator};
use crate::error::ChannelError;
use crate::frame::Frame;
use crate::registry::ChannelRegistry;

/// Invoke an open callback, isolating panics. A panicking callback loses
/// its cleanup but must not take the session down with it.
pub(crate) fn dispatch_open<R, C>(
    callback: &mut Box<dyn FnMut(R, &C) -> Option<CleanupFn> + Send>,
    result: R,
    ctx: &C,
) -> Option<CleanupFn> {
    match catch_unwind(AssertUnwindSafe(|| callback(result, ctx))) {
        Ok(cleanup) => cleanup,
        Err(_) => {
            error!("channel open callback panicked");
            None
        }
    }
}

/// Run a cleanup callback, isolating panics.
pub(crate) fn run_cleanup(cleanup: CleanupFn, reason: CloseReason) {
    if catch_unwind(AssertUnwindSafe(|| cleanup(reason))).is_err() {
        error!("channel cleanup callback panicked");
    }
}

#[derive(Default)]
pub(crate) struct ChannelMux {
    /// Request ids with an open-control in flight.
    pending_opens: HashSet<u64>,
}

impl ChannelMux {
    /// Issue open-control for every pending request whose skip predicate
    /// passes. Called on each entry to `Connected`.
    pub fn open_pending<C>(
        &mut self,
        registry: &mut ChannelRegistry<C>,
        ctx: &C,
        outbound: &mpsc::UnboundedSender<Frame>,
    ) {
        for id in registry.ids() {
            self.open_one(registry, id, ctx, outbound);
        }
    }

    /// Issue open-control for a single pending request. Used for requests
    /// registered while the session is already `Connected`.
    pub fn open_one<C>(
        &mut self,
        registry: &mut ChannelRegistry<C>,
        id: u64,
        ctx: &C,
        outbound: &mpsc::UnboundedSender<Frame>,
    ) {
        let Some(request) = registry.get_mut(id) else {
            return;
        };
        if request.status.get() != ChannelStatus::Pending {
            return;
        }
        if let Some(skip) = &request.skip {
            if skip(ctx) {
                debug!(request = id, "channel skipped for this connection");
                return;
            }
        }
        let service = request.service.resolve(ctx);
        request.status.set(ChannelStatus::Opening);
        self.pending_opens.insert(id);
        let _ = outbound.send(Frame::OpenChannel {
            ref_id: id,
            service,
            name: request.name.clone(),
        });
    }

    /// Handle a control frame from the wire. `Data` for chan0 is routed by
    /// the session before it gets here.
    pub fn handle_frame<C>(
        &mut self,
        registry: &mut ChannelRegistry<C>,
        ctx: &C,
        outbound: &mpsc::UnboundedSender<Frame>,
        frame: Frame,
    ) {
        match frame {
            Frame::OpenChannelAck {
                ref_id,
                channel,
                error,
            } => self.handle_open_ack(registry, ctx, outbound, ref_id, channel, error),
            Frame::CloseChannelAck { channel } => self.handle_close_ack(registry, channel),
            Frame::Data {
                channel,
                payload,
            } => {
                let Some(id) = registry.id_by_wire(channel) else {
                    debug!(channel, "data for unknown channel dropped");
                    return;
                };
                if let Some(request) = registry.get_mut(id) {
                    if let Some(inbound) = &request.inbound {
                        let _ = inbound.send(payload);
                    }
                }
            }
            Frame::OpenChannel { .. } | Frame::CloseChannel { .. } => {
                // Client-to-server frames; a server echoing them is confused
                // but harmless.
                warn!("unexpected client-direction frame from server");
            }
        }
    }

    fn handle_open_ack<C>(
        &mut self,
        registry: &mut ChannelRegistry<C>,
        ctx: &C,
        outbound: &mpsc::UnboundedSender<Frame>,
        ref_id: u64,
        wire_id: u64,
        error: Option<String>,
    ) {
        if !self.pending_opens.remove(&ref_id) {
            debug!(ref_id, "stale open ack dropped");
            return;
        }
        let Some(request) = registry.get_mut(ref_id) else {
            return;
        };

        if request.cancel_on_ack || request.status.get() == ChannelStatus::Closing {
            // User closed while the open was in flight: the channel never
            // surfaces, whatever the ack said. On success close it on the
            // wire now that we know its id.
            if error.is_none() {
                request.wire_id = Some(wire_id);
                request.close_sent = true;
                request.status.set(ChannelStatus::Closing);
                let _ = outbound.send(Frame::CloseChannel { channel: wire_id });
            } else {
                request.status.set(ChannelStatus::Closed);
                registry.remove(ref_id);
            }
            return;
        }

        if let Some(message) = error {
            // The remote said no. The callback hears about it once and the
            // request will not be retried on later connections.
            request.status.set(ChannelStatus::Closed);
            dispatch_open(
                &mut request.callback,
                Err(ChannelError::Rejected(message)),
                ctx,
            );
            registry.remove(ref_id);
            return;
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        request.wire_id = Some(wire_id);
        request.inbound = Some(inbound_tx);
        request.status.set(ChannelStatus::Open);

        let channel = Channel::new(
            wire_id,
            request.status.clone(),
            outbound.clone(),
            inbound_rx,
        );
        request.cleanup = dispatch_open(&mut request.callback, Ok(channel), ctx);
        // The callback may have used its closer synchronously; the queued
        // close command takes it from here.
    }

    fn handle_close_ack<C>(&mut self, registry: &mut ChannelRegistry<C>, wire_id: u64) {
        let Some(id) = registry.id_by_wire(wire_id) else {
            debug!(wire_id, "close ack for unknown channel dropped");
            return;
        };
        let Some(request) = registry.get_mut(id) else {
            return;
        };
        if request.status.get() != ChannelStatus::Closing {
            return;
        }
        request.status.set(ChannelStatus::Closed);
        let cleanup = request.end_incarnation();
        registry.remove(id);
        if let Some(cleanup) = cleanup {
            run_cleanup(
                cleanup,
                CloseReason {
                    will_reconnect: false,
                    initiator: Initiator::Channel,
                },
            );
        }
    }

    /// Drive a close requested through a channel's close handle.
    pub fn request_close<C>(
        &mut self,
        registry: &mut ChannelRegistry<C>,
        id: u64,
        outbound: Option<&mpsc::UnboundedSender<Frame>>,
    ) {
        let Some(request) = registry.get_mut(id) else {
            return;
        };

        if self.pending_opens.contains(&id) {
            request.cancel_on_ack = true;
            return;
        }

        match request.wire_id {
            Some(wire_id) if !request.close_sent => {
                request.close_sent = true;
                request.status.set(ChannelStatus::Closing);
                if let Some(outbound) = outbound {
                    let _ = outbound.send(Frame::CloseChannel { channel: wire_id });
                } else {
                    // No transport to ack the close; finish locally.
                    request.status.set(ChannelStatus::Closed);
                    let cleanup = request.end_incarnation();
                    registry.remove(id);
                    if let Some(cleanup) = cleanup {
                        run_cleanup(
                            cleanup,
                            CloseReason {
                                will_reconnect: false,
                                initiator: Initiator::Channel,
                            },
                        );
                    }
                }
            }
            Some(_) => {
                // Close already in flight.
            }
            None => {
                // Still pending: the request simply goes away. No callback
                // ever fired, so there is no cleanup to run.
                request.status.set(ChannelStatus::Closed);
                registry.remove(id);
            }
        }
    }

    /// Unexpected disconnect while `Connected`: run every live cleanup,
    /// then park surviving requests back in `Pending` for the next
    /// connection. Requests already on their way out finish as `Closed`
    /// and do not come back.
    pub fn on_disconnect<C>(&mut self, registry: &mut ChannelRegistry<C>) {
        self.pending_opens.clear();
        for id in registry.ids() {
            let Some(request) = registry.get_mut(id) else {
                continue;
            };
            match request.status.get() {
                ChannelStatus::Pending => {}
                ChannelStatus::Closing => {
                    request.status.set(ChannelStatus::Closed);
                    let cleanup = request.end_incarnation();
                    registry.remove(id);
                    if let Some(cleanup) = cleanup {
                        run_cleanup(
                            cleanup,
                            CloseReason {
                                will_reconnect: false,
                                initiator: Initiator::Channel,
                            },
                        );
                    }
                }
                ChannelStatus::Opening | ChannelStatus::Open => {
                    let cleanup = request.end_incarnation();
                    request.status.set(ChannelStatus::Pending);
                    if let Some(cleanup) = cleanup {
                        run_cleanup(
                            cleanup,
                            CloseReason {
                                will_reconnect: true,
                                initiator: Initiator::Client,
                            },
                        );
                    }
                }
                ChannelStatus::Closed => {
                    registry.remove(id);
                }
            }
        }
    }

    /// Session teardown: close-control best effort, then drive every
    /// request to `Closed` with its cleanup run exactly once.
    pub fn teardown<C>(
        &mut self,
        registry: &mut ChannelRegistry<C>,
        outbound: Option<&mpsc::UnboundedSender<Frame>>,
    ) {
        self.pending_opens.clear();
        for id in registry.ids() {
            let Some(request) = registry.get_mut(id) else {
                continue;
            };
            if let (Some(wire_id), Some(outbound)) = (request.wire_id, outbound) {
                if !request.close_sent {
                    let _ = outbound.send(Frame::CloseChannel { channel: wire_id });
                }
            }
            request.status.set(ChannelStatus::Closed);
            let cleanup = request.end_incarnation();
            registry.remove(id);
            if let Some(cleanup) = cleanup {
                run_cleanup(
                    cleanup,
                    CloseReason {
                        will_reconnect: false,
                        initiator: Initiator::Client,
                    },
                );
            }
        }
    }
}
