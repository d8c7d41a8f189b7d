//! Shared test harness: scripted in-memory transports and metadata
//! fixtures.
//!
//! The fake network hands every accepted connection to the test as a
//! [`ServerConn`], so tests drive the remote side of the protocol
//! explicitly (or via [`ServerConn::auto_ack`] when the details don't
//! matter).

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

use tether::{
    metadata_fn, BoxTransport, ConnectionMetadata, Frame, MetadataError, MetadataFetchFn,
    RetryPolicy, SharedFactory, Transport, TransportFactory,
};

const WAIT: Duration = Duration::from_secs(2);

/// What the fake network does with one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connect {
    Accept,
    Refuse,
    Hang,
}

/// In-memory transport: frames cross over unbounded channels.
pub struct FakeTransport {
    to_server: Option<mpsc::UnboundedSender<Frame>>,
    from_server: mpsc::UnboundedReceiver<Result<Frame, String>>,
}

impl Transport for FakeTransport {
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.to_server
                .as_ref()
                .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?
                .send(frame)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, io::Result<Option<Frame>>> {
        Box::pin(async move {
            match self.from_server.recv().await {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(error)) => Err(io::Error::other(error)),
                None => Ok(None),
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.to_server = None;
        })
    }
}

/// The remote end of one accepted connection.
pub struct ServerConn {
    pub from_client: mpsc::UnboundedReceiver<Frame>,
    pub to_client: mpsc::UnboundedSender<Result<Frame, String>>,
    next_wire_id: u64,
}

impl ServerConn {
    /// Next frame from the client; panics if none arrives in time.
    pub async fn recv(&mut self) -> Frame {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client side closed")
    }

    pub fn send(&self, frame: Frame) {
        let _ = self.to_client.send(Ok(frame));
    }

    /// Ack an open with a fresh wire id; returns it.
    pub fn ack_open(&mut self, ref_id: u64) -> u64 {
        self.next_wire_id += 1;
        let wire_id = self.next_wire_id;
        self.send(Frame::OpenChannelAck {
            ref_id,
            channel: wire_id,
            error: None,
        });
        wire_id
    }

    pub fn reject_open(&self, ref_id: u64, error: &str) {
        self.send(Frame::OpenChannelAck {
            ref_id,
            channel: 0,
            error: Some(error.to_string()),
        });
    }

    pub fn ack_close(&self, wire_id: u64) {
        self.send(Frame::CloseChannelAck { channel: wire_id });
    }

    /// Answer every open/close automatically in a background task. The
    /// returned handle disconnects the connection on demand.
    pub fn auto_ack(mut self) -> AutoAck {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    frame = self.from_client.recv() => match frame {
                        Some(Frame::OpenChannel { ref_id, .. }) => {
                            self.ack_open(ref_id);
                        }
                        Some(Frame::CloseChannel { channel }) => {
                            self.ack_close(channel);
                        }
                        Some(_) => {}
                        None => return,
                    },
                }
            }
        });
        AutoAck {
            stop: Some(stop_tx),
        }
    }
}

/// Handle to an auto-acking connection; dropping the stop side tears the
/// connection down, which the client observes as an unexpected close.
pub struct AutoAck {
    stop: Option<oneshot::Sender<()>>,
}

impl AutoAck {
    pub fn disconnect(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// A scripted fake network. Behaviors are consumed per connect attempt;
/// once the script runs dry, `default` applies.
pub struct TestNet {
    pub factory: SharedFactory,
    pub attempts: Arc<Mutex<Vec<(String, String)>>>,
    conns: mpsc::UnboundedReceiver<ServerConn>,
}

/// Opt-in test logging: `RUST_LOG=tether=trace cargo test -- --nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

impl TestNet {
    pub fn new(script: Vec<Connect>, default: Connect) -> Self {
        init_tracing();
        let (conns_tx, conns_rx) = mpsc::unbounded_channel();
        let attempts: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let script = Arc::new(Mutex::new(VecDeque::from(script)));

        struct Factory {
            script: Arc<Mutex<VecDeque<Connect>>>,
            default: Connect,
            attempts: Arc<Mutex<Vec<(String, String)>>>,
            conns_tx: mpsc::UnboundedSender<ServerConn>,
        }

        impl TransportFactory for Factory {
            fn connect(
                &self,
                url: &str,
                token: &str,
            ) -> BoxFuture<'static, io::Result<BoxTransport>> {
                self.attempts
                    .lock()
                    .unwrap()
                    .push((url.to_string(), token.to_string()));
                let behavior = self
                    .script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(self.default);
                let conns_tx = self.conns_tx.clone();
                Box::pin(async move {
                    match behavior {
                        Connect::Refuse => {
                            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
                        }
                        Connect::Hang => futures_util::future::pending().await,
                        Connect::Accept => {
                            let (to_server, from_client) = mpsc::unbounded_channel();
                            let (to_client, from_server) = mpsc::unbounded_channel();
                            let _ = conns_tx.send(ServerConn {
                                from_client,
                                to_client,
                                next_wire_id: 0,
                            });
                            Ok(Box::new(FakeTransport {
                                to_server: Some(to_server),
                                from_server,
                            }) as BoxTransport)
                        }
                    }
                })
            }
        }

        Self {
            factory: Arc::new(Factory {
                script,
                default,
                attempts: attempts.clone(),
                conns_tx,
            }),
            attempts,
            conns: conns_rx,
        }
    }

    pub fn accepting() -> Self {
        Self::new(Vec::new(), Connect::Accept)
    }

    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("factory dropped")
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

/// Metadata fetch that always succeeds, counting invocations.
pub fn fetch_ok(url: &str, token: &str) -> (MetadataFetchFn, Arc<AtomicU32>) {
    fetch_script(vec![Ok(ConnectionMetadata::new(url, token))])
}

/// Metadata fetch serving scripted results; the last one repeats forever.
/// Returns the invocation counter alongside.
pub fn fetch_script(
    script: Vec<Result<ConnectionMetadata, MetadataError>>,
) -> (MetadataFetchFn, Arc<AtomicU32>) {
    assert!(!script.is_empty());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let fetch = metadata_fn(move |_req| {
        let index = counter.fetch_add(1, Ordering::SeqCst) as usize;
        let result = script[index.min(script.len() - 1)].clone();
        async move { result }
    });
    (fetch, calls)
}

/// Metadata fetch that never resolves until aborted, then reports
/// `Aborted`. The flag records that the abort signal was observed.
pub fn fetch_hanging() -> (MetadataFetchFn, Arc<AtomicU32>) {
    let observed = Arc::new(AtomicU32::new(0));
    let flag = observed.clone();
    let fetch = metadata_fn(move |req| {
        let flag = flag.clone();
        async move {
            req.signal.aborted().await;
            flag.fetch_add(1, Ordering::SeqCst);
            Err(MetadataError::Aborted)
        }
    });
    (fetch, observed)
}

/// Tight retry policy so tests spend milliseconds, not seconds.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    }
}

/// Append-only event log shared between callbacks and assertions.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == entry)
    }
}

/// Poll until `predicate` holds; panics after the shared deadline.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        sleep(Duration::from_millis(5)).await;
    }
}
