//! Line-delimited JSON transport
//!
//! Keeps one connection to a remote server alive and multiplexes requests
//! over it:
//! - Each call gets a fresh numeric id and settles when the response with the
//!   same id arrives, in whatever order responses come back
//! - Unsolicited notifications are checked against an allow-list and
//!   published on a broadcast channel
//! - Any connection failure schedules a reconnect with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! Transport (handle, cheap to share behind Arc)
//!     │ call() ──► mpsc ──► Worker task ──► Framed<stream, LinesCodec>
//!     │                        │
//!     │ ◄── oneshot ◄──────────┤ pending: id → PendingRequest
//!     │                        │
//!     └ subscribe() ◄ broadcast┘ notifications
//! ```
//!
//! The worker task exclusively owns the pending-request map and the backoff
//! state, so no locks guard them.

mod backoff;
mod connector;
mod message;

pub use backoff::Backoff;
pub use connector::{AsyncReadWrite, BoxedStream, Connector, ProcessConnector, TcpConnector};
pub use message::{error_message, Incoming, Notification, NotificationMethod, Request};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Capacity of the notification broadcast channel
const NOTIFICATION_CAPACITY: usize = 256;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What happens to in-flight requests when the connection drops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// Pending futures never settle.
    #[default]
    Abandon,
    /// Pending futures settle with `TransportError::ConnectionLost`.
    Reject,
}

/// Transport tuning
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub max_line_bytes: usize,
    pub on_disconnect: DisconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_line_bytes: 1024 * 1024,
            on_disconnect: DisconnectPolicy::Abandon,
        }
    }
}

/// A call waiting to be written to the connection
struct Outgoing {
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, TransportError>>,
}

/// One in-flight remote call, keyed by id in the worker's map. Settles once.
struct PendingRequest {
    method: String,
    reply: oneshot::Sender<Result<Value, TransportError>>,
}

/// Handle to a multiplexed connection.
pub struct Transport {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    worker: Mutex<Option<Worker>>,
    notifications: broadcast::Sender<Notification>,
    state: watch::Receiver<ConnectionState>,
    sessions: watch::Receiver<u64>,
    shutdown: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
    connect_timeout: Duration,
    describe: String,
}

impl Transport {
    /// Create a transport. Nothing happens on the network until `connect`.
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (sessions_tx, sessions_rx) = watch::channel(0u64);
        let (shutdown_tx, _) = watch::channel(false);
        let describe = connector.describe();

        let worker = Worker {
            connector,
            outgoing: outgoing_rx,
            notifications: notifications.clone(),
            state: state_tx,
            sessions: sessions_tx,
            backoff: Backoff::new(config.backoff_min, config.backoff_max),
            next_id: 1,
            max_line_bytes: config.max_line_bytes,
            connect_timeout: config.connect_timeout,
            policy: config.on_disconnect,
        };

        Self {
            outgoing: outgoing_tx,
            worker: Mutex::new(Some(worker)),
            notifications,
            state: state_rx,
            sessions: sessions_rx,
            shutdown: shutdown_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            connect_timeout: config.connect_timeout,
            describe,
        }
    }

    /// Establish the connection and start the background worker.
    ///
    /// Idempotent: returns immediately when already connected, and waits for
    /// the running worker's next successful connection otherwise.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::Shutdown);
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let worker = self
            .worker
            .lock()
            .map_err(|_| TransportError::Shutdown)?
            .take();

        match worker {
            Some(worker) => match worker.open().await {
                Ok(stream) => {
                    worker.mark_connected();
                    let shutdown = self.shutdown.subscribe();
                    tokio::spawn(worker.run(Some(stream), shutdown));
                    Ok(())
                }
                Err(err) => {
                    worker.set_state(ConnectionState::Disconnected);
                    if let Ok(mut slot) = self.worker.lock() {
                        *slot = Some(worker);
                    }
                    Err(err)
                }
            },
            None => {
                let mut state = self.state.clone();
                tokio::time::timeout(
                    self.connect_timeout,
                    state.wait_for(|s| *s == ConnectionState::Connected),
                )
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::Shutdown)?;
                Ok(())
            }
        }
    }

    /// Send `method` with `params` and wait for the matching response.
    ///
    /// Requests issued while disconnected are transmitted after the next
    /// successful connection. Under `DisconnectPolicy::Abandon` a request
    /// whose connection drops before the response arrives never completes;
    /// callers apply their own timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let (reply, settled) = oneshot::channel();
        let _guard = InFlightGuard::new(self.in_flight.clone());

        self.outgoing
            .send(Outgoing {
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| TransportError::Shutdown)?;

        match settled.await {
            Ok(result) => result,
            Err(_) => {
                debug!("request {} abandoned by dropped connection", method);
                futures::future::pending().await
            }
        }
    }

    /// Receive notifications that pass the allow-list.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Counter of established connections; bumps on every (re)connect.
    pub fn sessions(&self) -> watch::Receiver<u64> {
        self.sessions.clone()
    }

    /// Number of calls that have not settled yet.
    pub fn pending_requests(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn has_pending_requests(&self) -> bool {
        self.pending_requests() > 0
    }

    pub fn describe(&self) -> &str {
        &self.describe
    }

    /// Stop the worker. Later calls fail with `TransportError::Shutdown`.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Ok(mut slot) = self.worker.lock() {
            if let Some(mut worker) = slot.take() {
                worker.fail_queued(|| TransportError::Shutdown);
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Counts a call as in flight until its future completes or is dropped.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Why a connection ended
enum SessionEnd {
    Shutdown,
    Failed(TransportError),
}

/// Background task owning the connection, the pending map and the backoff.
struct Worker {
    connector: Arc<dyn Connector>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    notifications: broadcast::Sender<Notification>,
    state: watch::Sender<ConnectionState>,
    sessions: watch::Sender<u64>,
    backoff: Backoff,
    next_id: u64,
    max_line_bytes: usize,
    connect_timeout: Duration,
    policy: DisconnectPolicy,
}

impl Worker {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn mark_connected(&self) {
        self.set_state(ConnectionState::Connected);
        self.sessions.send_modify(|n| *n += 1);
        info!("Connected to {}", self.connector.describe());
    }

    async fn open(&self) -> Result<BoxedStream, TransportError> {
        self.set_state(ConnectionState::Connecting);
        match tokio::time::timeout(self.connect_timeout, self.connector.connect()).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TransportError::Connection(e)),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Serve `first`, which the caller already marked connected, then keep
    /// reconnecting until shutdown.
    async fn run(mut self, mut first: Option<BoxedStream>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let stream = match first.take() {
                Some(stream) => stream,
                None => match self.open().await {
                    Ok(stream) => {
                        self.mark_connected();
                        stream
                    }
                    Err(e) => {
                        self.set_state(ConnectionState::Disconnected);
                        warn!("Connection to {} failed: {}", self.connector.describe(), e);
                        if !self.wait_backoff(&mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let end = self.serve(stream, &mut shutdown).await;
            self.set_state(ConnectionState::Disconnected);

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(e) => {
                    warn!("Connection to {} lost: {}", self.connector.describe(), e);
                }
            }

            if !self.wait_backoff(&mut shutdown).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.fail_queued(|| TransportError::Shutdown);
        debug!("Transport worker for {} stopped", self.connector.describe());
    }

    /// Sleep for the next backoff delay. Returns false on shutdown.
    async fn wait_backoff(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return false;
        }
        let delay = self.backoff.next_delay();
        info!(
            "Reconnecting to {} in {:?} (attempt {})",
            self.connector.describe(),
            delay,
            self.backoff.failures()
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }

    async fn serve(
        &mut self,
        stream: BoxedStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(self.max_line_bytes));
        let mut pending: HashMap<u64, PendingRequest> = HashMap::new();

        let end = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break SessionEnd::Shutdown;
                    }
                }
                outgoing = self.outgoing.recv() => {
                    let Some(outgoing) = outgoing else {
                        break SessionEnd::Shutdown;
                    };
                    if outgoing.reply.is_closed() {
                        continue;
                    }

                    let id = self.next_id;
                    self.next_id += 1;

                    let line = match Request::new(id, outgoing.method.as_str(), outgoing.params).to_line() {
                        Ok(line) => line,
                        Err(e) => {
                            let _ = outgoing.reply.send(Err(e));
                            continue;
                        }
                    };

                    debug!(id, method = %outgoing.method, "sending request");
                    pending.insert(
                        id,
                        PendingRequest {
                            method: outgoing.method,
                            reply: outgoing.reply,
                        },
                    );

                    if let Err(e) = framed.send(line).await {
                        break SessionEnd::Failed(codec_error(e));
                    }
                }
                line = framed.next() => {
                    match line {
                        None => {
                            break SessionEnd::Failed(TransportError::Connection(
                                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed by peer"),
                            ));
                        }
                        Some(Err(e)) => break SessionEnd::Failed(codec_error(e)),
                        Some(Ok(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            if let Err(e) = self.dispatch(&line, &mut pending) {
                                warn!("Protocol error from {}: {}", self.connector.describe(), e);
                                break SessionEnd::Failed(e);
                            }
                        }
                    }
                }
            }
        };

        self.release(pending);
        end
    }

    /// Route one incoming line.
    fn dispatch(
        &mut self,
        line: &str,
        pending: &mut HashMap<u64, PendingRequest>,
    ) -> Result<(), TransportError> {
        match Incoming::parse(line)? {
            Incoming::Response { id, outcome } => match pending.remove(&id) {
                Some(request) => {
                    debug!(id, method = %request.method, "response received");
                    self.backoff.reset();
                    let result = outcome.map_err(|e| TransportError::Remote {
                        message: error_message(&e),
                    });
                    let _ = request.reply.send(result);
                }
                None => warn!(id, "response for unknown request id"),
            },
            Incoming::Notification { method, params } => {
                match NotificationMethod::from_method(&method) {
                    Some(method) => {
                        debug!(method = method.as_str(), "notification received");
                        let _ = self.notifications.send(Notification { method, params });
                    }
                    None => warn!(%method, "dropping unrecognized notification"),
                }
            }
        }
        Ok(())
    }

    /// Settle or abandon everything still waiting on a dead connection.
    fn release(&self, pending: HashMap<u64, PendingRequest>) {
        if pending.is_empty() {
            return;
        }
        match self.policy {
            DisconnectPolicy::Abandon => {
                warn!("Abandoning {} in-flight requests", pending.len());
            }
            DisconnectPolicy::Reject => {
                warn!("Rejecting {} in-flight requests", pending.len());
                for (_, request) in pending {
                    let _ = request.reply.send(Err(TransportError::ConnectionLost));
                }
            }
        }
    }

    /// Fail every call still queued for transmission.
    fn fail_queued(&mut self, err: impl Fn() -> TransportError) {
        self.outgoing.close();
        while let Ok(outgoing) = self.outgoing.try_recv() {
            let _ = outgoing.reply.send(Err(err()));
        }
    }
}

fn codec_error(err: LinesCodecError) -> TransportError {
    match err {
        LinesCodecError::Io(e) => TransportError::Connection(e),
        LinesCodecError::MaxLineLengthExceeded => {
            TransportError::Protocol("message exceeds maximum line length".to_string())
        }
    }
}
