//! Per-connection state: pending call correlation and the outbound queue.
//!
//! One [`AgentConnection`] exists per live agent. All mutation of its
//! pending maps goes through plain mutexes whose guards never cross an
//! await point, so "timeout fires" and "response arrives" for the same
//! request id cannot interleave mid-update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use flotilla_protocol::{EngineRequest, EngineResponse, Envelope, StdStream, StreamChunk};

use super::TunnelError;
use crate::environment::AgentIdentity;

/// Lifecycle of one connection instance. `Replaced` and `Closed` are
/// terminal; a new instance may immediately become `Active` for the
/// same environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Replaced,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticated => write!(f, "authenticated"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Replaced => write!(f, "replaced"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// One event on a streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A data chunk, in arrival order.
    Data {
        data: String,
        substream: Option<StdStream>,
    },
    /// Stream terminator. Delivered at most once per stream.
    End { reason: String },
}

/// Caller-side handle to a streaming call.
///
/// Events arrive through [`StreamHandle::recv`]. [`StreamHandle::cancel`]
/// is idempotent: the first call removes the pending entry and notifies
/// the remote agent; later calls (or a cancel racing a natural
/// `stream_end`) are no-ops.
pub struct StreamHandle {
    request_id: Uuid,
    events: mpsc::Receiver<StreamEvent>,
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamHandle {
    pub(crate) fn new(
        request_id: Uuid,
        events: mpsc::Receiver<StreamEvent>,
        canceller: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            request_id,
            events,
            canceller: Some(canceller),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Next event, or `None` once the stream is cancelled and drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Stop the stream. Safe to call any number of times, before or
    /// after the terminal event.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.canceller.take() {
            cancel();
        }
    }

    /// Surrender the event receiver, e.g. to feed an HTTP response body.
    /// Cleanup then relies on receiver-drop detection: once the receiver
    /// is gone the next delivered chunk cancels the remote stream.
    pub fn into_events(mut self) -> mpsc::Receiver<StreamEvent> {
        self.canceller = None;
        let (_, empty) = mpsc::channel(1);
        std::mem::replace(&mut self.events, empty)
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// State for one live agent connection.
pub struct AgentConnection {
    /// Environment this agent authenticated for.
    pub environment_id: String,
    /// Identity presented in the hello envelope.
    pub identity: AgentIdentity,
    pub connected_at: DateTime<Utc>,
    state: Mutex<ConnectionState>,
    last_heartbeat: Mutex<DateTime<Utc>>,
    /// Outbound envelope queue. `None` once the connection is closed;
    /// the socket task drains the receiving end.
    outbound: Mutex<Option<mpsc::Sender<Envelope>>>,
    pending_unary: Mutex<HashMap<Uuid, oneshot::Sender<Result<EngineResponse, TunnelError>>>>,
    pending_streams: Mutex<HashMap<Uuid, mpsc::Sender<StreamEvent>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentConnection {
    pub fn new(
        environment_id: String,
        identity: AgentIdentity,
        outbound: mpsc::Sender<Envelope>,
    ) -> Self {
        let now = Utc::now();
        Self {
            environment_id,
            identity,
            connected_at: now,
            state: Mutex::new(ConnectionState::Connecting),
            last_heartbeat: Mutex::new(now),
            outbound: Mutex::new(Some(outbound)),
            pending_unary: Mutex::new(HashMap::new()),
            pending_streams: Mutex::new(HashMap::new()),
            heartbeat_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state lock poisoned")
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("connection state lock poisoned") = state;
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self
            .last_heartbeat
            .lock()
            .expect("heartbeat lock poisoned")
    }

    /// Record liveness. Any inbound ping or pong counts.
    pub fn touch_heartbeat(&self) {
        *self
            .last_heartbeat
            .lock()
            .expect("heartbeat lock poisoned") = Utc::now();
    }

    /// Queue an envelope for the socket task.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<(), TunnelError> {
        let tx = self
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .clone();
        let Some(tx) = tx else {
            return Err(TunnelError::ConnectionClosed);
        };
        tx.send(envelope)
            .await
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    /// Non-blocking variant for teardown and cancellation paths.
    pub fn try_send_envelope(&self, envelope: Envelope) -> Result<(), TunnelError> {
        let tx = self
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .clone();
        let Some(tx) = tx else {
            return Err(TunnelError::ConnectionClosed);
        };
        tx.try_send(envelope)
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    /// Drop the outbound sender. The socket task sees the queue close
    /// and shuts the transport down, which drives `unregister`.
    pub fn close_outbound(&self) {
        self.outbound
            .lock()
            .expect("outbound lock poisoned")
            .take();
    }

    pub(crate) fn set_heartbeat_task(&self, task: JoinHandle<()>) {
        let mut slot = self
            .heartbeat_task
            .lock()
            .expect("heartbeat task lock poisoned");
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    pub(crate) fn abort_heartbeat(&self) {
        if let Some(task) = self
            .heartbeat_task
            .lock()
            .expect("heartbeat task lock poisoned")
            .take()
        {
            task.abort();
        }
    }

    /// Issue a unary engine call and wait for its correlated response.
    ///
    /// The pending entry is removed on every exit path: response,
    /// timeout, send failure, or connection teardown.
    pub async fn request(
        &self,
        request: EngineRequest,
        timeout: Duration,
    ) -> Result<EngineResponse, TunnelError> {
        let request_id = request.request_id;
        let (tx, mut rx) = oneshot::channel();
        self.pending_unary
            .lock()
            .expect("pending unary lock poisoned")
            .insert(request_id, tx);

        if let Err(e) = self.send_envelope(Envelope::Request(request)).await {
            self.pending_unary
                .lock()
                .expect("pending unary lock poisoned")
                .remove(&request_id);
            // Teardown may have raced the send and already delivered the
            // terminal outcome through the oneshot.
            return match rx.try_recv() {
                Ok(outcome) => outcome,
                Err(_) => Err(e),
            };
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without a verdict: the connection died in a
            // way that bypassed normal teardown.
            Ok(Err(_)) => Err(TunnelError::ConnectionClosed),
            Err(_) => {
                let timed_out = self
                    .pending_unary
                    .lock()
                    .expect("pending unary lock poisoned")
                    .remove(&request_id)
                    .is_some();
                if timed_out {
                    Err(TunnelError::RequestTimeout)
                } else {
                    // The response won the race against the timer; it is
                    // already sitting in the channel.
                    match rx.try_recv() {
                        Ok(outcome) => outcome,
                        Err(_) => Err(TunnelError::ConnectionClosed),
                    }
                }
            }
        }
    }

    /// Deliver a `response` envelope to its waiting caller.
    pub fn resolve_response(&self, response: EngineResponse) {
        let entry = self
            .pending_unary
            .lock()
            .expect("pending unary lock poisoned")
            .remove(&response.request_id);
        match entry {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => {
                // Race between completion and a stray retransmit.
                warn!(
                    "Dropping response for unknown request {} on environment {}",
                    response.request_id, self.environment_id
                );
            }
        }
    }

    /// Issue a streaming engine call. Chunks and the terminator arrive
    /// on the returned handle.
    pub async fn open_stream(
        self: &Arc<Self>,
        request: EngineRequest,
        buffer: usize,
    ) -> Result<StreamHandle, TunnelError> {
        let request_id = request.request_id;
        let (tx, rx) = mpsc::channel(buffer);
        self.pending_streams
            .lock()
            .expect("pending stream lock poisoned")
            .insert(request_id, tx);

        if let Err(e) = self.send_envelope(Envelope::Request(request)).await {
            self.pending_streams
                .lock()
                .expect("pending stream lock poisoned")
                .remove(&request_id);
            return Err(e);
        }

        let conn = Arc::clone(self);
        Ok(StreamHandle::new(
            request_id,
            rx,
            Box::new(move || {
                conn.cancel_stream(request_id);
            }),
        ))
    }

    /// Deliver one `stream` envelope chunk.
    pub fn deliver_stream_chunk(&self, chunk: StreamChunk) {
        let request_id = chunk.request_id;
        let tx = self
            .pending_streams
            .lock()
            .expect("pending stream lock poisoned")
            .get(&request_id)
            .cloned();
        let Some(tx) = tx else {
            debug!(
                "Dropping chunk for unknown stream {} on environment {}",
                request_id, self.environment_id
            );
            return;
        };

        let event = StreamEvent::Data {
            data: chunk.data,
            substream: chunk.stream,
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                // Consumer dropped the handle; stop the remote producer.
                self.cancel_stream(request_id);
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Stream {} consumer lagging on environment {}, terminating",
                    request_id, self.environment_id
                );
                self.finish_stream(request_id, "stream consumer lagged".to_string());
                let _ = self.try_send_envelope(Envelope::StreamCancel { request_id });
            }
        }
    }

    /// Deliver the `stream_end` terminator.
    pub fn end_stream(&self, request_id: Uuid, reason: String) {
        if !self.finish_stream(request_id, reason) {
            debug!(
                "Dropping stream_end for unknown stream {} on environment {}",
                request_id, self.environment_id
            );
        }
    }

    /// Remove the pending entry and deliver exactly one `End` event.
    /// Returns false if the entry was already gone (ended or cancelled).
    fn finish_stream(&self, request_id: Uuid, reason: String) -> bool {
        let entry = self
            .pending_streams
            .lock()
            .expect("pending stream lock poisoned")
            .remove(&request_id);
        match entry {
            Some(tx) => {
                // Chunks already queued keep their order; the channel is
                // FIFO and nothing else holds a sender.
                tokio::spawn(async move {
                    let _ = tx.send(StreamEvent::End { reason }).await;
                });
                true
            }
            None => false,
        }
    }

    /// Caller-initiated cancellation. Removes the entry and tells the
    /// agent to stop producing. Idempotent.
    pub fn cancel_stream(&self, request_id: Uuid) -> bool {
        let removed = self
            .pending_streams
            .lock()
            .expect("pending stream lock poisoned")
            .remove(&request_id)
            .is_some();
        if removed && self.try_send_envelope(Envelope::StreamCancel { request_id }).is_err() {
            debug!(
                "Connection gone while cancelling stream {} on environment {}",
                request_id, self.environment_id
            );
        }
        removed
    }

    /// Fail every pending call. Used on replacement and close; each
    /// entry gets exactly one terminal outcome.
    pub fn fail_pending(&self, error: TunnelError, stream_reason: &str) {
        let unary: Vec<_> = self
            .pending_unary
            .lock()
            .expect("pending unary lock poisoned")
            .drain()
            .collect();
        for (_, tx) in unary {
            let _ = tx.send(Err(error.clone()));
        }

        let streams: Vec<_> = self
            .pending_streams
            .lock()
            .expect("pending stream lock poisoned")
            .drain()
            .collect();
        for (_, tx) in streams {
            let reason = stream_reason.to_string();
            tokio::spawn(async move {
                let _ = tx.send(StreamEvent::End { reason }).await;
            });
        }
    }

    /// Number of in-flight unary calls. Used by tests and diagnostics.
    pub fn pending_unary_len(&self) -> usize {
        self.pending_unary
            .lock()
            .expect("pending unary lock poisoned")
            .len()
    }

    /// Number of in-flight streams. Used by tests and diagnostics.
    pub fn pending_stream_len(&self) -> usize {
        self.pending_streams
            .lock()
            .expect("pending stream lock poisoned")
            .len()
    }
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("environment_id", &self.environment_id)
            .field("state", &self.state())
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}
