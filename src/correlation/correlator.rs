//! Per-connection request/response correlation.
//!
//! # Responsibilities
//! - Serialize and send messages over the connection's [`DuplexChannel`]
//! - Turn a send into a blocking request that resolves with the reply
//!   carrying the same id, a timeout, or a connection failure
//! - Classify inbound frames as delivered replies, fresh requests, or noise
//!
//! # Design Decisions
//! - The one-shot listener is armed before the frame leaves, so a fast reply
//!   cannot overtake it
//! - Each request is a [`TrackedRequest`] in `Processing`: delivery resolves
//!   it, timeout and close kill it, and the first transition wins
//! - Bookkeeping is released on drop, so an abandoned request leaks nothing
//! - A reply nobody is waiting for is dropped; it is never treated as new work

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatch::{Completion, TrackedRequest};
use crate::net::{ConnectionId, DuplexChannel, TransportError};
use crate::observability::metrics;
use crate::protocol::{self, ErrorBody, ErrorCode, Message, MessageType};

use super::registry::{NotificationRegistry, Subscription};
use super::scheduler::{Scheduler, TimerHandle};

/// Failure observed by a caller of [`Correlator::request`] or [`Correlator::send`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("send failed: {0}")]
    Transport(#[from] TransportError),

    #[error("no response to {id} within {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error("invalid response to {id}: {reason}")]
    InvalidResponse { id: String, reason: String },

    #[error("peer replied with an error: {0}")]
    Remote(ErrorBody),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request {0} is already in flight on this connection")]
    DuplicateId(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl CorrelationError {
    /// Error body to report to a peer on whose behalf the request was made.
    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            CorrelationError::Remote(body) => body.clone(),
            CorrelationError::Timeout { .. } => ErrorBody::new(ErrorCode::Timeout, self.to_string()),
            CorrelationError::Transport(_) | CorrelationError::ConnectionClosed => {
                ErrorBody::new(ErrorCode::Unavailable, self.to_string())
            }
            _ => ErrorBody::new(ErrorCode::Internal, self.to_string()),
        }
    }
}

/// What the read loop should do with an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A listener consumed the frame.
    Delivered,
    /// Fresh work for the dispatcher.
    Request(Message),
    /// Nobody wanted it: a late reply or an undecodable frame.
    Discarded,
}

type SlotResult = Result<Message, CorrelationError>;

/// Caller-side lifecycle of one outbound request.
///
/// The reply resolves the underlying [`TrackedRequest`]. Timeout and close
/// kill it and leave the reason for the waiter.
struct ResponseSlot {
    tracked: TrackedRequest,
    failure: Mutex<Option<CorrelationError>>,
    timer: Mutex<Option<TimerHandle>>,
    scheduler: Arc<dyn Scheduler>,
}

impl ResponseSlot {
    fn new(message: Message, scheduler: Arc<dyn Scheduler>) -> Self {
        let tracked = TrackedRequest::new(message);
        // Nothing queues on the caller side: sent means processing.
        tracked.mark_admitted();
        let _ = tracked.start_processing();
        Self {
            tracked,
            failure: Mutex::new(None),
            timer: Mutex::new(None),
            scheduler,
        }
    }

    /// Finish with the peer's reply. Returns true for the winner.
    fn deliver(&self, reply: &Message) -> bool {
        if self.tracked.resolve(reply.clone()).is_err() {
            return false;
        }
        self.disarm();
        true
    }

    /// Finish with `error`. Returns true for the winner.
    fn fail(&self, error: CorrelationError) -> bool {
        // Held across the kill so a woken waiter always finds the reason.
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if self.tracked.kill().is_err() {
            return false;
        }
        *failure = Some(error);
        drop(failure);
        self.disarm();
        true
    }

    /// Attach the deadline timer, cancelling it at once if the slot already completed.
    fn arm(&self, timer: TimerHandle) {
        let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.tracked.is_terminal() {
            self.scheduler.cancel(&timer);
            return;
        }
        *slot = Some(timer);
    }

    fn disarm(&self) {
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(timer) = timer {
            self.scheduler.cancel(&timer);
        }
    }

    async fn outcome(&self) -> SlotResult {
        match self.tracked.wait().await {
            Ok(Completion::Finished(reply)) => reply_outcome(&reply),
            _ => Err(self
                .failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .unwrap_or(CorrelationError::ConnectionClosed)),
        }
    }
}

/// Releases a request's bookkeeping however its future ends.
struct PendingGuard<'a> {
    id: &'a str,
    pending: &'a DashMap<String, Arc<ResponseSlot>>,
    slot: Arc<ResponseSlot>,
    subscription: Subscription,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.subscription.dispose();
        self.pending
            .remove_if(self.id, |_, slot| Arc::ptr_eq(slot, &self.slot));
        self.slot.disarm();
    }
}

/// Request/response layer for one connection.
pub struct Correlator {
    connection_id: ConnectionId,
    peer: String,
    channel: Arc<dyn DuplexChannel>,
    registry: NotificationRegistry,
    scheduler: Arc<dyn Scheduler>,
    timeout: Duration,
    pending: DashMap<String, Arc<ResponseSlot>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("connection_id", &self.connection_id)
            .field("peer", &self.peer)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Correlator {
    pub fn new(
        connection_id: ConnectionId,
        peer: impl Into<String>,
        channel: Arc<dyn DuplexChannel>,
        scheduler: Arc<dyn Scheduler>,
        timeout: Duration,
    ) -> Self {
        Self {
            connection_id,
            peer: peer.into(),
            channel,
            registry: NotificationRegistry::new(),
            scheduler,
            timeout,
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Fresh id for a message originated by the relay.
    pub fn next_message_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Client id of the peer on the other end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Listener registry for this connection.
    pub fn registry(&self) -> &NotificationRegistry {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Serialize and write one message. No retries.
    pub fn send(&self, message: &Message) -> Result<(), CorrelationError> {
        if self.is_closed() {
            return Err(CorrelationError::ConnectionClosed);
        }
        let frame =
            protocol::encode(message).map_err(|e| CorrelationError::Encode(e.to_string()))?;
        self.channel.send(frame)?;
        Ok(())
    }

    /// Send `message` and wait for the reply with the same id.
    pub async fn request(&self, message: Message) -> Result<Message, CorrelationError> {
        self.request_with_timeout(message, self.timeout).await
    }

    /// Like [`request`](Self::request) with a deadline other than the connection default.
    pub async fn request_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, CorrelationError> {
        if self.is_closed() {
            return Err(CorrelationError::ConnectionClosed);
        }

        let id = message.id().to_string();
        let slot = Arc::new(ResponseSlot::new(message.clone(), Arc::clone(&self.scheduler)));

        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(CorrelationError::DuplicateId(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&slot));
            }
        }

        let delivery = Arc::clone(&slot);
        let subscription = self.registry.once(&id, move |reply| {
            delivery.deliver(reply);
        });
        let _guard = PendingGuard {
            id: &id,
            pending: &self.pending,
            slot: Arc::clone(&slot),
            subscription: subscription.clone(),
        };

        // close() may have drained `pending` between the first check and the insert.
        if self.is_closed() {
            return Err(CorrelationError::ConnectionClosed);
        }

        self.send(&message)?;

        let expiry = Arc::clone(&slot);
        let timeout_id = id.clone();
        let timer = self.scheduler.after(
            timeout,
            Box::new(move || {
                let err = CorrelationError::Timeout {
                    id: timeout_id,
                    timeout,
                };
                if expiry.fail(err) {
                    subscription.dispose();
                    metrics::record_correlation_timeout();
                }
            }),
        );
        slot.arm(timer);

        let result = slot.outcome().await;
        if let Err(e) = &result {
            debug!(
                connection_id = %self.connection_id,
                message_id = %id,
                error = %e,
                "Request failed"
            );
        }
        result
    }

    /// Route one inbound frame.
    pub fn handle_frame(&self, frame: &[u8]) -> Inbound {
        match protocol::decode(frame) {
            Ok(message) => {
                if self.registry.notify(message.id(), &message) > 0 {
                    return Inbound::Delivered;
                }
                if message.kind().is_reply() {
                    debug!(
                        connection_id = %self.connection_id,
                        message_id = %message.id(),
                        kind = %message.kind(),
                        "Discarding reply with no listener"
                    );
                    return Inbound::Discarded;
                }
                Inbound::Request(message)
            }
            Err(err) => {
                let waiting = protocol::peek_id(frame).and_then(|id| {
                    self.pending
                        .get(&id)
                        .map(|slot| (id.clone(), Arc::clone(slot.value())))
                });
                match waiting {
                    Some((id, slot)) => {
                        slot.fail(CorrelationError::InvalidResponse {
                            id,
                            reason: err.to_string(),
                        });
                        Inbound::Delivered
                    }
                    None => {
                        warn!(
                            connection_id = %self.connection_id,
                            error = %err,
                            "Discarding undecodable frame"
                        );
                        Inbound::Discarded
                    }
                }
            }
        }
    }

    /// Fail every pending request and drop every listener. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0usize;
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                if slot.fail(CorrelationError::ConnectionClosed) {
                    failed += 1;
                }
            }
        }
        let listeners = self.registry.clear();
        self.channel.close();

        info!(
            connection_id = %self.connection_id,
            client_id = %self.peer,
            failed_requests = failed,
            dropped_listeners = listeners,
            "Correlator closed"
        );
    }
}

fn reply_outcome(reply: &Message) -> SlotResult {
    match reply.kind() {
        MessageType::Response | MessageType::Pong => Ok(reply.clone()),
        MessageType::Error => match protocol::decode_payload::<ErrorBody>(reply.payload()) {
            Ok(body) => Err(CorrelationError::Remote(body)),
            Err(e) => Err(CorrelationError::InvalidResponse {
                id: reply.id().to_string(),
                reason: format!("unreadable error payload: {e}"),
            }),
        },
        other => Err(CorrelationError::InvalidResponse {
            id: reply.id().to_string(),
            reason: format!("expected a reply, got {other}"),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::correlation::TokioScheduler;

    /// Channel that records frames instead of writing them anywhere.
    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub frames: Mutex<Vec<Vec<u8>>>,
        pub fail_sends: AtomicBool,
        pub closed: AtomicBool,
    }

    impl RecordingChannel {
        pub fn sent(&self) -> Vec<Message> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| protocol::decode(f).unwrap())
                .collect()
        }
    }

    impl DuplexChannel for RecordingChannel {
        fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn correlator(timeout: Duration) -> (Arc<Correlator>, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::default());
        let correlator = Correlator::new(
            ConnectionId::new(),
            "peer",
            channel.clone(),
            Arc::new(TokioScheduler::new()),
            timeout,
        );
        (Arc::new(correlator), channel)
    }

    fn request(id: &str) -> Message {
        Message::new(id, "relay", "peer", MessageType::Request, b"ping".to_vec())
    }

    async fn wait_for_frames(channel: &RecordingChannel, count: usize) {
        while channel.frames.lock().unwrap().len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn round_trip_delivers_matching_response() {
        let (correlator, channel) = correlator(Duration::from_secs(30));
        let c = Arc::clone(&correlator);
        let pending = tokio::spawn(async move { c.request(request("r-1")).await });

        wait_for_frames(&channel, 1).await;
        let sent = channel.sent().remove(0);
        let reply = Message::response_to(&sent, "peer", b"pong".to_vec());
        let frame = protocol::encode(&reply).unwrap();

        assert_eq!(correlator.handle_frame(&frame), Inbound::Delivered);
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response, reply);
        assert_eq!(correlator.pending_count(), 0);
        assert!(correlator.registry().is_empty());

        // A duplicate reply after delivery finds nobody.
        assert_eq!(correlator.handle_frame(&frame), Inbound::Discarded);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_late_reply_is_discarded() {
        let (correlator, channel) = correlator(Duration::from_secs(5));

        let err = correlator.request(request("r-2")).await.unwrap_err();
        assert!(matches!(err, CorrelationError::Timeout { ref id, .. } if id == "r-2"));
        assert_eq!(correlator.pending_count(), 0);

        let sent = channel.sent().remove(0);
        let late = Message::response_to(&sent, "peer", vec![]);
        let frame = protocol::encode(&late).unwrap();
        assert_eq!(correlator.handle_frame(&frame), Inbound::Discarded);
        assert!(!correlator.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_response_cancels_timer() {
        let (correlator, channel) = correlator(Duration::from_secs(5));
        let c = Arc::clone(&correlator);
        let pending = tokio::spawn(async move { c.request(request("r-3")).await });

        wait_for_frames(&channel, 1).await;
        let reply = Message::response_to(&channel.sent()[0], "peer", vec![]);
        correlator.handle_frame(&protocol::encode(&reply).unwrap());
        assert!(pending.await.unwrap().is_ok());

        // Well past the deadline: nothing fires, nothing is pending.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_request_releases_its_id() {
        let (correlator, channel) = correlator(Duration::from_secs(5));

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), correlator.request(request("gone"))).await;
        assert!(abandoned.is_err());
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.registry().listener_count("gone"), 0);

        // Past the original deadline nothing fires and the id is free again.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let c = Arc::clone(&correlator);
        let retry = tokio::spawn(async move { c.request(request("gone")).await });
        wait_for_frames(&channel, 2).await;
        let reply = Message::response_to(&channel.sent()[1], "peer", b"ok".to_vec());
        assert_eq!(
            correlator.handle_frame(&protocol::encode(&reply).unwrap()),
            Inbound::Delivered
        );
        assert_eq!(retry.await.unwrap().unwrap(), reply);
        assert!(!correlator.is_closed());
    }

    #[tokio::test]
    async fn send_failure_returns_without_timer() {
        let (correlator, channel) = correlator(Duration::from_secs(30));
        channel.fail_sends.store(true, Ordering::SeqCst);

        let err = correlator.request(request("r-4")).await.unwrap_err();
        assert_eq!(err, CorrelationError::Transport(TransportError::Closed));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.registry().listener_count("r-4"), 0);
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        let (correlator, channel) = correlator(Duration::from_secs(30));
        let c = Arc::clone(&correlator);
        let pending = tokio::spawn(async move { c.request(request("r-5")).await });

        wait_for_frames(&channel, 1).await;
        correlator.close();
        correlator.close();

        assert_eq!(
            pending.await.unwrap().unwrap_err(),
            CorrelationError::ConnectionClosed
        );
        assert!(channel.closed.load(Ordering::SeqCst));
        assert_eq!(
            correlator.request(request("r-6")).await.unwrap_err(),
            CorrelationError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn responses_correlate_out_of_order() {
        let (correlator, channel) = correlator(Duration::from_secs(30));
        let (c1, c2) = (Arc::clone(&correlator), Arc::clone(&correlator));
        let first = tokio::spawn(async move { c1.request(request("a")).await });
        let second = tokio::spawn(async move { c2.request(request("b")).await });

        wait_for_frames(&channel, 2).await;
        for id in ["b", "a"] {
            let reply = Message::new(id, "peer", "relay", MessageType::Response, id.as_bytes().to_vec());
            assert_eq!(
                correlator.handle_frame(&protocol::encode(&reply).unwrap()),
                Inbound::Delivered
            );
        }

        assert_eq!(first.await.unwrap().unwrap().payload(), b"a");
        assert_eq!(second.await.unwrap().unwrap().payload(), b"b");
    }

    #[tokio::test]
    async fn error_reply_surfaces_as_remote_error() {
        let (correlator, channel) = correlator(Duration::from_secs(30));
        let c = Arc::clone(&correlator);
        let pending = tokio::spawn(async move { c.request(request("r-7")).await });

        wait_for_frames(&channel, 1).await;
        let body = ErrorBody::new(ErrorCode::NotFound, "no such thing");
        let reply = Message::error_to(&channel.sent()[0], "peer", &body);
        correlator.handle_frame(&protocol::encode(&reply).unwrap());

        assert_eq!(
            pending.await.unwrap().unwrap_err(),
            CorrelationError::Remote(body)
        );
    }

    #[tokio::test]
    async fn malformed_reply_fails_the_request() {
        let (correlator, channel) = correlator(Duration::from_secs(30));
        let c = Arc::clone(&correlator);
        let pending = tokio::spawn(async move { c.request(request("r-8")).await });

        wait_for_frames(&channel, 1).await;
        let frame = br#"{"id":"r-8","type":42}"#;
        assert_eq!(correlator.handle_frame(frame), Inbound::Delivered);

        assert!(matches!(
            pending.await.unwrap().unwrap_err(),
            CorrelationError::InvalidResponse { .. }
        ));
    }

    #[tokio::test]
    async fn fresh_request_goes_to_dispatch() {
        let (correlator, _) = correlator(Duration::from_secs(30));
        let incoming = request("x-1");

        assert_eq!(
            correlator.handle_frame(&protocol::encode(&incoming).unwrap()),
            Inbound::Request(incoming)
        );
        assert_eq!(correlator.handle_frame(b"not json"), Inbound::Discarded);
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected() {
        let (correlator, channel) = correlator(Duration::from_secs(30));
        let c = Arc::clone(&correlator);
        let _first = tokio::spawn(async move { c.request(request("dup")).await });

        wait_for_frames(&channel, 1).await;
        assert_eq!(
            correlator.request(request("dup")).await.unwrap_err(),
            CorrelationError::DuplicateId("dup".into())
        );
    }
}
