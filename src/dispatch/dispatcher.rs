//! Routing of fresh inbound requests to services.

use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::correlation::Correlator;
use crate::net::{ConnectionId, ConnectionInfo};
use crate::observability::metrics;
use crate::pipeline::{keys, IncomingRequest, Pipeline};
use crate::protocol::{decode_payload, ErrorBody, ErrorCode, Message, MessageType, ServiceRequest, RELAY_ID};
use crate::routing::RoutingError;
use crate::service::{AccessType, Caller, ExecutionType, QueueError, RegistryError, ServiceRegistry};

use super::tracked::{Completion, RequestStatus, TrackedRequest};

/// Dispatch failures reported back to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no service routes {0}")]
    NoRoute(String),

    #[error("service {0} is at capacity")]
    QueueFull(String),

    #[error("service {0} is not accepting work")]
    Unavailable(String),

    #[error("service {0} is internal")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request was cancelled")]
    Cancelled,
}

impl DispatchError {
    pub fn to_error_body(&self) -> ErrorBody {
        let code = match self {
            DispatchError::NoRoute(_) => ErrorCode::NotFound,
            DispatchError::QueueFull(_) => ErrorCode::TooManyRequests,
            DispatchError::Unavailable(_) => ErrorCode::Unavailable,
            DispatchError::Forbidden(_) => ErrorCode::Forbidden,
            DispatchError::BadRequest(_) => ErrorCode::BadRequest,
            DispatchError::Cancelled => ErrorCode::Cancelled,
        };
        ErrorBody::new(code, self.to_string())
    }

    fn label(&self) -> &'static str {
        match self {
            DispatchError::NoRoute(_) => "no_route",
            DispatchError::QueueFull(_) => "queue_full",
            DispatchError::Unavailable(_) => "unavailable",
            DispatchError::Forbidden(_) => "forbidden",
            DispatchError::BadRequest(_) => "bad_request",
            DispatchError::Cancelled => "cancelled",
        }
    }
}

/// What the connection should do after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send this message back now.
    Reply(Message),
    /// The reply will be sent through the requester's Correlator later.
    Deferred,
    /// Nothing to send (notifications, stray replies).
    NoReply,
}

pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    registry: Arc<ServiceRegistry>,
    /// Admitted work per requesting connection.
    inflight: DashMap<ConnectionId, Vec<Weak<TrackedRequest>>>,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<Pipeline>, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            pipeline,
            registry,
            inflight: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Handle one fresh message from `connection`. Never fails: every error
    /// becomes an error reply for requests, or a log line for notifications.
    pub async fn dispatch(
        &self,
        connection: &ConnectionInfo,
        correlator: &Arc<Correlator>,
        message: Message,
    ) -> Outcome {
        let start = Instant::now();
        let kind = message.kind();

        let outcome = match kind {
            MessageType::Ping => Ok(Outcome::Reply(Message::pong_to(&message, RELAY_ID))),
            MessageType::Request | MessageType::Notification => {
                self.route(connection, correlator, &message).await
            }
            MessageType::Response | MessageType::Error | MessageType::Pong => {
                debug!(message_id = %message.id(), kind = %kind, "Stray reply ignored");
                Ok(Outcome::NoReply)
            }
        };

        let label = kind.to_string();
        match outcome {
            Ok(outcome) => {
                let result = match &outcome {
                    Outcome::Reply(reply) if reply.kind() == MessageType::Error => "rejected",
                    Outcome::Deferred => "deferred",
                    _ => "ok",
                };
                metrics::record_request(&label, result, start);
                outcome
            }
            Err(error) => {
                metrics::record_request(&label, error.label(), start);
                debug!(
                    connection_id = %connection.id,
                    message_id = %message.id(),
                    error = %error,
                    "Dispatch failed"
                );
                if kind == MessageType::Notification {
                    Outcome::NoReply
                } else {
                    Outcome::Reply(Message::error_to(&message, RELAY_ID, &error.to_error_body()))
                }
            }
        }
    }

    /// Fail everything `connection` still has queued or executing: queued
    /// work is cancelled, running work killed. Returns how many were hit.
    pub fn abandon_connection(&self, connection: ConnectionId) -> usize {
        let Some((_, requests)) = self.inflight.remove(&connection) else {
            return 0;
        };
        let abandoned = requests
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|tracked| abandon(tracked))
            .count();
        if abandoned > 0 {
            debug!(connection_id = %connection, abandoned, "Requester gone, work abandoned");
        }
        abandoned
    }

    fn track(&self, connection: ConnectionId, correlator: &Correlator, tracked: &Arc<TrackedRequest>) {
        {
            let mut requests = self.inflight.entry(connection).or_default();
            requests.retain(|weak| weak.upgrade().is_some_and(|t| !t.is_terminal()));
            requests.push(Arc::downgrade(tracked));
        }
        // Teardown may already have swept this connection.
        if correlator.is_closed() {
            self.abandon_connection(connection);
        }
    }

    async fn route(
        &self,
        connection: &ConnectionInfo,
        correlator: &Arc<Correlator>,
        message: &Message,
    ) -> Result<Outcome, DispatchError> {
        let request: ServiceRequest = decode_payload(message.payload())
            .map_err(|e| DispatchError::BadRequest(e.to_string()))?;

        let incoming = self
            .pipeline
            .run(connection, IncomingRequest::new(message.clone(), request));
        if incoming.is_resolved() {
            return Ok(match (message.kind(), incoming.resolution()) {
                (MessageType::Request, Some(reply)) => Outcome::Reply(reply),
                _ => Outcome::NoReply,
            });
        }

        let matched = self
            .registry
            .find_service_by_uri(incoming.uri())
            .map_err(|e| match e {
                RegistryError::Routing(RoutingError::MalformedQuery { pair }) => {
                    DispatchError::BadRequest(format!("malformed query pair {pair:?}"))
                }
                _ => DispatchError::NoRoute(incoming.uri().to_string()),
            })?;
        let service = matched.value;

        if service.access() == AccessType::Internal && !incoming.context().flag(keys::INTERNAL) {
            warn!(
                connection_id = %connection.id,
                client_id = %connection.client_id,
                service = %service.id(),
                "External caller refused by internal service"
            );
            return Err(DispatchError::Forbidden(service.id().to_string()));
        }
        if !service.is_accepting() {
            return Err(DispatchError::Unavailable(service.id().to_string()));
        }

        let caller = Caller {
            client_id: incoming
                .context()
                .get_str(keys::CLIENT_ID)
                .unwrap_or(connection.client_id.as_str())
                .to_string(),
            correlator: Arc::downgrade(correlator),
        };
        let mut request = incoming.into_service_request();
        request.params = matched.params;
        request.query = matched.query;

        let notification = message.kind() == MessageType::Notification;
        let deferred = notification || service.execution() == ExecutionType::Async;
        let tracked = if deferred && !notification {
            Arc::new(deliver_later(message.clone(), Arc::downgrade(correlator)))
        } else {
            Arc::new(TrackedRequest::new(message.clone()))
        };

        service
            .admit(Arc::clone(&tracked), caller, request)
            .await
            .map_err(|e| match e {
                QueueError::Full => {
                    metrics::record_queue_rejection(service.id());
                    DispatchError::QueueFull(service.id().to_string())
                }
                QueueError::Closed => DispatchError::Unavailable(service.id().to_string()),
            })?;
        self.track(connection.id, correlator, &tracked);

        if notification {
            return Ok(Outcome::NoReply);
        }
        if deferred {
            return Ok(Outcome::Deferred);
        }

        match tracked.wait().await {
            Ok(Completion::Finished(reply)) => Ok(Outcome::Reply(reply)),
            Ok(Completion::Dead) => Err(DispatchError::Unavailable(service.id().to_string())),
            Ok(Completion::Cancelled) => Err(DispatchError::Cancelled),
            Err(e) => {
                warn!(message_id = %message.id(), error = %e, "Wait on admitted request failed");
                Err(DispatchError::Unavailable(service.id().to_string()))
            }
        }
    }
}

fn abandon(tracked: &TrackedRequest) -> bool {
    match tracked.status() {
        // Lost a race with the pump: it is running now.
        RequestStatus::Queued => tracked.cancel().is_ok() || tracked.kill().is_ok(),
        RequestStatus::Processing => tracked.kill().is_ok(),
        _ => false,
    }
}

/// A tracked request whose terminal state is pushed to the requester.
fn deliver_later(message: Message, requester: Weak<Correlator>) -> TrackedRequest {
    TrackedRequest::new(message).with_status_callback(move |tracked, status| {
        let reply = match status {
            RequestStatus::Finished => tracked.result(),
            RequestStatus::Dead => Some(Message::error_to(
                tracked.message(),
                RELAY_ID,
                &ErrorBody::new(ErrorCode::Unavailable, "service died before replying"),
            )),
            // Refused admissions are answered by dispatch; abandoned ones have nobody to answer.
            RequestStatus::Cancelled | RequestStatus::Queued | RequestStatus::Processing => None,
        };
        let (Some(reply), Some(requester)) = (reply, requester.upgrade()) else {
            return;
        };
        if let Err(e) = requester.send(&reply) {
            debug!(message_id = %reply.id(), error = %e, "Deferred reply not delivered");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::correlator::tests::RecordingChannel;
    use crate::correlation::TokioScheduler;
    use crate::net::ConnectionId;
    use crate::protocol::encode_payload;
    use crate::service::{
        AdmissionPolicy, Executor, LocalExecutor, QueueSettings, RegistrySettings,
        ServiceDescriptor, ServiceKind, WorkerPool,
    };
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Harness {
        dispatcher: Dispatcher,
        connection: ConnectionInfo,
        correlator: Arc<Correlator>,
        channel: Arc<RecordingChannel>,
    }

    fn harness(pipeline: Pipeline, peer_ip: &str) -> Harness {
        let registry = Arc::new(ServiceRegistry::new(
            RegistrySettings {
                max_per_client: 4,
                queue: QueueSettings {
                    capacity: 4,
                    policy: AdmissionPolicy::FailFast,
                },
                compaction_threshold: 4,
            },
            WorkerPool::new(2),
        ));
        let connection = ConnectionInfo::new(
            ConnectionId::new(),
            "bob",
            format!("{peer_ip}:5000").parse().unwrap(),
            None,
        );
        let channel = Arc::new(RecordingChannel::default());
        let correlator = Arc::new(Correlator::new(
            connection.id,
            "bob",
            channel.clone(),
            Arc::new(TokioScheduler::new()),
            Duration::from_secs(5),
        ));
        Harness {
            dispatcher: Dispatcher::new(Arc::new(pipeline), registry),
            connection,
            correlator,
            channel,
        }
    }

    fn upper() -> Arc<dyn Executor> {
        Arc::new(LocalExecutor::new(|_, req: ServiceRequest| async move {
            let id = req.params.get("id").cloned().unwrap_or_default();
            Ok(format!("{}:{id}", String::from_utf8_lossy(&req.body).to_uppercase()).into_bytes())
        }))
    }

    fn host(h: &Harness, descriptor: ServiceDescriptor) {
        h.dispatcher
            .registry()
            .register_service(descriptor.kind(ServiceKind::Local), upper())
            .unwrap();
    }

    fn request(id: &str, kind: MessageType, uri: &str, body: &[u8]) -> Message {
        let payload = encode_payload(&ServiceRequest::new(uri, body.to_vec())).unwrap();
        Message::new(id, "bob", RELAY_ID, kind, payload)
    }

    fn error_code(reply: &Message) -> ErrorCode {
        assert_eq!(reply.kind(), MessageType::Error);
        decode_payload::<ErrorBody>(reply.payload()).unwrap().code
    }

    impl Harness {
        async fn dispatch(&self, message: Message) -> Outcome {
            self.dispatcher
                .dispatch(&self.connection, &self.correlator, message)
                .await
        }
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let h = harness(Pipeline::default(), "10.0.0.1");
        let ping = Message::new("p", "bob", RELAY_ID, MessageType::Ping, vec![]);
        let Outcome::Reply(pong) = h.dispatch(ping).await else {
            panic!("expected pong");
        };
        assert_eq!(pong.kind(), MessageType::Pong);
        assert_eq!(pong.id(), "p");
    }

    #[tokio::test]
    async fn sync_service_replies_directly() {
        let h = harness(Pipeline::default(), "10.0.0.1");
        host(&h, ServiceDescriptor::new("up", "alice", vec!["/items/:id".into()]));

        let out = h
            .dispatch(request("r1", MessageType::Request, "/alice/up/items/7", b"abc"))
            .await;
        let Outcome::Reply(reply) = out else {
            panic!("expected a reply, got {out:?}");
        };
        assert_eq!(reply.id(), "r1");
        assert_eq!(reply.to(), "bob");
        assert_eq!(reply.payload(), b"ABC:7");
    }

    #[tokio::test]
    async fn async_service_replies_through_correlator() {
        let h = harness(Pipeline::default(), "10.0.0.1");
        host(
            &h,
            ServiceDescriptor::new("up", "alice", vec!["".into()]).execution(ExecutionType::Async),
        );

        let out = h.dispatch(request("r2", MessageType::Request, "/alice/up", b"x")).await;
        assert_eq!(out, Outcome::Deferred);

        while h.channel.frames.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        let sent = h.channel.sent();
        assert_eq!(sent[0].id(), "r2");
        assert_eq!(sent[0].kind(), MessageType::Response);
        assert_eq!(sent[0].payload(), b"X:");
    }

    #[tokio::test]
    async fn unknown_uri_is_not_found() {
        let h = harness(Pipeline::default(), "10.0.0.1");
        let Outcome::Reply(reply) = h.dispatch(request("r3", MessageType::Request, "/nobody/here", b"")).await else {
            panic!("expected error reply");
        };
        assert_eq!(reply.id(), "r3");
        assert_eq!(error_code(&reply), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn undecodable_payload_is_bad_request() {
        let h = harness(Pipeline::default(), "10.0.0.1");
        let msg = Message::new("r4", "bob", RELAY_ID, MessageType::Request, b"{".to_vec());
        let Outcome::Reply(reply) = h.dispatch(msg).await else {
            panic!("expected error reply");
        };
        assert_eq!(error_code(&reply), ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn internal_service_requires_internal_connection() {
        let layer = crate::security::SecurityLayer::from_config(&crate::config::RelayConfig::default());
        let external = harness(layer.pipeline(), "203.0.113.5");
        host(
            &external,
            ServiceDescriptor::new("admin", "alice", vec!["".into()]).access(AccessType::Internal),
        );
        let Outcome::Reply(reply) = external
            .dispatch(request("r5", MessageType::Request, "/alice/admin", b""))
            .await
        else {
            panic!("expected error reply");
        };
        assert_eq!(error_code(&reply), ErrorCode::Forbidden);

        let internal = harness(layer.pipeline(), "127.0.0.1");
        host(
            &internal,
            ServiceDescriptor::new("admin", "alice", vec!["".into()]).access(AccessType::Internal),
        );
        let Outcome::Reply(reply) = internal
            .dispatch(request("r6", MessageType::Request, "/alice/admin", b"ok"))
            .await
        else {
            panic!("expected reply");
        };
        assert_eq!(reply.kind(), MessageType::Response);
    }

    #[tokio::test]
    async fn pipeline_rejection_short_circuits() {
        let pipeline = Pipeline::builder()
            .register(
                "deny",
                1,
                Arc::new(|_: &ConnectionInfo, mut req: IncomingRequest| {
                    req.reject(ErrorCode::Unauthorized, "nope");
                    req
                }),
            )
            .build();
        let h = harness(pipeline, "10.0.0.1");
        host(&h, ServiceDescriptor::new("up", "alice", vec!["".into()]));

        let Outcome::Reply(reply) = h.dispatch(request("r7", MessageType::Request, "/alice/up", b"")).await else {
            panic!("expected error reply");
        };
        assert_eq!(error_code(&reply), ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn notifications_never_reply() {
        let h = harness(Pipeline::default(), "10.0.0.1");
        host(&h, ServiceDescriptor::new("up", "alice", vec!["".into()]));

        assert_eq!(
            h.dispatch(request("n1", MessageType::Notification, "/alice/up", b"")).await,
            Outcome::NoReply
        );
        assert_eq!(
            h.dispatch(request("n2", MessageType::Notification, "/missing", b"")).await,
            Outcome::NoReply
        );
    }

    #[tokio::test]
    async fn disconnect_abandons_the_requesters_work() {
        let h = harness(Pipeline::default(), "10.0.0.1");
        let gate = Arc::new(Notify::new());
        let parked = Arc::clone(&gate);
        let slow: Arc<dyn Executor> = Arc::new(LocalExecutor::new(move |_, _| {
            let gate = Arc::clone(&parked);
            async move {
                gate.notified().await;
                Ok(Vec::new())
            }
        }));
        h.dispatcher
            .registry()
            .register_service(
                ServiceDescriptor::new("slow", "alice", vec!["".into()])
                    .kind(ServiceKind::Local)
                    .execution(ExecutionType::Async),
                slow,
            )
            .unwrap();

        // Two workers: two requests run, the third waits in the queue.
        for i in 0..3 {
            let out = h
                .dispatch(request(&format!("a{i}"), MessageType::Request, "/alice/slow", b""))
                .await;
            assert_eq!(out, Outcome::Deferred);
        }
        let tracked: Vec<Arc<TrackedRequest>> = h
            .dispatcher
            .inflight
            .get(&h.connection.id)
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        assert_eq!(tracked.len(), 3);
        while tracked.iter().filter(|t| t.status() == RequestStatus::Processing).count() < 2 {
            tokio::task::yield_now().await;
        }

        h.correlator.close();
        assert_eq!(h.dispatcher.abandon_connection(h.connection.id), 3);
        let count = |status: RequestStatus| tracked.iter().filter(|t| t.status() == status).count();
        assert_eq!(count(RequestStatus::Dead), 2);
        assert_eq!(count(RequestStatus::Cancelled), 1);
        assert!(h.channel.sent().is_empty());

        gate.notify_waiters();
        assert_eq!(h.dispatcher.abandon_connection(h.connection.id), 0);
    }

    #[tokio::test]
    async fn work_admitted_after_disconnect_is_abandoned() {
        let h = harness(Pipeline::default(), "10.0.0.1");
        let gate = Arc::new(Notify::new());
        let parked = Arc::clone(&gate);
        let slow: Arc<dyn Executor> = Arc::new(LocalExecutor::new(move |_, _| {
            let gate = Arc::clone(&parked);
            async move {
                gate.notified().await;
                Ok(Vec::new())
            }
        }));
        h.dispatcher
            .registry()
            .register_service(
                ServiceDescriptor::new("slow", "alice", vec!["".into()])
                    .kind(ServiceKind::Local)
                    .execution(ExecutionType::Async),
                slow,
            )
            .unwrap();

        h.correlator.close();
        let out = h.dispatch(request("late", MessageType::Request, "/alice/slow", b"")).await;
        assert_eq!(out, Outcome::Deferred);
        assert!(h.dispatcher.inflight.get(&h.connection.id).is_none());
        gate.notify_waiters();
    }

    #[tokio::test]
    async fn dead_service_is_unavailable() {
        let h = harness(Pipeline::default(), "10.0.0.1");
        host(&h, ServiceDescriptor::new("up", "alice", vec!["".into()]));
        let service = h.dispatcher.registry().get("alice", "up").unwrap();
        service.kill();

        // Routes are still in the table until the registry detaches them.
        let Outcome::Reply(reply) = h.dispatch(request("r8", MessageType::Request, "/alice/up", b"")).await else {
            panic!("expected error reply");
        };
        assert_eq!(error_code(&reply), ErrorCode::Unavailable);
    }
}
