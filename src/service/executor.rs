//! Service executors.

use std::future::Future;
use std::sync::Weak;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::correlation::Correlator;
use crate::protocol::{encode_payload, ErrorBody, ErrorCode, Message, MessageType, ServiceRequest, RELAY_ID};

/// Response body, or the error to report to the requester.
pub type ExecutionResult = Result<Vec<u8>, ErrorBody>;

/// Who asked for an execution.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Acting client id after authentication.
    pub client_id: String,
    /// The requester's connection.
    pub correlator: Weak<Correlator>,
}

/// Runs one request for a service.
pub trait Executor: Send + Sync {
    fn execute(&self, caller: Caller, request: ServiceRequest) -> BoxFuture<'static, ExecutionResult>;
}

type Handler = Box<dyn Fn(Caller, ServiceRequest) -> BoxFuture<'static, ExecutionResult> + Send + Sync>;

/// In-process handler.
pub struct LocalExecutor {
    handler: Handler,
}

impl LocalExecutor {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Caller, ServiceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutionResult> + Send + 'static,
    {
        Self {
            handler: Box::new(move |caller, request| handler(caller, request).boxed()),
        }
    }
}

impl Executor for LocalExecutor {
    fn execute(&self, caller: Caller, request: ServiceRequest) -> BoxFuture<'static, ExecutionResult> {
        (self.handler)(caller, request)
    }
}

/// Forwards requests to the peer hosting the service.
pub struct RemoteExecutor {
    owner: Weak<Correlator>,
    service_id: String,
}

impl RemoteExecutor {
    pub fn new(owner: Weak<Correlator>, service_id: impl Into<String>) -> Self {
        Self {
            owner,
            service_id: service_id.into(),
        }
    }
}

impl Executor for RemoteExecutor {
    fn execute(&self, caller: Caller, request: ServiceRequest) -> BoxFuture<'static, ExecutionResult> {
        let owner = self.owner.upgrade();
        let service_id = self.service_id.clone();

        async move {
            let Some(owner) = owner else {
                return Err(ErrorBody::new(
                    ErrorCode::Unavailable,
                    format!("host of {service_id} is gone"),
                ));
            };
            let payload = encode_payload(&request)
                .map_err(|e| ErrorBody::new(ErrorCode::Internal, e.to_string()))?;
            let forward = Message::new(
                Correlator::next_message_id(),
                RELAY_ID,
                owner.peer(),
                MessageType::Request,
                payload,
            );

            tracing::debug!(
                service = %service_id,
                client_id = %caller.client_id,
                host = %owner.peer(),
                message_id = %forward.id(),
                uri = %request.uri,
                "Forwarding to service host"
            );

            owner
                .request(forward)
                .await
                .map(|reply| reply.payload().to_vec())
                .map_err(|e| e.to_error_body())
        }
        .boxed()
    }
}
