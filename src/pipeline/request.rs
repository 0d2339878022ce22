//! The request as seen by middleware.

use std::sync::Arc;

use crate::dispatch::{RequestStatus, TrackedRequest};
use crate::protocol::{ErrorBody, ErrorCode, Message, ServiceRequest, RELAY_ID};

use super::context::ContextBag;

/// An inbound request travelling through the pipeline.
///
/// Backed by a [`TrackedRequest`] in `Processing`. Resolving it (see
/// [`reject`](Self::reject) and [`respond`](Self::respond)) takes it out of
/// `Processing` and halts the pipeline.
#[derive(Debug)]
pub struct IncomingRequest {
    tracked: Arc<TrackedRequest>,
    request: ServiceRequest,
    context: ContextBag,
}

impl IncomingRequest {
    /// Wrap `message`, moving its tracked state to `Processing`.
    pub fn new(message: Message, request: ServiceRequest) -> Self {
        let tracked = Arc::new(TrackedRequest::new(message));
        // A fresh TrackedRequest is always Queued.
        let _ = tracked.start_processing();
        Self {
            tracked,
            request,
            context: ContextBag::new(),
        }
    }

    pub fn message(&self) -> &Message {
        self.tracked.message()
    }

    pub fn uri(&self) -> &str {
        &self.request.uri
    }

    pub fn service_request(&self) -> &ServiceRequest {
        &self.request
    }

    pub fn service_request_mut(&mut self) -> &mut ServiceRequest {
        &mut self.request
    }

    pub fn into_service_request(self) -> ServiceRequest {
        self.request
    }

    pub fn context(&self) -> &ContextBag {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextBag {
        &mut self.context
    }

    pub fn status(&self) -> RequestStatus {
        self.tracked.status()
    }

    pub fn is_resolved(&self) -> bool {
        self.tracked.status() != RequestStatus::Processing
    }

    /// The reply produced by the middleware that resolved this request.
    pub fn resolution(&self) -> Option<Message> {
        self.tracked.result()
    }

    /// Resolve with an error reply.
    pub fn reject(&mut self, code: ErrorCode, message: impl Into<String>) {
        let body = ErrorBody::new(code, message);
        let reply = Message::error_to(self.tracked.message(), RELAY_ID, &body);
        if let Err(e) = self.tracked.resolve(reply) {
            tracing::debug!(message_id = %self.tracked.id(), error = %e, "Reject ignored");
        }
    }

    /// Resolve with a successful reply carrying `payload`.
    pub fn respond(&mut self, payload: Vec<u8>) {
        let reply = Message::response_to(self.tracked.message(), RELAY_ID, payload);
        if let Err(e) = self.tracked.resolve(reply) {
            tracing::debug!(message_id = %self.tracked.id(), error = %e, "Respond ignored");
        }
    }
}
