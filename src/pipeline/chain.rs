//! Ordered middleware chain.

use std::sync::Arc;

use tracing::debug;

use crate::net::ConnectionInfo;

use super::request::IncomingRequest;

/// Request interceptor.
///
/// Takes the request by value and hands back the (possibly replaced)
/// request. Resolving it stops the chain.
pub trait Middleware: Send + Sync {
    fn handle(&self, connection: &ConnectionInfo, request: IncomingRequest) -> IncomingRequest;
}

impl<F> Middleware for F
where
    F: Fn(&ConnectionInfo, IncomingRequest) -> IncomingRequest + Send + Sync,
{
    fn handle(&self, connection: &ConnectionInfo, request: IncomingRequest) -> IncomingRequest {
        self(connection, request)
    }
}

/// A registered middleware.
#[derive(Clone)]
pub struct MiddlewareDescriptor {
    pub id: String,
    /// Lower runs first.
    pub priority: i32,
    pub middleware: Arc<dyn Middleware>,
}

impl std::fmt::Debug for MiddlewareDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareDescriptor")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish()
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    descriptors: Vec<MiddlewareDescriptor>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        id: impl Into<String>,
        priority: i32,
        middleware: Arc<dyn Middleware>,
    ) -> Self {
        self.descriptors.push(MiddlewareDescriptor {
            id: id.into(),
            priority,
            middleware,
        });
        self
    }

    pub fn build(mut self) -> Pipeline {
        // Stable: equal priorities keep registration order.
        self.descriptors.sort_by_key(|d| d.priority);
        Pipeline {
            descriptors: self.descriptors,
        }
    }
}

/// Immutable, totally ordered middleware chain.
#[derive(Debug, Default)]
pub struct Pipeline {
    descriptors: Vec<MiddlewareDescriptor>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Middleware ids in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.id.as_str()).collect()
    }

    /// Run every middleware in order, stopping once one resolves the request.
    pub fn run(&self, connection: &ConnectionInfo, mut request: IncomingRequest) -> IncomingRequest {
        for descriptor in &self.descriptors {
            request = descriptor.middleware.handle(connection, request);
            if request.is_resolved() {
                debug!(
                    connection_id = %connection.id,
                    message_id = %request.message().id(),
                    middleware = %descriptor.id,
                    status = %request.status(),
                    "Pipeline halted"
                );
                break;
            }
        }
        request
    }
}
