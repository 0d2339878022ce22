//! Built-in service through which peers manage their own services.
//!
//! Routes (owner `relay`, service `services`):
//! - `/relay/services/register`   body: `{"id", "short_uris", "access"?, "execution"?}`
//! - `/relay/services/unregister` body: `{"id"}`
//! - `/relay/services/update`     body: `{"id", "short_uris"}`
//!
//! The registering connection becomes the host of the service.

use std::sync::{Arc, Weak};

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::protocol::{decode_payload, encode_payload, ErrorBody, ErrorCode, ServiceRequest, RELAY_ID};

use super::executor::{Caller, ExecutionResult, Executor, RemoteExecutor};
use super::hosted::Service;
use super::registry::{RegistryError, ServiceRegistry};
use super::types::{AccessType, ExecutionType, ServiceDescriptor, ServiceKind};

pub const SYSTEM_SERVICE_ID: &str = "services";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub id: String,
    pub short_uris: Vec<String>,
    #[serde(default)]
    pub access: AccessType,
    #[serde(default)]
    pub execution: ExecutionType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterResponse {
    pub id: String,
    pub owner_id: String,
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnregisterRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRequest {
    pub id: String,
    pub short_uris: Vec<String>,
}

pub struct SystemService {
    registry: Weak<ServiceRegistry>,
}

impl SystemService {
    /// Register the system service in `registry`.
    pub fn install(registry: &Arc<ServiceRegistry>) -> Result<Arc<Service>, RegistryError> {
        let descriptor = ServiceDescriptor::new(
            SYSTEM_SERVICE_ID,
            RELAY_ID,
            vec!["/register".into(), "/unregister".into(), "/update".into()],
        )
        .kind(ServiceKind::Local)
        .execution(ExecutionType::Sync);

        let executor = Arc::new(Self {
            registry: Arc::downgrade(registry),
        });
        registry.register_service(descriptor, executor)
    }

    fn handle(&self, caller: &Caller, request: &ServiceRequest) -> ExecutionResult {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| ErrorBody::new(ErrorCode::Unavailable, "relay is shutting down"))?;
        let connection = caller
            .correlator
            .upgrade()
            .ok_or_else(|| ErrorBody::new(ErrorCode::Unavailable, "connection closed"))?;

        let owner = connection.peer().to_string();
        if caller.client_id != owner {
            return Err(registry_error(RegistryError::NotOwner {
                owner,
                caller: caller.client_id.clone(),
            }));
        }

        match operation(&request.uri) {
            "register" => {
                let body: RegisterRequest = decode_body(request)?;
                let descriptor = ServiceDescriptor::new(body.id.clone(), owner, body.short_uris)
                    .kind(ServiceKind::Remote)
                    .access(body.access)
                    .execution(body.execution);
                let executor = Arc::new(RemoteExecutor::new(caller.correlator.clone(), body.id));
                let service = registry
                    .register_service(descriptor, executor)
                    .map_err(registry_error)?;
                encode_body(&RegisterResponse {
                    id: service.id().to_string(),
                    owner_id: service.owner_id().to_string(),
                    routes: service.routes(),
                })
            }
            "unregister" => {
                let body: UnregisterRequest = decode_body(request)?;
                registry
                    .unregister_service(&owner, &body.id)
                    .map_err(registry_error)?;
                encode_body(&body)
            }
            "update" => {
                let body: UpdateRequest = decode_body(request)?;
                let diff = registry
                    .update_service(&owner, &body.id, body.short_uris)
                    .map_err(registry_error)?;
                encode_body(&diff)
            }
            other => Err(ErrorBody::new(
                ErrorCode::NotFound,
                format!("unknown operation {other:?}"),
            )),
        }
    }
}

impl Executor for SystemService {
    fn execute(&self, caller: Caller, request: ServiceRequest) -> BoxFuture<'static, ExecutionResult> {
        future::ready(self.handle(&caller, &request)).boxed()
    }
}

/// Last path segment of the request URI.
fn operation(uri: &str) -> &str {
    let path = uri.split_once('?').map_or(uri, |(path, _)| path);
    path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

fn decode_body<T: serde::de::DeserializeOwned>(request: &ServiceRequest) -> Result<T, ErrorBody> {
    decode_payload(&request.body).map_err(|e| ErrorBody::new(ErrorCode::BadRequest, e.to_string()))
}

fn encode_body<T: Serialize>(value: &T) -> ExecutionResult {
    encode_payload(value).map_err(|e| ErrorBody::new(ErrorCode::Internal, e.to_string()))
}

pub(crate) fn registry_error(error: RegistryError) -> ErrorBody {
    let code = match &error {
        RegistryError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
        RegistryError::NotFound(_) => ErrorCode::NotFound,
        RegistryError::NotOwner { .. } => ErrorCode::Forbidden,
        RegistryError::Routing(_) | RegistryError::AlreadyRegistered(_) | RegistryError::Invalid(_) => {
            ErrorCode::BadRequest
        }
    };
    ErrorBody::new(code, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::correlator::tests::RecordingChannel;
    use crate::correlation::{Correlator, TokioScheduler};
    use crate::net::ConnectionId;
    use crate::service::pool::WorkerPool;
    use crate::service::queue::{AdmissionPolicy, QueueSettings};
    use crate::service::registry::{RegistrySettings, UriDiff};
    use crate::service::types::ServiceStatus;
    use std::time::Duration;

    fn registry(max: usize) -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new(
            RegistrySettings {
                max_per_client: max,
                queue: QueueSettings {
                    capacity: 8,
                    policy: AdmissionPolicy::FailFast,
                },
                compaction_threshold: 4,
            },
            WorkerPool::new(2),
        ));
        SystemService::install(&registry).unwrap();
        registry
    }

    fn connection(peer: &str) -> Arc<Correlator> {
        Arc::new(Correlator::new(
            ConnectionId::new(),
            peer,
            Arc::new(RecordingChannel::default()),
            Arc::new(TokioScheduler::new()),
            Duration::from_secs(5),
        ))
    }

    fn call<T: Serialize>(
        registry: &Arc<ServiceRegistry>,
        conn: &Arc<Correlator>,
        acting: &str,
        op: &str,
        body: &T,
    ) -> ExecutionResult {
        let system = SystemService {
            registry: Arc::downgrade(registry),
        };
        let caller = Caller {
            client_id: acting.to_string(),
            correlator: Arc::downgrade(conn),
        };
        let request = ServiceRequest::new(
            format!("/relay/services/{op}"),
            serde_json::to_vec(body).unwrap(),
        );
        system.handle(&caller, &request)
    }

    fn register(id: &str, uris: &[&str]) -> RegisterRequest {
        RegisterRequest {
            id: id.into(),
            short_uris: uris.iter().map(|u| u.to_string()).collect(),
            access: AccessType::Public,
            execution: ExecutionType::Async,
        }
    }

    #[tokio::test]
    async fn system_routes_are_registered() {
        let registry = registry(4);
        assert!(registry.supports_uri("/relay/services/register"));
        assert!(registry.supports_uri("/relay/services/unregister"));
        assert!(registry.supports_uri("/relay/services/update"));
    }

    #[tokio::test]
    async fn register_hosts_service_on_caller_connection() {
        let registry = registry(4);
        let alice = connection("alice");

        let out = call(&registry, &alice, "alice", "register", &register("echo", &["/say"])).unwrap();
        let resp: RegisterResponse = decode_payload(&out).unwrap();
        assert_eq!(resp.owner_id, "alice");
        assert_eq!(resp.routes, vec!["/alice/echo/say"]);

        let found = registry.find_service_by_uri("/alice/echo/say").unwrap().value;
        assert_eq!(found.kind(), ServiceKind::Remote);
        assert_eq!(found.execution(), ExecutionType::Async);
        assert_eq!(found.status(), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn update_and_unregister() {
        let registry = registry(4);
        let alice = connection("alice");
        call(&registry, &alice, "alice", "register", &register("s", &["/a"])).unwrap();

        let out = call(
            &registry,
            &alice,
            "alice",
            "update",
            &UpdateRequest { id: "s".into(), short_uris: vec!["/b".into()] },
        )
        .unwrap();
        let diff: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(diff, serde_json::to_value(UriDiff { added: vec!["/b".into()], removed: vec!["/a".into()] }).unwrap());
        assert!(registry.supports_uri("/alice/s/b"));

        call(&registry, &alice, "alice", "unregister", &UnregisterRequest { id: "s".into() }).unwrap();
        assert!(!registry.supports_uri("/alice/s/b"));

        let err = call(&registry, &alice, "alice", "unregister", &UnregisterRequest { id: "s".into() }).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn errors_map_to_codes() {
        let registry = registry(1);
        let alice = connection("alice");

        call(&registry, &alice, "alice", "register", &register("one", &["/x"])).unwrap();
        let quota = call(&registry, &alice, "alice", "register", &register("two", &["/x"])).unwrap_err();
        assert_eq!(quota.code, ErrorCode::QuotaExceeded);

        let forbidden = call(&registry, &alice, "mallory", "register", &register("m", &["/x"])).unwrap_err();
        assert_eq!(forbidden.code, ErrorCode::Forbidden);

        let bad = call(&registry, &alice, "alice", "register", &"not an object").unwrap_err();
        assert_eq!(bad.code, ErrorCode::BadRequest);

        let unknown = call(&registry, &alice, "alice", "explode", &register("x", &["/x"])).unwrap_err();
        assert_eq!(unknown.code, ErrorCode::NotFound);
    }

    #[test]
    fn operation_is_last_segment() {
        assert_eq!(operation("/relay/services/register"), "register");
        assert_eq!(operation("/relay/services/update?x=1"), "update");
        assert_eq!(operation("/relay/services/update/"), "update");
    }
}
