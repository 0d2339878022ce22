//! Connection classification.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::ClassificationConfig;
use crate::net::ConnectionInfo;
use crate::pipeline::{keys, IncomingRequest, Middleware};

/// Marks requests from loopback or configured addresses as internal.
pub struct Classify {
    internal: ArcSwap<HashSet<IpAddr>>,
}

impl Classify {
    pub fn new(config: &ClassificationConfig) -> Self {
        Self {
            internal: ArcSwap::from_pointee(super::parse_ips(
                "classification.internal_addresses",
                &config.internal_addresses,
            )),
        }
    }

    pub fn update(&self, config: &ClassificationConfig) {
        self.internal.store(Arc::new(super::parse_ips(
            "classification.internal_addresses",
            &config.internal_addresses,
        )));
    }

    pub fn is_internal(&self, ip: IpAddr) -> bool {
        ip.is_loopback() || self.internal.load().contains(&ip)
    }
}

impl Middleware for Classify {
    fn handle(&self, connection: &ConnectionInfo, mut request: IncomingRequest) -> IncomingRequest {
        let internal = self.is_internal(connection.peer_addr.ip());
        request.context_mut().insert(keys::INTERNAL, internal);
        request
    }
}
