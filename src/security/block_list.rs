//! Block-list middleware.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::BlockListConfig;
use crate::net::ConnectionInfo;
use crate::pipeline::{keys, IncomingRequest, Middleware};
use crate::protocol::ErrorCode;

/// Refuses requests from blocked addresses or client ids.
pub struct BlockList {
    addresses: ArcSwap<HashSet<IpAddr>>,
    clients: ArcSwap<HashSet<String>>,
}

impl BlockList {
    pub fn new(config: &BlockListConfig) -> Self {
        Self {
            addresses: ArcSwap::from_pointee(super::parse_ips("block_list.addresses", &config.addresses)),
            clients: ArcSwap::from_pointee(config.clients.iter().cloned().collect()),
        }
    }

    pub fn update(&self, config: &BlockListConfig) {
        self.addresses
            .store(Arc::new(super::parse_ips("block_list.addresses", &config.addresses)));
        self.clients
            .store(Arc::new(config.clients.iter().cloned().collect()));
    }

    pub fn is_blocked(&self, ip: IpAddr, client_ids: &[&str]) -> bool {
        if self.addresses.load().contains(&ip) {
            return true;
        }
        let clients = self.clients.load();
        client_ids.iter().any(|id| clients.contains(*id))
    }
}

impl Middleware for BlockList {
    fn handle(&self, connection: &ConnectionInfo, mut request: IncomingRequest) -> IncomingRequest {
        let mut ids = vec![connection.client_id.as_str()];
        if let Some(acting) = request.context().get_str(keys::CLIENT_ID) {
            ids.push(acting);
        }

        if self.is_blocked(connection.peer_addr.ip(), &ids) {
            tracing::warn!(
                connection_id = %connection.id,
                client_id = %connection.client_id,
                peer = %connection.peer_addr,
                "Blocked request"
            );
            request.reject(ErrorCode::Forbidden, "blocked");
        }
        request
    }
}
