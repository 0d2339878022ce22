//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, capacities > 0)
//! - Validate addresses before anything binds or matches on them
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RelayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::config::schema::RelayConfig;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub fn validate_config(config: &RelayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_socket_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    check_positive(&mut errors, "listener.max_connections", config.listener.max_connections as u64);

    check_positive(&mut errors, "timeouts.request_secs", config.timeouts.request_secs);

    let services = &config.services;
    check_positive(&mut errors, "services.max_per_client", services.max_per_client as u64);
    check_positive(&mut errors, "services.queue_capacity", services.queue_capacity as u64);
    check_positive(&mut errors, "services.compaction_threshold", services.compaction_threshold as u64);
    check_positive(&mut errors, "services.admission_timeout_ms", services.admission_timeout_ms);

    for (token, client) in &config.auth.tokens {
        if token.is_empty() {
            errors.push(ValidationError::new("auth.tokens", "token must not be empty"));
        }
        if client.is_empty() {
            errors.push(ValidationError::new("auth.tokens", "client id must not be empty"));
        }
    }
    if config.auth.required && config.auth.tokens.is_empty() {
        errors.push(ValidationError::new(
            "auth.tokens",
            "auth is required but no tokens are configured",
        ));
    }

    for addr in &config.classification.internal_addresses {
        check_ip(&mut errors, "classification.internal_addresses", addr);
    }
    for addr in &config.block_list.addresses {
        check_ip(&mut errors, "block_list.addresses", addr);
    }

    if config.rate_limit.enabled {
        check_positive(&mut errors, "rate_limit.requests_per_second", config.rate_limit.requests_per_second as u64);
        check_positive(&mut errors, "rate_limit.burst_size", config.rate_limit.burst_size as u64);
    }

    if config.health_check.enabled {
        let health = &config.health_check;
        check_positive(&mut errors, "health_check.interval_secs", health.interval_secs);
        check_positive(&mut errors, "health_check.timeout_secs", health.timeout_secs);
        check_positive(&mut errors, "health_check.unhealthy_threshold", health.unhealthy_threshold as u64);
    }

    if config.observability.metrics_enabled {
        check_socket_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::new(field, "must be greater than zero"));
    }
}

fn check_socket_addr(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("'{value}' is not a socket address")));
    }
}

fn check_ip(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("'{value}' is not an IP address")));
    }
}
