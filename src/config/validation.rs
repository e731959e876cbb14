//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (shared routes name an existing network)
//! - Validate value ranges (capacities > 0, compression levels, addresses)
//! - Detect conflicting routes
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{RouteConfig, ServerConfig, StageConfig, Topology};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid bind address {0:?}")]
    InvalidBindAddress(String),

    #[error("invalid metrics address {0:?}")]
    InvalidMetricsAddress(String),

    #[error("listener.max_body_bytes must be greater than zero")]
    ZeroBodyLimit,

    #[error("cgi.buffer_limit must be greater than zero")]
    ZeroBufferLimit,

    #[error("route pattern {0:?} must start with '/'")]
    InvalidPattern(String),

    #[error("route pattern {0:?} is declared more than once")]
    DuplicatePattern(String),

    #[error("network {0:?} is declared more than once")]
    DuplicateNetwork(String),

    #[error("route {route:?} refers to unknown network {network:?}")]
    UnknownNetwork { route: String, network: String },

    #[error("shared route {0:?} does not name a network")]
    MissingNetwork(String),

    #[error("shared route {0:?} declares its own stages or sizing")]
    SharedRouteOverrides(String),

    #[error("{0} has no stages")]
    NoStages(String),

    #[error("{owner}: {field} must be greater than zero")]
    ZeroLimit { owner: String, field: &'static str },

    #[error("{owner}: compression level {level} is outside 0..=9")]
    InvalidCompressionLevel { owner: String, level: u32 },

    #[error("{owner}: basic_auth realm must not be empty")]
    EmptyRealm { owner: String },

    #[error("{owner}: invalid content type {value:?}")]
    InvalidContentType { owner: String, value: String },
}

/// Check a parsed configuration.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(config.listener.bind_address.clone()));
    }
    if config.listener.max_body_bytes == 0 {
        errors.push(ValidationError::ZeroBodyLimit);
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }
    if config.cgi.buffer_limit == 0 {
        errors.push(ValidationError::ZeroBufferLimit);
    }

    let mut networks = HashSet::new();
    for network in &config.networks {
        let owner = format!("network {:?}", network.name);
        if !networks.insert(network.name.as_str()) {
            errors.push(ValidationError::DuplicateNetwork(network.name.clone()));
        }
        check_sizing(&owner, network.capacity, network.queue_limit, network.stage_workers, &mut errors);
        check_stages(&owner, &network.stages, &mut errors);
    }

    let mut patterns = HashSet::new();
    for route in &config.routes {
        if !route.pattern.starts_with('/') {
            errors.push(ValidationError::InvalidPattern(route.pattern.clone()));
        }
        if !patterns.insert(route.pattern.as_str()) {
            errors.push(ValidationError::DuplicatePattern(route.pattern.clone()));
        }
        check_route(route, &networks, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_route(route: &RouteConfig, networks: &HashSet<&str>, errors: &mut Vec<ValidationError>) {
    let owner = format!("route {:?}", route.pattern);

    if route.topology == Topology::Shared {
        match route.network.as_deref() {
            None => errors.push(ValidationError::MissingNetwork(route.pattern.clone())),
            Some(name) if !networks.contains(name) => errors.push(ValidationError::UnknownNetwork {
                route: route.pattern.clone(),
                network: name.to_string(),
            }),
            Some(_) => {}
        }
        let overrides = !route.stages.is_empty()
            || route.capacity.is_some()
            || route.queue_limit.is_some()
            || route.stage_workers.is_some();
        if overrides {
            errors.push(ValidationError::SharedRouteOverrides(route.pattern.clone()));
        }
        return;
    }

    check_sizing(&owner, route.capacity, route.queue_limit, route.stage_workers, errors);
    check_stages(&owner, &route.stages, errors);
}

fn check_sizing(
    owner: &str,
    capacity: Option<usize>,
    queue_limit: Option<usize>,
    stage_workers: Option<usize>,
    errors: &mut Vec<ValidationError>,
) {
    for (field, value) in [
        ("capacity", capacity),
        ("queue_limit", queue_limit),
        ("stage_workers", stage_workers),
    ] {
        if value == Some(0) {
            errors.push(ValidationError::ZeroLimit {
                owner: owner.to_string(),
                field,
            });
        }
    }
}

fn check_stages(owner: &str, stages: &[StageConfig], errors: &mut Vec<ValidationError>) {
    if stages.is_empty() {
        errors.push(ValidationError::NoStages(owner.to_string()));
    }

    for stage in stages {
        match stage {
            StageConfig::Gzip { level: Some(level) }
            | StageConfig::Deflate { level: Some(level) }
            | StageConfig::Compression { level: Some(level) }
                if *level > 9 =>
            {
                errors.push(ValidationError::InvalidCompressionLevel {
                    owner: owner.to_string(),
                    level: *level,
                });
            }
            StageConfig::BasicAuth { realm, .. } if realm.is_empty() => {
                errors.push(ValidationError::EmptyRealm {
                    owner: owner.to_string(),
                });
            }
            StageConfig::Text {
                content_type: Some(value),
                ..
            } if axum::http::HeaderValue::from_str(value).is_err() => {
                errors.push(ValidationError::InvalidContentType {
                    owner: owner.to_string(),
                    value: value.clone(),
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::SharedNetworkConfig;

    fn route(pattern: &str, stages: Vec<StageConfig>) -> RouteConfig {
        RouteConfig {
            pattern: pattern.to_string(),
            topology: Topology::Sequential,
            network: None,
            capacity: None,
            queue_limit: None,
            stage_workers: None,
            stages,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ServerConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "not an address".to_string();
        config.cgi.buffer_limit = 0;
        config.routes = vec![
            route("/a", vec![StageConfig::Output]),
            route("/a", vec![StageConfig::Gzip { level: Some(12) }]),
            route("b", vec![]),
        ];

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::InvalidBindAddress("not an address".to_string())));
        assert!(errors.contains(&ValidationError::ZeroBufferLimit));
        assert!(errors.contains(&ValidationError::DuplicatePattern("/a".to_string())));
        assert!(errors.contains(&ValidationError::InvalidPattern("b".to_string())));
        assert!(errors.contains(&ValidationError::NoStages("route \"b\"".to_string())));
        assert!(errors.contains(&ValidationError::InvalidCompressionLevel {
            owner: "route \"/a\"".to_string(),
            level: 12,
        }));
        assert_eq!(errors.len(), 6);
    }

    #[test]
    fn shared_routes_need_a_known_network() {
        let mut config = ServerConfig::default();
        config.networks = vec![SharedNetworkConfig {
            name: "pool".to_string(),
            capacity: Some(0),
            queue_limit: None,
            stage_workers: None,
            stages: vec![StageConfig::Output],
        }];

        let mut missing = route("/x", vec![]);
        missing.topology = Topology::Shared;
        let mut unknown = route("/y", vec![]);
        unknown.topology = Topology::Shared;
        unknown.network = Some("elsewhere".to_string());
        let mut overriding = route("/z", vec![StageConfig::Output]);
        overriding.topology = Topology::Shared;
        overriding.network = Some("pool".to_string());
        config.routes = vec![missing, unknown, overriding];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::ZeroLimit {
                    owner: "network \"pool\"".to_string(),
                    field: "capacity",
                },
                ValidationError::MissingNetwork("/x".to_string()),
                ValidationError::UnknownNetwork {
                    route: "/y".to_string(),
                    network: "elsewhere".to_string(),
                },
                ValidationError::SharedRouteOverrides("/z".to_string()),
            ]
        );
    }
}
