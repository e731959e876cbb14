//! Route table construction from configuration.
//!
//! # Responsibilities
//! - Turn stage declarations into components
//! - Start one network per `network` route and per `[[networks]]` entry
//! - Bind each route to its chain or network handler
//!
//! # Design Decisions
//! - Shared networks start once per build; every route naming one gets a
//!   clone of the same handler
//! - Prefix-aware stages on a route default to the route pattern without
//!   its trailing slash; on a shared network they default to no prefix
//! - Networks of a replaced table stop on their own once the last request
//!   holding a handler clone completes

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderValue;
use thiserror::Error;

use crate::cgi::{CgiGateway, CgiOptions};
use crate::chain::{Chain, Handler, Network, NetworkConfig, NetworkHandler};
use crate::component::{
    AccessLog, BasicAuth, CompressionPipe, Component, DebugPipe, DeflateFilter, FileSource,
    GzipFilter, Http10OutputPipe, IdentityFilter, OutputPipe, Rot13Filter, TextSource,
};
use crate::config::schema::{CgiConfig, RouteConfig, ServerConfig, StageConfig, Topology};
use crate::routing::matcher::Pattern;
use crate::routing::router::RouteTable;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("route {route:?} refers to unknown network {network:?}")]
    UnknownNetwork { route: String, network: String },

    #[error("invalid content type {0:?}")]
    InvalidContentType(String),
}

/// Build the route table for `config`. Must run inside a Tokio runtime,
/// since networks spawn their dispatchers.
pub fn build_routes(config: &ServerConfig) -> Result<RouteTable, BuildError> {
    let mut shared = HashMap::new();
    for network in &config.networks {
        let stages = build_stages(&network.stages, "", &config.cgi)?;
        let sizing = sizing(&network.name, network.capacity, network.queue_limit, network.stage_workers);
        let handler = Network::start(sizing, stages);
        tracing::info!(network = %network.name, stages = handler.stage_count(), "Shared network started");
        shared.insert(network.name.as_str(), handler);
    }

    let mut table = RouteTable::new();
    for route in &config.routes {
        let handler = build_route(route, &shared, &config.cgi)?;
        tracing::debug!(pattern = %route.pattern, topology = ?route.topology, "Route bound");
        table.bind(route.pattern.clone(), handler);
    }
    Ok(table)
}

fn build_route(
    route: &RouteConfig,
    shared: &HashMap<&str, NetworkHandler>,
    cgi: &CgiConfig,
) -> Result<Arc<dyn Handler>, BuildError> {
    let pattern = Pattern::new(route.pattern.as_str());

    match route.topology {
        Topology::Sequential => {
            let stages = build_stages(&route.stages, pattern.strip_prefix(), cgi)?;
            Ok(Arc::new(Chain::new(stages)))
        }
        Topology::Network => {
            let stages = build_stages(&route.stages, pattern.strip_prefix(), cgi)?;
            let sizing = sizing(&route.pattern, route.capacity, route.queue_limit, route.stage_workers);
            Ok(Arc::new(Network::start(sizing, stages)))
        }
        Topology::Shared => {
            let name = route.network.as_deref().unwrap_or_default();
            let handler = shared.get(name).ok_or_else(|| BuildError::UnknownNetwork {
                route: route.pattern.clone(),
                network: name.to_string(),
            })?;
            Ok(Arc::new(handler.clone()))
        }
    }
}

fn sizing(
    name: &str,
    capacity: Option<usize>,
    queue_limit: Option<usize>,
    stage_workers: Option<usize>,
) -> NetworkConfig {
    NetworkConfig {
        name: name.to_string(),
        capacity,
        queue_limit,
        stage_workers,
    }
}

fn build_stages(stages: &[StageConfig], default_prefix: &str, cgi: &CgiConfig) -> Result<Vec<Component>, BuildError> {
    stages
        .iter()
        .map(|stage| build_stage(stage, default_prefix, cgi))
        .collect()
}

/// Build one component from its declaration.
pub fn build_stage(stage: &StageConfig, default_prefix: &str, cgi: &CgiConfig) -> Result<Component, BuildError> {
    let prefix = |explicit: &Option<String>| explicit.clone().unwrap_or_else(|| default_prefix.to_string());
    let options = |document_root: &Option<std::path::PathBuf>| CgiOptions {
        buffer_limit: cgi.buffer_limit,
        follow_symlinks: cgi.follow_symlinks,
        document_root: document_root.clone(),
    };

    let component = match stage {
        StageConfig::Text { body, content_type } => {
            let mut source = TextSource::new(body.clone());
            if let Some(value) = content_type {
                let value = HeaderValue::from_str(value)
                    .map_err(|_| BuildError::InvalidContentType(value.clone()))?;
                source = source.with_content_type(value);
            }
            Component::source(source)
        }
        StageConfig::File { root, prefix: explicit } => {
            Component::source(FileSource::new(root.clone(), prefix(explicit)))
        }
        StageConfig::Cgi {
            script,
            prefix: explicit,
            document_root,
        } => Component::source(
            CgiGateway::script(script.clone(), prefix(explicit)).with_options(options(document_root)),
        ),
        StageConfig::CgiDir {
            dir,
            prefix: explicit,
            document_root,
        } => Component::source(
            CgiGateway::dir(dir.clone(), prefix(explicit)).with_options(options(document_root)),
        ),
        StageConfig::Identity => Component::filter(IdentityFilter),
        StageConfig::Rot13 => Component::filter(Rot13Filter),
        StageConfig::Gzip { level } => {
            Component::filter(level.map(GzipFilter::with_level).unwrap_or_default())
        }
        StageConfig::Deflate { level } => {
            Component::filter(level.map(DeflateFilter::with_level).unwrap_or_default())
        }
        StageConfig::Compression { level } => {
            Component::pipe(level.map(CompressionPipe::with_level).unwrap_or_default())
        }
        StageConfig::BasicAuth { realm, users } => {
            Component::pipe(BasicAuth::new(realm.clone(), users.clone()))
        }
        StageConfig::AccessLog => Component::pipe(AccessLog),
        StageConfig::Debug { message } => {
            Component::pipe(message.clone().map(DebugPipe::new).unwrap_or_default())
        }
        StageConfig::Output => Component::pipe(OutputPipe),
        StageConfig::OutputHttp10 => Component::pipe(Http10OutputPipe),
    };
    Ok(component)
}
