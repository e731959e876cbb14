//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cgi::DEFAULT_BUFFER_LIMIT;

/// Root configuration for the pipeline server.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, body limit).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// CGI gateway defaults.
    pub cgi: CgiConfig,

    /// Named networks that several routes can share.
    pub networks: Vec<SharedNetworkConfig>,

    /// Route definitions binding URL patterns to pipelines.
    pub routes: Vec<RouteConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Largest request body accepted, in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole-request timeout in seconds; 0 disables it.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Base log level; `RUST_LOG` overrides it.
    pub log_level: String,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Address the exporter listens on.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// CGI gateway defaults, applied to every `cgi` and `cgi_dir` stage.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CgiConfig {
    /// Script output held back while waiting for the exit status.
    pub buffer_limit: usize,

    /// Follow symbolic links when locating scripts in a directory.
    pub follow_symlinks: bool,
}

impl Default for CgiConfig {
    fn default() -> Self {
        Self {
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            follow_symlinks: false,
        }
    }
}

/// A named network bound to routes with `topology = "shared"`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SharedNetworkConfig {
    pub name: String,

    /// Maximum requests inside the network at once.
    #[serde(default)]
    pub capacity: Option<usize>,

    /// Capacity of each stage queue.
    #[serde(default)]
    pub queue_limit: Option<usize>,

    /// Maximum concurrent requests per stage.
    #[serde(default)]
    pub stage_workers: Option<usize>,

    pub stages: Vec<StageConfig>,
}

/// How a route runs its stages.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Stages run inline on the request task.
    #[default]
    Sequential,
    /// A private staged network for this route.
    Network,
    /// A named network from `[[networks]]`.
    Shared,
}

/// Route configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RouteConfig {
    /// URL pattern; a trailing `/` matches the whole subtree.
    pub pattern: String,

    #[serde(default)]
    pub topology: Topology,

    /// Shared network name, for `topology = "shared"`.
    #[serde(default)]
    pub network: Option<String>,

    #[serde(default)]
    pub capacity: Option<usize>,

    #[serde(default)]
    pub queue_limit: Option<usize>,

    #[serde(default)]
    pub stage_workers: Option<usize>,

    /// Stages, for `sequential` and `network` routes.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// One pipeline stage.
///
/// Prefix-aware stages strip `prefix` from the request path; when it is
/// omitted on a route stage, the route pattern without its trailing `/` is
/// used.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    Text {
        body: String,
        #[serde(default)]
        content_type: Option<String>,
    },
    File {
        root: PathBuf,
        #[serde(default)]
        prefix: Option<String>,
    },
    Cgi {
        script: PathBuf,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        document_root: Option<PathBuf>,
    },
    CgiDir {
        dir: PathBuf,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        document_root: Option<PathBuf>,
    },
    Identity,
    Rot13,
    Gzip {
        #[serde(default)]
        level: Option<u32>,
    },
    Deflate {
        #[serde(default)]
        level: Option<u32>,
    },
    Compression {
        #[serde(default)]
        level: Option<u32>,
    },
    BasicAuth {
        realm: String,
        users: HashMap<String, String>,
    },
    AccessLog,
    Debug {
        #[serde(default)]
        message: Option<String>,
    },
    Output,
    OutputHttp10,
}

impl StageConfig {
    /// The `kind` tag, for messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StageConfig::Text { .. } => "text",
            StageConfig::File { .. } => "file",
            StageConfig::Cgi { .. } => "cgi",
            StageConfig::CgiDir { .. } => "cgi_dir",
            StageConfig::Identity => "identity",
            StageConfig::Rot13 => "rot13",
            StageConfig::Gzip { .. } => "gzip",
            StageConfig::Deflate { .. } => "deflate",
            StageConfig::Compression { .. } => "compression",
            StageConfig::BasicAuth { .. } => "basic_auth",
            StageConfig::AccessLog => "access_log",
            StageConfig::Debug { .. } => "debug",
            StageConfig::Output => "output",
            StageConfig::OutputHttp10 => "output_http10",
        }
    }
}
