//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → routing::build_routes → RouteTable
//!
//! On file change:
//!     watcher.rs detects change, skips unchanged text
//!     → loader.rs parses new config
//!     → validation.rs validates
//!     → watcher.rs logs added and removed route patterns
//!     → server rebuilds the route table and swaps it atomically
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Listener settings are read once at startup; a reload only replaces routes

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    CgiConfig, ListenerConfig, ObservabilityConfig, RouteConfig, ServerConfig, SharedNetworkConfig,
    StageConfig, TimeoutConfig, Topology,
};
pub use validation::ValidationError;
pub use watcher::{ConfigWatcher, RouteChanges};
