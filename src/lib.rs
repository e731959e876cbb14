//! Composable HTTP pipeline engine with a CGI/1.1 gateway.

pub mod cgi;
pub mod chain;
pub mod component;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod routing;

pub use chain::{Chain, Handler, Network, NetworkConfig, NetworkHandler};
pub use component::{Component, Filter, Pipe, Source};
pub use config::ServerConfig;
pub use conn::Connection;
pub use error::{PipeError, PipelineError};
pub use http::{HttpServer, Request};
pub use lifecycle::Shutdown;
