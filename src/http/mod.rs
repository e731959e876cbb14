//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, route lookup)
//!     → request.rs (immutable request head, request ID)
//!     → bound Handler (chain or network) drives the Connection
//!     → Connection::into_response → Send to client
//! ```

pub mod request;
pub mod server;

pub use request::{MakeRequestUuid, Request, X_REQUEST_ID};
pub use server::HttpServer;
