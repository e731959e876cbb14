//! Pipeline topologies.
//!
//! # Data Flow
//! ```text
//! Sequential (sequential.rs):
//!     serve(conn, req) → stage 0 → stage 1 → ... → stage n → conn
//!                         └─ false: stop, conn returned as is
//!
//! Network (network.rs):
//!     serve(conn, req)
//!         → admission permit (capacity C)
//!         → register seq with drainer
//!         → queue 0 → dispatcher 0 → task(stage 0) → queue 1 → ... → exit queue
//!                                        └─ false / panic ──────────────┘
//!         → drainer fires completion for seq → conn
//! ```
//!
//! # Design Decisions
//! - Both topologies run stages through the same `Component::handle` adapter
//! - Machinery never fails a request outright: an unavailable network yields
//!   a 503 connection
//! - A network handler is cheap to clone; clones share capacity, queues and
//!   worker pools, which is how one network serves several routes

use async_trait::async_trait;

use crate::conn::Connection;
use crate::http::Request;

pub mod network;
pub mod sequential;

pub use network::{Network, NetworkConfig, NetworkHandler};
pub use sequential::{Chain, Outcome};

/// Something a route can be bound to.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the request through the pipeline and hand back the connection.
    async fn serve(&self, conn: Connection, req: Request) -> Connection;
}
