//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (path)
//!     → router.rs (route lookup)
//!     → matcher.rs (evaluate pattern)
//!     → Return: matched Route (pattern + Handler) or NoMatch
//!
//! Route Compilation (at startup and on reload):
//!     ServerConfig
//!     → builder.rs (stages → components, start networks)
//!     → Freeze as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Tables are rebuilt, never mutated, when configuration changes
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route
//! - Longest pattern wins

pub mod builder;
pub mod matcher;
pub mod router;

pub use builder::{build_routes, build_stage, BuildError};
pub use matcher::Pattern;
pub use router::{Route, RouteTable};
