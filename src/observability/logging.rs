//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Configure log level from config, overridable via `RUST_LOG`
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Access log events go to the `webpipes::access` target so they can be
//!   filtered separately

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive for a given base level.
pub fn default_directive(level: &str) -> String {
    format!("webpipes={level},tower_http={level}")
}

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
///
/// Returns false if a subscriber was already installed.
pub fn init_logging(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive(level).into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_covers_crate_and_tower_http() {
        let directive = default_directive("debug");
        assert_eq!(directive, "webpipes=debug,tower_http=debug");
        assert!(directive.parse::<EnvFilter>().is_ok());
    }
}
