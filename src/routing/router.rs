//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store bound routes
//! - Look up the route for a request path
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) pattern scan (acceptable for typical route counts)
//! - Longest matching pattern wins, regardless of declaration order
//! - Explicit NoMatch rather than silent default

use std::fmt;
use std::sync::Arc;

use crate::chain::Handler;
use crate::routing::matcher::Pattern;

/// A pattern bound to the handler that serves it.
#[derive(Clone)]
pub struct Route {
    pub pattern: Pattern,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route").field("pattern", &self.pattern).finish_non_exhaustive()
    }
}

/// The set of routes the server dispatches through.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `pattern` to `handler`, replacing any earlier binding of the
    /// same pattern.
    pub fn bind(&mut self, pattern: impl Into<String>, handler: Arc<dyn Handler>) {
        let pattern = Pattern::new(pattern);
        self.routes.retain(|route| route.pattern != pattern);
        self.routes.push(Route { pattern, handler });
    }

    /// The route with the longest pattern matching `path`.
    pub fn lookup(&self, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|route| route.pattern.matches(path))
            .max_by_key(|route| route.pattern.len())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|route| route.pattern.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::component::sources::TextSource;
    use crate::component::testing::{body_text, request};
    use crate::component::Component;
    use crate::conn::Connection;
    use crate::component::output::OutputPipe;

    fn text(body: &'static str) -> Arc<dyn Handler> {
        Arc::new(Chain::new(vec![
            Component::source(TextSource::new(body)),
            Component::pipe(OutputPipe),
        ]))
    }

    #[test]
    fn test_longest_pattern_wins() {
        let mut table = RouteTable::new();
        table.bind("/", text("root"));
        table.bind("/docs/", text("docs"));
        table.bind("/docs/api/", text("api"));
        table.bind("/docs/index", text("index"));

        let matched = |path: &str| table.lookup(path).map(|route| route.pattern.as_str());
        assert_eq!(matched("/elsewhere"), Some("/"));
        assert_eq!(matched("/docs/guide"), Some("/docs/"));
        assert_eq!(matched("/docs/api/v1"), Some("/docs/api/"));
        assert_eq!(matched("/docs/index"), Some("/docs/index"));
        assert_eq!(matched("/docs"), Some("/"));
    }

    #[test]
    fn test_no_match() {
        let mut table = RouteTable::new();
        table.bind("/only", text("only"));
        assert!(table.lookup("/other").is_none());
        assert!(table.lookup("/only/").is_none());
    }

    #[tokio::test]
    async fn test_rebinding_replaces_handler() {
        let mut table = RouteTable::new();
        table.bind("/x", text("first"));
        table.bind("/x", text("second"));
        assert_eq!(table.len(), 1);

        let route = table.lookup("/x").unwrap();
        let conn = route.handler.serve(Connection::detached(), request("/x")).await;
        assert_eq!(body_text(conn.into_response()).await, "second");
    }
}
