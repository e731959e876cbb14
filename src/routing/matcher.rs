//! URL pattern matching.
//!
//! # Responsibilities
//! - Parse route patterns
//! - Match request paths against a pattern
//!
//! # Design Decisions
//! - A pattern ending in `/` matches every path in that subtree
//! - Any other pattern matches only the identical path
//! - Path matching is case-sensitive
//! - No regex to guarantee O(n) matching

/// A compiled route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    subtree: bool,
}

impl Pattern {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let subtree = raw.ends_with('/');
        Self { raw, subtree }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern covers a whole subtree.
    pub fn is_subtree(&self) -> bool {
        self.subtree
    }

    /// Specificity used to pick between overlapping patterns.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The prefix stage components strip by default: the pattern without
    /// its trailing slash.
    pub fn strip_prefix(&self) -> &str {
        self.raw.trim_end_matches('/')
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.subtree {
            path.starts_with(&self.raw)
        } else {
            path == self.raw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pattern() {
        let pattern = Pattern::new("/hello");
        assert!(!pattern.is_subtree());
        assert!(pattern.matches("/hello"));
        assert!(!pattern.matches("/hello/"));
        assert!(!pattern.matches("/hello/world"));
        assert!(!pattern.matches("/HELLO"));
    }

    #[test]
    fn test_subtree_pattern() {
        let pattern = Pattern::new("/static/");
        assert!(pattern.is_subtree());
        assert!(pattern.matches("/static/"));
        assert!(pattern.matches("/static/css/site.css"));
        assert!(!pattern.matches("/static"));
        assert!(!pattern.matches("/staticfiles"));
    }

    #[test]
    fn test_root_matches_everything() {
        let pattern = Pattern::new("/");
        assert!(pattern.matches("/"));
        assert!(pattern.matches("/anything/at/all"));
        assert_eq!(pattern.strip_prefix(), "");
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(Pattern::new("/cgi-bin/").strip_prefix(), "/cgi-bin");
        assert_eq!(Pattern::new("/env").strip_prefix(), "/env");
    }
}
