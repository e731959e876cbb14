//! Configuration file watcher for hot reload.
//!
//! # Data Flow
//! ```text
//! notify event (modify/create)
//!     → read file → same text as last reload? drop
//!     → parse + validate → invalid? log, keep running table
//!     → diff route patterns against the running set → log
//!     → send ServerConfig to the server's reload task
//! ```
//!
//! # Design Decisions
//! - Editors often emit several events per save; identical file text is
//!   only applied once
//! - The diff is by route pattern; a route whose stages change shows up as
//!   kept

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::{parse_config, ConfigError};
use crate::config::schema::ServerConfig;

/// Route patterns added, removed and kept by a reload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub kept: usize,
}

impl RouteChanges {
    fn between(previous: &BTreeSet<String>, next: &BTreeSet<String>) -> Self {
        Self {
            added: next.difference(previous).cloned().collect(),
            removed: previous.difference(next).cloned().collect(),
            kept: next.intersection(previous).count(),
        }
    }
}

impl fmt::Display for RouteChanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+[{}] -[{}] ={}",
            self.added.join(" "),
            self.removed.join(" "),
            self.kept
        )
    }
}

fn patterns(config: &ServerConfig) -> BTreeSet<String> {
    config.routes.iter().map(|r| r.pattern.clone()).collect()
}

/// What the watcher remembers between events.
#[derive(Debug)]
struct ReloadState {
    last_text: Option<String>,
    patterns: BTreeSet<String>,
}

impl ReloadState {
    fn new(running: &ServerConfig) -> Self {
        Self {
            last_text: None,
            patterns: patterns(running),
        }
    }

    /// `None` when `text` is what was last applied.
    fn consider(&mut self, text: String) -> Option<Result<(ServerConfig, RouteChanges), ConfigError>> {
        if self.last_text.as_deref() == Some(text.as_str()) {
            return None;
        }
        let config = match parse_config(&text) {
            Ok(config) => config,
            Err(e) => return Some(Err(e)),
        };
        let next = patterns(&config);
        let changes = RouteChanges::between(&self.patterns, &next);
        self.patterns = next;
        self.last_text = Some(text);
        Some(Ok((config, changes)))
    }
}

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    state: ReloadState,
    update_tx: mpsc::UnboundedSender<ServerConfig>,
}

impl ConfigWatcher {
    /// Create a watcher for `path`; `running` is the configuration the
    /// server starts with, used as the baseline for route diffs.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path, running: &ServerConfig) -> (Self, mpsc::UnboundedReceiver<ServerConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                state: ReloadState::new(running),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file in a background thread.
    ///
    /// Only configurations that parse and validate are sent; a broken edit
    /// keeps the running configuration in place. The returned watcher must be
    /// kept alive for as long as updates are wanted.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self {
            path,
            mut state,
            update_tx,
        } = self;
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let text = match fs::read_to_string(&path) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(path = %path.display(), error = %e, "Config file unreadable, keeping current configuration");
                            return;
                        }
                    };
                    match state.consider(text) {
                        None => tracing::debug!(path = %path.display(), "Config file unchanged"),
                        Some(Ok((config, changes))) => {
                            tracing::info!(
                                path = %path.display(),
                                routes = config.routes.len(),
                                changes = %changes,
                                "Config reloaded"
                            );
                            let _ = update_tx.send(config);
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&watched, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %watched.display(), "Config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE: &str = r#"
        [[routes]]
        pattern = "/a"
        stages = [{ kind = "text", body = "a" }, { kind = "output" }]
    "#;

    const TWO: &str = r#"
        [[routes]]
        pattern = "/a"
        stages = [{ kind = "text", body = "a2" }, { kind = "output" }]

        [[routes]]
        pattern = "/b/"
        stages = [{ kind = "text", body = "b" }, { kind = "output" }]
    "#;

    #[test]
    fn reload_reports_route_changes() {
        let running = parse_config(ONE).unwrap();
        let mut state = ReloadState::new(&running);

        let (config, changes) = state.consider(TWO.to_string()).unwrap().unwrap();
        assert_eq!(config.routes.len(), 2);
        assert_eq!(changes.added, vec!["/b/".to_string()]);
        assert!(changes.removed.is_empty());
        assert_eq!(changes.kept, 1);
        assert_eq!(changes.to_string(), "+[/b/] -[] =1");

        let (_, changes) = state.consider(ONE.to_string()).unwrap().unwrap();
        assert_eq!(changes.removed, vec!["/b/".to_string()]);
    }

    #[test]
    fn identical_text_is_applied_once() {
        let running = parse_config(ONE).unwrap();
        let mut state = ReloadState::new(&running);

        assert!(state.consider(TWO.to_string()).is_some());
        assert!(state.consider(TWO.to_string()).is_none());
    }

    #[test]
    fn invalid_text_keeps_baseline() {
        let running = parse_config(ONE).unwrap();
        let mut state = ReloadState::new(&running);

        assert!(matches!(state.consider("[[routes]\n".to_string()), Some(Err(ConfigError::Parse(_)))));
        let (_, changes) = state.consider(TWO.to_string()).unwrap().unwrap();
        assert_eq!(changes.added, vec!["/b/".to_string()]);
    }
}
