//! URL path to script translation.
//!
//! # Responsibilities
//! - Walk a URL path segment by segment under a base directory
//! - Stop at the first regular file; the unused remainder is `PATH_INFO`
//!
//! # Design Decisions
//! - `..` never resolves, even when it would stay under the base
//! - A walk that ends on a directory is not a script, so it is NotFound
//! - Symbolic links are refused unless explicitly allowed

use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// A script located under a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translated {
    /// Filesystem path of the script.
    pub script: PathBuf,
    /// URL path of the script relative to the base, without leading slash.
    pub relative: String,
    /// Remainder of the URL after the script, empty or starting with `/`.
    pub path_info: String,
}

/// Translate `url_path` to a script under `base`.
pub async fn translate_path(
    url_path: &str,
    base: &Path,
    follow_symlinks: bool,
) -> Result<Translated, PipelineError> {
    let not_found = || PipelineError::NotFound(url_path.to_string());
    let segments: Vec<&str> = url_path.split('/').collect();
    let mut current = base.to_path_buf();
    let mut consumed: Vec<&str> = Vec::new();

    for (index, &segment) in segments.iter().enumerate() {
        let last = index == segments.len() - 1;
        match segment {
            ".." => return Err(not_found()),
            "" | "." => {
                if last {
                    break;
                }
                continue;
            }
            _ => {}
        }

        let next = current.join(segment);
        let metadata = if follow_symlinks {
            tokio::fs::metadata(&next).await
        } else {
            tokio::fs::symlink_metadata(&next).await
        }
        .map_err(|_| not_found())?;

        if metadata.file_type().is_symlink() {
            tracing::debug!(path = %next.display(), "Refusing to follow symbolic link");
            return Err(not_found());
        }

        consumed.push(segment);
        if metadata.is_dir() {
            current = next;
            continue;
        }

        let path_info = if last {
            String::new()
        } else {
            format!("/{}", segments[index + 1..].join("/"))
        };
        return Ok(Translated {
            script: next,
            relative: consumed.join("/"),
            path_info,
        });
    }

    Err(not_found())
}
