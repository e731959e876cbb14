//! Body-producing stages.

use std::path::{Component as PathComponent, Path, PathBuf};

use async_trait::async_trait;
use axum::http::{header, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::component::{spawn_producer, Source};
use crate::conn::{Connection, ContentWriter};
use crate::http::Request;

const FILE_CHUNK: usize = 16 * 1024;

/// Responds with a fixed string as `text/plain`.
#[derive(Debug, Clone)]
pub struct TextSource {
    body: Bytes,
    content_type: HeaderValue,
}

impl TextSource {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: HeaderValue::from_static("text/plain; charset=utf-8"),
        }
    }

    pub fn with_content_type(mut self, content_type: HeaderValue) -> Self {
        self.content_type = content_type;
        self
    }
}

#[async_trait]
impl Source for TextSource {
    async fn produce(&self, conn: &mut Connection, _req: &Request, writer: ContentWriter) -> bool {
        conn.set_status(StatusCode::OK);
        conn.set_header(header::CONTENT_TYPE, self.content_type.clone());
        let body = self.body.clone();
        spawn_producer(conn, writer, |mut writer| async move {
            let _ = writer.write(body).await;
        });
        true
    }

    fn name(&self) -> &'static str {
        "text"
    }
}

/// Serves files from a directory, stripping a URL prefix first.
#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
    strip_prefix: String,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>, strip_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            strip_prefix: strip_prefix.into(),
        }
    }

    /// Map a URL path to a file under the root. `None` when the path leaves
    /// the root or does not carry the prefix.
    fn resolve(&self, url_path: &str) -> Option<PathBuf> {
        let rest = url_path.strip_prefix(self.strip_prefix.as_str())?;
        let mut path = self.root.clone();
        for part in Path::new(rest).components() {
            match part {
                PathComponent::Normal(segment) => path.push(segment),
                PathComponent::RootDir | PathComponent::CurDir => {}
                PathComponent::ParentDir | PathComponent::Prefix(_) => return None,
            }
        }
        Some(path)
    }
}

#[async_trait]
impl Source for FileSource {
    async fn produce(&self, conn: &mut Connection, req: &Request, writer: ContentWriter) -> bool {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            conn.status_response(StatusCode::METHOD_NOT_ALLOWED);
            return true;
        }

        let Some(mut path) = self.resolve(req.path()) else {
            conn.status_response(StatusCode::NOT_FOUND);
            return true;
        };

        if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            path.push("index.html");
        }

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "File not served");
                conn.status_response(StatusCode::NOT_FOUND);
                return true;
            }
        };
        let metadata = match file.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => {
                conn.status_response(StatusCode::NOT_FOUND);
                return true;
            }
        };

        let mime = mime_guess::from_path(&path).first_or_octet_stream();
        if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
            conn.set_header(header::CONTENT_TYPE, value);
        }
        conn.set_header(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
        conn.set_status(StatusCode::OK);

        if req.method() == Method::HEAD {
            writer.close();
            return true;
        }

        spawn_producer(conn, writer, |mut writer| async move {
            let mut file = file;
            let mut buf = vec![0u8; FILE_CHUNK];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if writer.write(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "File read failed mid-stream");
                        break;
                    }
                }
            }
        });
        true
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
