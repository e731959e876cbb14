//! Adapter turning a tower `Service` (an axum `Router`, say) into a Source.

use std::fmt;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Response, Uri};
use futures_util::StreamExt;
use tower::{Service, ServiceExt};

use crate::component::{spawn_producer, Source};
use crate::conn::{Connection, ContentWriter};
use crate::error::PipelineError;
use crate::http::Request;

/// Calls a service once per request and copies its response into the
/// connection: status and headers as metadata, body through the pipe.
#[derive(Clone)]
pub struct ServiceSource<S> {
    service: S,
    strip_prefix: Option<String>,
}

impl<S> ServiceSource<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            strip_prefix: None,
        }
    }

    /// Remove `prefix` from the path before calling the service.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = Some(prefix.into());
        self
    }

    fn rewrite(&self, uri: &Uri) -> Uri {
        let Some(prefix) = self.strip_prefix.as_deref() else {
            return uri.clone();
        };
        let Some(rest) = uri.path().strip_prefix(prefix) else {
            return uri.clone();
        };
        let path = if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        };
        let target = match uri.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        };
        target.parse().unwrap_or_else(|_| uri.clone())
    }
}

impl<S> fmt::Debug for ServiceSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSource")
            .field("strip_prefix", &self.strip_prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> Source for ServiceSource<S>
where
    S: Service<axum::http::Request<Body>, Response = Response<Body>> + Clone + Send + Sync + 'static,
    S::Future: Send,
    S::Error: fmt::Display,
{
    async fn produce(&self, conn: &mut Connection, req: &Request, writer: ContentWriter) -> bool {
        let mut builder = axum::http::Request::builder()
            .method(req.method().clone())
            .uri(self.rewrite(req.uri()))
            .version(req.version());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(req.headers().clone());
        }
        let body = conn.take_request_body().unwrap_or_else(Body::empty);
        let inner = match builder.body(body) {
            Ok(inner) => inner,
            Err(e) => {
                let err = PipelineError::ProtocolViolation(e.to_string());
                tracing::error!(connection_id = %conn.id(), error = %err, "Could not rebuild request");
                conn.status_response(err.status());
                return true;
            }
        };

        let response = match self.service.clone().oneshot(inner).await {
            Ok(response) => response,
            Err(e) => {
                let err = PipelineError::UpstreamFailure(e.to_string());
                tracing::error!(connection_id = %conn.id(), error = %err, "Service call failed");
                conn.status_response(err.status());
                return true;
            }
        };

        let (parts, body) = response.into_parts();
        conn.set_status(parts.status);
        for (name, value) in parts.headers.iter() {
            conn.set_header(name.clone(), value.clone());
        }

        let id = conn.id();
        spawn_producer(conn, writer, move |mut writer| async move {
            let mut stream = body.into_data_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if writer.write(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(connection_id = %id, error = %e, "Service body failed mid-stream");
                        break;
                    }
                }
            }
        });
        true
    }

    fn name(&self) -> &'static str {
        "service"
    }
}
