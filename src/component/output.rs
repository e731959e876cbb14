//! Output stages: commit the response to the transport.

use async_trait::async_trait;
use axum::http::{header, Version};

use crate::component::Pipe;
use crate::conn::Connection;
use crate::http::Request;

/// Flushes status, headers and the streaming body.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputPipe;

#[async_trait]
impl Pipe for OutputPipe {
    async fn process(&self, conn: &mut Connection, _req: &Request) -> bool {
        if !conn.flush() {
            tracing::debug!(connection_id = %conn.id(), "Response already committed");
        }
        true
    }

    fn name(&self) -> &'static str {
        "output"
    }
}

/// Output stage that keeps HTTP/1.0 keep-alive clients working.
///
/// A 1.0 client asking for keep-alive can only find the end of the body
/// through `Content-Length`, so the body is buffered first. Everything else
/// streams as with [`OutputPipe`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Http10OutputPipe;

fn wants_buffering(req: &Request) -> bool {
    req.version() == Version::HTTP_10
        && req
            .header(header::CONNECTION)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("keep-alive")))
            .unwrap_or(false)
}

#[async_trait]
impl Pipe for Http10OutputPipe {
    async fn process(&self, conn: &mut Connection, req: &Request) -> bool {
        let committed = if wants_buffering(req) {
            conn.flush_buffered().await
        } else {
            conn.flush()
        };
        if !committed {
            tracing::debug!(connection_id = %conn.id(), "Response already committed");
        }
        true
    }

    fn name(&self) -> &'static str {
        "output_http10"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::testing::{body_text, request};
    use crate::component::{Component, TextSource};

    fn http10(keep_alive: bool) -> Request {
        let mut builder = axum::http::Request::get("/").version(Version::HTTP_10);
        if keep_alive {
            builder = builder.header("Connection", "Keep-Alive");
        }
        Request::from(&builder.body(()).unwrap())
    }

    #[tokio::test]
    async fn output_streams_without_length() {
        let req = request("/");
        let mut conn = Connection::detached();
        Component::source(TextSource::new("stream")).handle(&mut conn, &req).await;
        assert!(Component::pipe(OutputPipe).handle(&mut conn, &req).await);
        assert!(conn.is_flushed());

        let response = conn.into_response();
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(body_text(response).await, "stream");
    }

    #[tokio::test]
    async fn http10_keep_alive_gets_length() {
        for (req, expect_length) in [(http10(true), true), (http10(false), false), (request("/"), false)] {
            let mut conn = Connection::detached();
            Component::source(TextSource::new("sized")).handle(&mut conn, &req).await;
            assert!(Component::pipe(Http10OutputPipe).handle(&mut conn, &req).await);

            let response = conn.into_response();
            assert_eq!(response.headers().get(header::CONTENT_LENGTH).is_some(), expect_length);
            assert_eq!(body_text(response).await, "sized");
        }
    }
}
