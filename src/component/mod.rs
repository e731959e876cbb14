//! Component contract subsystem.
//!
//! # Data Flow
//! ```text
//! Component::handle(conn, req)
//!     ├─ Source  → allocate writer            → produce(conn, req, writer)
//!     ├─ Filter  → detach reader + new writer → transform(conn, req, reader, writer)
//!     └─ Pipe    → no pipe work               → process(conn, req)
//!
//! true  → next stage
//! false → chain aborted, response already finalized by this stage
//! ```
//!
//! # Design Decisions
//! - One trait per stage shape; `Component` is the sum type the chain stores
//! - Allocation failures become a 500 status response and the chain carries
//!   on in that degraded but defined state
//! - Body production runs on a spawned task that owns its writer, so the
//!   writer closes on every exit path

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::conn::{Connection, ContentReader, ContentWriter};
use crate::error::{PipeError, PipelineError};
use crate::http::Request;

pub mod filters;
pub mod output;
pub mod pipes;
pub mod service;
pub mod sources;

pub use filters::{CompressionPipe, DeflateFilter, GzipFilter, IdentityFilter, Rot13Filter};
pub use output::{Http10OutputPipe, OutputPipe};
pub use pipes::{AccessLog, BasicAuth, DebugPipe};
pub use service::ServiceSource;
pub use sources::{FileSource, TextSource};

/// Produces a response body from nothing.
#[async_trait]
pub trait Source: Send + Sync {
    /// Start producing into `writer` and return once production has started.
    async fn produce(&self, conn: &mut Connection, req: &Request, writer: ContentWriter) -> bool;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Consumes the pending body and produces a transformed one.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Start transforming `reader` into `writer` and return once started.
    async fn transform(
        &self,
        conn: &mut Connection,
        req: &Request,
        reader: ContentReader,
        writer: ContentWriter,
    ) -> bool;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Works on connection metadata only, or finalizes the response.
#[async_trait]
pub trait Pipe: Send + Sync {
    async fn process(&self, conn: &mut Connection, req: &Request) -> bool;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A stage of a chain.
#[derive(Clone)]
pub enum Component {
    Source(Arc<dyn Source>),
    Filter(Arc<dyn Filter>),
    Pipe(Arc<dyn Pipe>),
}

impl Component {
    pub fn source(source: impl Source + 'static) -> Self {
        Component::Source(Arc::new(source))
    }

    pub fn filter(filter: impl Filter + 'static) -> Self {
        Component::Filter(Arc::new(filter))
    }

    pub fn pipe(pipe: impl Pipe + 'static) -> Self {
        Component::Pipe(Arc::new(pipe))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Component::Source(s) => s.name(),
            Component::Filter(f) => f.name(),
            Component::Pipe(p) => p.name(),
        }
    }

    /// Run this stage against a connection.
    pub async fn handle(&self, conn: &mut Connection, req: &Request) -> bool {
        match self {
            Component::Source(source) => {
                let writer = match conn.new_content_writer() {
                    Ok(writer) => writer,
                    Err(e) => {
                        allocation_failed(conn, source.name(), e);
                        return true;
                    }
                };
                source.produce(conn, req, writer).await
            }
            Component::Filter(filter) => {
                let (reader, writer) = match conn
                    .new_content_reader()
                    .and_then(|reader| conn.new_content_writer().map(|writer| (reader, writer)))
                {
                    Ok(ends) => ends,
                    Err(e) => {
                        allocation_failed(conn, filter.name(), e);
                        return true;
                    }
                };
                filter.transform(conn, req, reader, writer).await
            }
            Component::Pipe(pipe) => pipe.process(conn, req).await,
        }
    }
}

/// A stage found the content slot in the wrong state; the request ends as a
/// canned error and the chain carries on.
fn allocation_failed(conn: &mut Connection, stage: &'static str, cause: PipeError) {
    let err = PipelineError::from(cause);
    tracing::error!(
        connection_id = %conn.id(),
        stage,
        kind = err.kind(),
        error = %err,
        "Stage could not allocate its content pipe"
    );
    conn.status_response(err.status());
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Component::Source(_) => "Source",
            Component::Filter(_) => "Filter",
            Component::Pipe(_) => "Pipe",
        };
        write!(f, "{}({})", kind, self.name())
    }
}

/// Spawn body production. The writer is moved into the task and closed when
/// the task ends, however it ends.
pub fn spawn_producer<F, Fut>(conn: &Connection, writer: ContentWriter, produce: F) -> JoinHandle<()>
where
    F: FnOnce(ContentWriter) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let span = tracing::debug_span!("producer", connection_id = %conn.id());
    tokio::spawn(produce(writer).instrument(span))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Small stages used across the crate's tests.

    use super::*;
    use axum::body::Body;
    use axum::http::Response;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub fn request(uri: &str) -> Request {
        Request::from(&axum::http::Request::get(uri).body(()).unwrap())
    }

    pub async fn body_text(response: Response<Body>) -> String {
        let bytes = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            axum::body::to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("body must terminate")
        .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Records how many times it ran and returns a fixed verdict.
    pub struct CountingPipe {
        pub hits: Arc<AtomicUsize>,
        pub verdict: bool,
    }

    #[async_trait]
    impl Pipe for CountingPipe {
        async fn process(&self, _conn: &mut Connection, _req: &Request) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.verdict
        }
    }

    /// Writes a partial body then gives up, aborting the chain.
    pub struct AbortingFilter;

    #[async_trait]
    impl Filter for AbortingFilter {
        async fn transform(
            &self,
            conn: &mut Connection,
            _req: &Request,
            reader: ContentReader,
            writer: ContentWriter,
        ) -> bool {
            spawn_producer(conn, writer, |mut writer| async move {
                let _ = writer.write("partial").await;
                reader.close();
            });
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn source_with_occupied_slot_becomes_500() {
        let mut conn = Connection::detached();
        let _existing = conn.new_content_writer().unwrap();
        let req = request("/");

        let source = Component::source(TextSource::new("hello"));
        assert!(source.handle(&mut conn, &req).await);

        let response = conn.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "Internal Server Error\n");
    }

    #[tokio::test]
    async fn filter_without_pending_body_becomes_500() {
        let mut conn = Connection::detached();
        let req = request("/");

        assert!(Component::filter(IdentityFilter).handle(&mut conn, &req).await);
        assert_eq!(conn.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn aborting_filter_leaves_writer_closed() {
        let mut conn = Connection::detached();
        let req = request("/");

        assert!(Component::source(TextSource::new("upstream")).handle(&mut conn, &req).await);
        assert!(!Component::filter(AbortingFilter).handle(&mut conn, &req).await);

        assert_eq!(body_text(conn.into_response()).await, "partial");
    }

    #[test]
    fn debug_names_the_shape() {
        let c = Component::filter(Rot13Filter);
        assert!(format!("{:?}", c).starts_with("Filter("));
    }
}
