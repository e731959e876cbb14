//! Per-request connection state.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Hold the single pending content pipe between stages
//! - Collect response status and headers set by components
//! - Commit (flush) the response into the transport slot, or terminate it
//! - Count body bytes as they stream to the client

use std::convert::Infallible;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{self, IntoHeaderName};
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::watch;

use crate::conn::pipe::{content_pipe, ContentReader, ContentWriter};
use crate::error::PipeError;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where the response stands with respect to the client.
#[derive(Debug)]
enum Transport {
    /// Nothing committed yet.
    Pending,
    /// Status, headers and body stream are committed.
    Flushed(Response<Body>),
    /// The connection is to be dropped without a response.
    Terminated,
}

/// Body progress shared between the connection and the outgoing stream.
#[derive(Debug)]
struct Transfer {
    written: AtomicU64,
    /// Committed status code, 0 until flushed.
    status: AtomicU16,
    done: watch::Sender<bool>,
}

impl Transfer {
    fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            written: AtomicU64::new(0),
            status: AtomicU16::new(0),
            done,
        }
    }

    fn add(&self, n: usize) {
        self.written.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn finish(&self) {
        self.done.send_replace(true);
    }
}

/// Marks the transfer finished when the body stream ends or is dropped.
struct FinishOnDrop(Arc<Transfer>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Outcome of a response as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transferred {
    /// `None` when the connection was terminated or never committed.
    pub status: Option<StatusCode>,
    pub bytes: u64,
}

/// Observer for the final status and byte count of a response.
#[derive(Debug)]
pub struct TransferWatch {
    transfer: Arc<Transfer>,
    done: watch::Receiver<bool>,
}

impl TransferWatch {
    /// Wait until the body has been fully handed to the transport (or
    /// abandoned).
    pub async fn finished(mut self) -> Transferred {
        let _ = self.done.wait_for(|done| *done).await;
        let status = self.transfer.status.load(Ordering::Relaxed);
        Transferred {
            status: StatusCode::from_u16(status).ok(),
            bytes: self.transfer.written.load(Ordering::Relaxed),
        }
    }
}

/// Mutable per-request state threaded through a chain or network.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    transport: Transport,
    request_body: Option<Body>,
    body: Option<ContentReader>,
    status: Option<StatusCode>,
    headers: HeaderMap,
    transfer: Arc<Transfer>,
}

impl Connection {
    /// Wrap an inbound request body into a fresh connection.
    pub fn new(request_body: Body) -> Self {
        Self {
            id: ConnectionId::new(),
            transport: Transport::Pending,
            request_body: Some(request_body),
            body: None,
            status: None,
            headers: HeaderMap::new(),
            transfer: Arc::new(Transfer::new()),
        }
    }

    /// A connection with an empty request body.
    pub fn detached() -> Self {
        Self::new(Body::empty())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Take the inbound request body; only the first caller gets it.
    pub fn take_request_body(&mut self) -> Option<Body> {
        self.request_body.take()
    }

    /// Open a new content pipe, keeping the read end on the connection.
    pub fn new_content_writer(&mut self) -> Result<ContentWriter, PipeError> {
        if self.body.is_some() {
            return Err(PipeError::WriterUnavailable);
        }
        let (writer, reader) = content_pipe();
        self.body = Some(reader);
        Ok(writer)
    }

    /// Detach the pending read end.
    pub fn new_content_reader(&mut self) -> Result<ContentReader, PipeError> {
        self.body.take().ok_or(PipeError::ReaderUnavailable)
    }

    /// True while a content pipe is open on this connection.
    pub fn has_pending_content(&self) -> bool {
        self.body.is_some()
    }

    /// Set a response header, replacing any previous value.
    pub fn set_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn remove_header<K: header::AsHeaderName>(&mut self, name: K) -> Option<HeaderValue> {
        self.headers.remove(name)
    }

    pub fn header<K: header::AsHeaderName>(&self, name: K) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// The status set so far, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Replace whatever response is in progress with a canned plain-text
    /// status response. Never blocks.
    pub fn status_response(&mut self, status: StatusCode) {
        // Entity headers describe the discarded body, not the canned one.
        for name in [
            header::CONTENT_LENGTH,
            header::CONTENT_ENCODING,
            header::CONTENT_RANGE,
            header::TRANSFER_ENCODING,
            header::ETAG,
            header::LAST_MODIFIED,
        ] {
            self.headers.remove(name);
        }
        self.set_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.set_status(status);

        if let Some(stale) = self.body.take() {
            tracing::debug!(connection_id = %self.id, "Discarding pending content for status response");
            stale.close();
        }

        let text = match status.canonical_reason() {
            Some(reason) => format!("{}\n", reason),
            None => format!("status code {}\n", status.as_u16()),
        };

        // The slot is empty after the discard above.
        if let Ok(mut writer) = self.new_content_writer() {
            let _ = writer.try_write(text);
        }
    }

    /// Detach from the transport: the client connection is aborted instead
    /// of receiving a response.
    pub fn terminate(&mut self) {
        if let Some(reader) = self.body.take() {
            reader.close();
        }
        self.transport = Transport::Terminated;
        self.transfer.finish();
        tracing::debug!(connection_id = %self.id, "Connection terminated");
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.transport, Transport::Terminated)
    }

    pub fn is_flushed(&self) -> bool {
        matches!(self.transport, Transport::Flushed(_))
    }

    /// Commit status, headers and the pending pipe as a streaming body.
    ///
    /// Returns false when the response was already committed or terminated.
    pub fn flush(&mut self) -> bool {
        if !matches!(self.transport, Transport::Pending) {
            return false;
        }
        let body = match self.body.take() {
            Some(reader) => Body::from_stream(counted(reader, Arc::clone(&self.transfer))),
            None => {
                self.transfer.finish();
                Body::empty()
            }
        };
        self.transport = Transport::Flushed(self.build_response(body));
        true
    }

    /// Like [`flush`](Self::flush), but reads the whole body first so that
    /// `Content-Length` can be set.
    pub async fn flush_buffered(&mut self) -> bool {
        if !matches!(self.transport, Transport::Pending) {
            return false;
        }
        let body = match self.body.take() {
            Some(reader) => reader.read_to_end().await,
            None => Bytes::new(),
        };
        self.set_header(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.transfer.add(body.len());
        self.transport = Transport::Flushed(self.build_response(Body::from(body)));
        self.transfer.finish();
        true
    }

    /// Bytes streamed to the client so far.
    pub fn bytes_written(&self) -> u64 {
        self.transfer.written.load(Ordering::Relaxed)
    }

    /// Observe the final byte count once the body has gone out.
    pub fn watch_transfer(&self) -> TransferWatch {
        TransferWatch {
            transfer: Arc::clone(&self.transfer),
            done: self.transfer.done.subscribe(),
        }
    }

    /// Hand the connection back to the transport. A response nobody flushed
    /// is flushed here, best effort.
    pub fn into_response(mut self) -> Response<Body> {
        if matches!(self.transport, Transport::Pending) {
            tracing::debug!(connection_id = %self.id, "Flushing response at completion");
            self.flush();
        }
        match std::mem::replace(&mut self.transport, Transport::Terminated) {
            Transport::Flushed(response) => response,
            Transport::Pending | Transport::Terminated => aborted_response(),
        }
    }

    fn build_response(&self, body: Body) -> Response<Body> {
        let status = self.status.unwrap_or(StatusCode::OK);
        self.transfer.status.store(status.as_u16(), Ordering::Relaxed);
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Dropped before anything was committed: nobody will stream a body.
        if matches!(self.transport, Transport::Pending) {
            self.transfer.finish();
        }
    }
}

fn counted(
    reader: ContentReader,
    transfer: Arc<Transfer>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let guard = FinishOnDrop(transfer);
    futures_util::stream::unfold((reader, guard), |(mut reader, guard)| async move {
        let chunk = reader.read().await?;
        guard.0.add(chunk.len());
        Some((Ok(chunk), (reader, guard)))
    })
}

/// A response whose body fails immediately, making the server drop the
/// client connection.
fn aborted_response() -> Response<Body> {
    let stream = futures_util::stream::once(async {
        Err::<Bytes, std::io::Error>(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "connection terminated",
        ))
    });
    Response::new(Body::from_stream(stream))
}
