//! Body-transforming stages.
//!
//! # Responsibilities
//! - Pass-through and byte-mapping filters
//! - gzip / deflate encoding via flate2
//! - Content negotiation on `Accept-Encoding` (`CompressionPipe`)

use std::io::Write;

use async_trait::async_trait;
use axum::http::{header, HeaderValue};
use bytes::Bytes;
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

use crate::component::{spawn_producer, Filter, Pipe};
use crate::conn::{Connection, ContentReader, ContentWriter};
use crate::http::Request;

/// Copies the body unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFilter;

#[async_trait]
impl Filter for IdentityFilter {
    async fn transform(
        &self,
        conn: &mut Connection,
        _req: &Request,
        reader: ContentReader,
        writer: ContentWriter,
    ) -> bool {
        spawn_producer(conn, writer, |mut writer| async move {
            let _ = reader.copy_to(&mut writer).await;
        });
        true
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

/// Rotates ASCII letters by 13 places.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rot13Filter;

fn rot13(b: u8) -> u8 {
    match b {
        b'a'..=b'z' => (b - b'a' + 13) % 26 + b'a',
        b'A'..=b'Z' => (b - b'A' + 13) % 26 + b'A',
        _ => b,
    }
}

#[async_trait]
impl Filter for Rot13Filter {
    async fn transform(
        &self,
        conn: &mut Connection,
        _req: &Request,
        mut reader: ContentReader,
        writer: ContentWriter,
    ) -> bool {
        spawn_producer(conn, writer, |mut writer| async move {
            while let Some(chunk) = reader.read().await {
                let rotated: Vec<u8> = chunk.iter().copied().map(rot13).collect();
                if writer.write(rotated).await.is_err() {
                    break;
                }
            }
        });
        true
    }

    fn name(&self) -> &'static str {
        "rot13"
    }
}

/// An encoder writing into an in-memory buffer that can be drained between
/// chunks.
trait StreamEncoder: Write + Send + 'static {
    fn take_output(&mut self) -> Vec<u8>;
    fn finish_output(self) -> std::io::Result<Vec<u8>>;
}

impl StreamEncoder for GzEncoder<Vec<u8>> {
    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }

    fn finish_output(self) -> std::io::Result<Vec<u8>> {
        self.finish()
    }
}

impl StreamEncoder for DeflateEncoder<Vec<u8>> {
    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }

    fn finish_output(self) -> std::io::Result<Vec<u8>> {
        self.finish()
    }
}

fn spawn_encoder<E: StreamEncoder>(
    conn: &mut Connection,
    encoding: &'static str,
    mut reader: ContentReader,
    writer: ContentWriter,
    mut encoder: E,
) {
    conn.set_header(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
    conn.set_header(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    // The encoded length is unknown up front.
    conn.remove_header(header::CONTENT_LENGTH);
    let id = conn.id();

    spawn_producer(conn, writer, move |mut writer| async move {
        while let Some(chunk) = reader.read().await {
            if let Err(e) = encoder.write_all(&chunk) {
                tracing::error!(connection_id = %id, encoding, error = %e, "Encoder write failed");
                return;
            }
            let out = encoder.take_output();
            if writer.write(out).await.is_err() {
                return;
            }
        }
        match encoder.finish_output() {
            Ok(tail) => {
                let _ = writer.write(Bytes::from(tail)).await;
            }
            Err(e) => {
                tracing::error!(connection_id = %id, encoding, error = %e, "Encoder finish failed");
            }
        }
    });
}

/// gzip-encodes the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipFilter {
    level: Compression,
}

impl GzipFilter {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

#[async_trait]
impl Filter for GzipFilter {
    async fn transform(
        &self,
        conn: &mut Connection,
        _req: &Request,
        reader: ContentReader,
        writer: ContentWriter,
    ) -> bool {
        spawn_encoder(conn, "gzip", reader, writer, GzEncoder::new(Vec::new(), self.level));
        true
    }

    fn name(&self) -> &'static str {
        "gzip"
    }
}

/// deflate-encodes the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeflateFilter {
    level: Compression,
}

impl DeflateFilter {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

#[async_trait]
impl Filter for DeflateFilter {
    async fn transform(
        &self,
        conn: &mut Connection,
        _req: &Request,
        reader: ContentReader,
        writer: ContentWriter,
    ) -> bool {
        spawn_encoder(conn, "deflate", reader, writer, DeflateEncoder::new(Vec::new(), self.level));
        true
    }

    fn name(&self) -> &'static str {
        "deflate"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coding {
    Gzip,
    Deflate,
}

/// A q-value in `0.0..=1.0`; anything unparsable or NaN counts as 0.
fn parse_qvalue(raw: &str) -> f32 {
    match raw.trim().parse::<f32>() {
        Ok(q) if q.is_nan() => 0.0,
        Ok(q) => q.clamp(0.0, 1.0),
        Err(_) => 0.0,
    }
}

/// Pick a content coding from an `Accept-Encoding` value. gzip wins ties.
fn negotiate(accept: &str) -> Option<Coding> {
    let mut gzip: Option<f32> = None;
    let mut deflate: Option<f32> = None;
    let mut wildcard: Option<f32> = None;

    for item in accept.split(',') {
        let mut parts = item.split(';');
        let coding = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let mut q = 1.0f32;
        for param in parts {
            if let Some((key, value)) = param.split_once('=') {
                if key.trim().eq_ignore_ascii_case("q") {
                    q = parse_qvalue(value);
                }
            }
        }
        match coding.as_str() {
            "gzip" | "x-gzip" => gzip = Some(q),
            "deflate" => deflate = Some(q),
            "*" => wildcard = Some(q),
            _ => {}
        }
    }

    let gzip = gzip.or(wildcard).unwrap_or(0.0);
    let deflate = deflate.or(wildcard).unwrap_or(0.0);
    if gzip <= 0.0 && deflate <= 0.0 {
        None
    } else if gzip >= deflate {
        Some(Coding::Gzip)
    } else {
        Some(Coding::Deflate)
    }
}

/// Compresses the pending body when the client asks for it.
///
/// Only HTTP/1.1 and later requests are considered; the chosen filter runs
/// inline so the chain sees a single stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionPipe {
    gzip: GzipFilter,
    deflate: DeflateFilter,
}

impl CompressionPipe {
    pub fn with_level(level: u32) -> Self {
        Self {
            gzip: GzipFilter::with_level(level),
            deflate: DeflateFilter::with_level(level),
        }
    }
}

#[async_trait]
impl Pipe for CompressionPipe {
    async fn process(&self, conn: &mut Connection, req: &Request) -> bool {
        if !req.at_least_http11()
            || !conn.has_pending_content()
            || conn.header(header::CONTENT_ENCODING).is_some()
        {
            return true;
        }
        let Some(coding) = req.header(header::ACCEPT_ENCODING).and_then(negotiate) else {
            return true;
        };

        let reader = match conn.new_content_reader() {
            Ok(reader) => reader,
            Err(_) => return true,
        };
        let writer = match conn.new_content_writer() {
            Ok(writer) => writer,
            Err(e) => {
                tracing::error!(connection_id = %conn.id(), error = %e, "Compression could not allocate a writer");
                reader.close();
                conn.status_response(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
                return true;
            }
        };

        tracing::debug!(connection_id = %conn.id(), coding = ?coding, "Compressing response");
        match coding {
            Coding::Gzip => self.gzip.transform(conn, req, reader, writer).await,
            Coding::Deflate => self.deflate.transform(conn, req, reader, writer).await,
        }
    }

    fn name(&self) -> &'static str {
        "compression"
    }
}
