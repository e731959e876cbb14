//! Parser for the header block a CGI script writes before its body.
//!
//! # Responsibilities
//! - Read `Key: Value` lines up to the blank separator line
//! - Join whitespace-led continuation lines onto the previous value
//! - Enforce line, value and header count limits
//! - Interpret `Status`, `Pragma` and `Content-Type`

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::PipelineError;

/// Longest accepted header line, terminator included.
pub const MAX_LINE_LENGTH: usize = 4096;
/// Longest accepted value after folding continuation lines.
pub const MAX_VALUE_LENGTH: usize = 4096;
/// Most header lines accepted in one block.
pub const MAX_HEADER_LINES: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header line too long")]
    HeaderLineTooLong,

    #[error("value too long for key {0:?}")]
    ValueTooLong(String),

    #[error("header too long")]
    HeaderTooLong,

    #[error("malformed header line {0:?}")]
    MalformedHeaderLine(String),

    #[error("header block ended before the blank line")]
    TruncatedHeader,

    #[error("invalid status header {0:?}")]
    InvalidStatus(String),

    #[error("no Content-Type specified")]
    MissingContentType,

    #[error("reading script output failed: {0}")]
    Io(String),
}

impl HeaderError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            HeaderError::HeaderLineTooLong => "header_line_too_long",
            HeaderError::ValueTooLong(_) => "value_too_long",
            HeaderError::HeaderTooLong => "header_too_long",
            HeaderError::MalformedHeaderLine(_) => "malformed_header_line",
            HeaderError::TruncatedHeader => "truncated_header",
            HeaderError::InvalidStatus(_) => "invalid_status",
            HeaderError::MissingContentType => "missing_content_type",
            HeaderError::Io(_) => "io",
        }
    }
}

impl From<HeaderError> for PipelineError {
    fn from(e: HeaderError) -> Self {
        match e {
            HeaderError::HeaderLineTooLong
            | HeaderError::ValueTooLong(_)
            | HeaderError::HeaderTooLong => PipelineError::LimitExceeded(e.to_string()),
            HeaderError::Io(_) => PipelineError::UpstreamFailure(e.to_string()),
            _ => PipelineError::ProtocolViolation(e.to_string()),
        }
    }
}

/// The interpreted header block.
#[derive(Debug, Clone)]
pub struct CgiHeaders {
    pub status: StatusCode,
    /// Response headers to forward; never contains `Status`.
    pub headers: HeaderMap,
}

/// Read one line, without its trailing whitespace.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<(), HeaderError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    loop {
        let available = reader
            .fill_buf()
            .await
            .map_err(|e| HeaderError::Io(e.to_string()))?;
        if available.is_empty() {
            return Err(HeaderError::TruncatedHeader);
        }
        let (taken, done) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        line.extend_from_slice(&available[..taken]);
        reader.consume(taken);

        if line.len() >= MAX_LINE_LENGTH {
            return Err(HeaderError::HeaderLineTooLong);
        }
        if done {
            break;
        }
    }

    while matches!(line.last(), Some(b' ' | b'\r' | b'\t' | b'\n')) {
        line.pop();
    }
    Ok(())
}

/// Next byte without consuming it; `None` at EOF.
async fn peek<R>(reader: &mut R) -> Result<Option<u8>, HeaderError>
where
    R: AsyncBufRead + Unpin,
{
    let available = reader
        .fill_buf()
        .await
        .map_err(|e| HeaderError::Io(e.to_string()))?;
    Ok(available.first().copied())
}

/// Read one header, folding continuation lines. `None` at the blank line.
async fn read_key_value<R>(reader: &mut R) -> Result<Option<(String, String)>, HeaderError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    read_line(reader, &mut line).await?;
    if line.is_empty() {
        return Ok(None);
    }

    let text = String::from_utf8_lossy(&line).into_owned();
    let Some((key, value)) = text.split_once(':') else {
        return Err(HeaderError::MalformedHeaderLine(text.clone()));
    };
    if key.is_empty() || key.contains(' ') {
        return Err(HeaderError::MalformedHeaderLine(text.clone()));
    }
    let key = key.to_string();
    let mut value = value.trim_start_matches(' ').to_string();

    while let Some(b' ' | b'\t') = peek(reader).await? {
        // Eat the leading whitespace, then fold the rest of the line in.
        while let Some(b' ' | b'\t') = peek(reader).await? {
            reader.consume(1);
        }
        read_line(reader, &mut line).await?;
        value.push(' ');
        value.push_str(&String::from_utf8_lossy(&line));
        if value.len() >= MAX_VALUE_LENGTH {
            return Err(HeaderError::ValueTooLong(key));
        }
    }

    Ok(Some((key, value)))
}

/// Parse the header block, leaving `reader` positioned at the body.
pub async fn parse_headers<R>(reader: &mut R) -> Result<CgiHeaders, HeaderError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    let mut count = 0usize;

    while let Some((key, value)) = read_key_value(reader).await? {
        count += 1;
        if count > MAX_HEADER_LINES {
            return Err(HeaderError::HeaderTooLong);
        }
        let malformed = || HeaderError::MalformedHeaderLine(format!("{}: {}", key, value));
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| malformed())?;
        let value = HeaderValue::from_str(&value).map_err(|_| malformed())?;
        headers.insert(name, value);
    }

    let status = match headers.remove("status") {
        None => StatusCode::OK,
        Some(raw) => parse_status(&raw)?,
    };

    if headers.get(header::PRAGMA).map(|v| v == "no-cache").unwrap_or(false)
        && !headers.contains_key(header::CACHE_CONTROL)
    {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }

    if !headers.contains_key(header::CONTENT_TYPE) {
        return Err(HeaderError::MissingContentType);
    }

    Ok(CgiHeaders { status, headers })
}

/// `Status` must start with a three-digit code; any reason phrase is ignored.
fn parse_status(raw: &HeaderValue) -> Result<StatusCode, HeaderError> {
    let text = raw.to_str().unwrap_or("");
    let invalid = || HeaderError::InvalidStatus(text.to_string());
    let code = text.get(..3).ok_or_else(invalid)?;
    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let code: u16 = code.parse().map_err(|_| invalid())?;
    StatusCode::from_u16(code).map_err(|_| invalid())
}
