//! Request head handed to every component.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) for each inbound request
//! - Capture the routing-relevant parts of the request (method, URI, headers)
//! - Record which route pattern matched, for prefix stripping
//!
//! # Design Decisions
//! - The head is immutable and shared by reference across stages; the body
//!   lives on the `Connection` so exactly one component can consume it
//! - Request ID added as early as possible for tracing

use std::net::SocketAddr;

use axum::http::{header, request::Parts, HeaderMap, HeaderValue, Method, Uri, Version};
use tower_http::request_id::{MakeRequestId, RequestId};

/// Header carrying the request correlation ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Mints a fresh UUID v4 for each request lacking an ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = uuid::Uuid::new_v4().to_string();
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

/// The immutable head of an inbound request.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    route: Option<String>,
}

impl Request {
    /// Capture the head of an `http::Request`.
    pub fn from_parts(parts: &Parts, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
            remote_addr,
            route: None,
        }
    }

    /// Record the route pattern this request was dispatched through.
    pub fn with_route(mut self, pattern: impl Into<String>) -> Self {
        self.route = Some(pattern.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The route pattern that matched, if dispatched through a route table.
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Raw query string, empty when absent.
    pub fn query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    /// A header value as text; `None` when absent or not visible ASCII.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header(header::USER_AGENT)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.header(X_REQUEST_ID)
    }

    /// Protocol name as it appears on the request line, e.g. `HTTP/1.1`.
    pub fn proto(&self) -> &'static str {
        match self.version {
            Version::HTTP_09 => "HTTP/0.9",
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_2 => "HTTP/2.0",
            Version::HTTP_3 => "HTTP/3.0",
            _ => "HTTP/1.1",
        }
    }

    /// True for HTTP/1.1 and later.
    pub fn at_least_http11(&self) -> bool {
        self.version >= Version::HTTP_11
    }
}

impl<B> From<&axum::http::Request<B>> for Request {
    fn from(req: &axum::http::Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            remote_addr: None,
            route: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_accessors() {
        let http_req = axum::http::Request::get("http://example.com/cgi-bin/env?x=1")
            .header("User-Agent", "probe/1.0")
            .version(Version::HTTP_10)
            .body(())
            .unwrap();
        let req = Request::from(&http_req).with_route("/cgi-bin/");

        assert_eq!(req.path(), "/cgi-bin/env");
        assert_eq!(req.query(), "x=1");
        assert_eq!(req.user_agent(), Some("probe/1.0"));
        assert_eq!(req.proto(), "HTTP/1.0");
        assert!(!req.at_least_http11());
        assert_eq!(req.route(), Some("/cgi-bin/"));
    }

    #[test]
    fn request_ids_are_unique() {
        let req = axum::http::Request::get("/").body(()).unwrap();
        let mut maker = MakeRequestUuid;
        let a = maker.make_request_id(&req).unwrap();
        let b = maker.make_request_id(&req).unwrap();
        assert_ne!(a.header_value(), b.header_value());
    }
}
