//! Metadata-only stages: authentication, access logging, debugging.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::{header, HeaderValue};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::component::Pipe;
use crate::conn::Connection;
use crate::error::PipelineError;
use crate::http::Request;

/// HTTP Basic authentication against a fixed user table.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    realm: String,
    users: HashMap<String, String>,
}

impl BasicAuth {
    pub fn new(realm: impl Into<String>, users: HashMap<String, String>) -> Self {
        Self {
            realm: realm.into(),
            users,
        }
    }

    fn check(&self, req: &Request) -> Result<String, PipelineError> {
        let value = req
            .header(header::AUTHORIZATION)
            .ok_or(PipelineError::Unauthorized)?;
        let (scheme, encoded) = value.split_once(' ').ok_or(PipelineError::Unauthorized)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(PipelineError::Unauthorized);
        }
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| PipelineError::Unauthorized)?;
        let credentials = String::from_utf8(decoded).map_err(|_| PipelineError::Unauthorized)?;
        let (user, password) = credentials
            .split_once(':')
            .ok_or(PipelineError::Unauthorized)?;

        match self.users.get(user) {
            Some(expected) if expected == password => Ok(user.to_string()),
            _ => Err(PipelineError::Unauthorized),
        }
    }
}

#[async_trait]
impl Pipe for BasicAuth {
    async fn process(&self, conn: &mut Connection, req: &Request) -> bool {
        match self.check(req) {
            Ok(user) => {
                tracing::debug!(connection_id = %conn.id(), user = %user, "Authenticated");
                true
            }
            Err(e) => {
                tracing::info!(
                    connection_id = %conn.id(),
                    path = %req.path(),
                    realm = %self.realm,
                    "Authentication failed"
                );
                let challenge = format!("Basic realm=\"{}\"", self.realm.replace('"', "'"));
                if let Ok(value) = HeaderValue::from_str(&challenge) {
                    conn.set_header(header::WWW_AUTHENTICATE, value);
                }
                conn.status_response(e.status());
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "basic_auth"
    }
}

/// Emits one access log event per request once the body has gone out.
///
/// Place it before the output stage: it only registers interest, the event
/// fires when the transfer completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLog;

#[async_trait]
impl Pipe for AccessLog {
    async fn process(&self, conn: &mut Connection, req: &Request) -> bool {
        let watch = conn.watch_transfer();
        let id = conn.id();
        let remote = req
            .remote_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "-".to_string());
        let method = req.method().clone();
        let uri = req.uri().clone();
        let proto = req.proto();
        let referer = req.header(header::REFERER).unwrap_or("-").to_string();
        let user_agent = req.user_agent().unwrap_or("-").to_string();
        let request_id = req.request_id().unwrap_or("-").to_string();
        let route = req.route().unwrap_or("-").to_string();

        tokio::spawn(async move {
            let outcome = watch.finished().await;
            tracing::info!(
                target: "webpipes::access",
                connection_id = %id,
                request_id = %request_id,
                route = %route,
                remote = %remote,
                method = %method,
                uri = %uri,
                proto,
                status = outcome.status.map(|s| s.as_u16()).unwrap_or(0),
                bytes = outcome.bytes,
                referer = %referer,
                user_agent = %user_agent,
                "access"
            );
        });
        true
    }

    fn name(&self) -> &'static str {
        "access_log"
    }
}

/// Logs that a request passed through this point.
#[derive(Debug, Clone)]
pub struct DebugPipe {
    message: String,
}

impl DebugPipe {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for DebugPipe {
    fn default() -> Self {
        Self::new("debug")
    }
}

#[async_trait]
impl Pipe for DebugPipe {
    async fn process(&self, conn: &mut Connection, req: &Request) -> bool {
        tracing::info!(
            connection_id = %conn.id(),
            path = %req.path(),
            pending_content = conn.has_pending_content(),
            status = ?conn.status(),
            "{}",
            self.message
        );
        true
    }

    fn name(&self) -> &'static str {
        "debug"
    }
}
