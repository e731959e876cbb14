//! CGI/1.1 meta-variables.

use std::collections::BTreeMap;
use std::path::Path;

use axum::http::header;

use crate::error::PipelineError;
use crate::http::Request;

/// Value of `SERVER_SOFTWARE`.
pub const SERVER_SOFTWARE: &str = concat!("webpipes/", env!("CARGO_PKG_VERSION"));

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Where the script sits in URL space.
#[derive(Debug, Clone, Copy)]
pub struct ScriptLocation<'a> {
    pub script_name: &'a str,
    pub path_info: &'a str,
    /// Directory `PATH_TRANSLATED` is resolved against.
    pub document_root: &'a Path,
}

/// The environment handed to a CGI child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiEnv {
    vars: BTreeMap<String, String>,
    content_length: Option<u64>,
}

impl CgiEnv {
    /// Build the environment for one request.
    ///
    /// Fails when the request carries a `Content-Length` that is not a
    /// non-negative integer.
    pub fn build(req: &Request, location: ScriptLocation<'_>) -> Result<Self, PipelineError> {
        let mut env = CgiEnv::default();

        if let Some(raw) = req.headers().get(header::CONTENT_LENGTH) {
            let length = raw
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    PipelineError::ProtocolViolation(format!("invalid Content-Length {:?}", raw))
                })?;
            env.content_length = Some(length);
            env.set("CONTENT_LENGTH", length.to_string());
            env.set("CONTENT_TYPE", req.header(header::CONTENT_TYPE).unwrap_or(""));
        }

        env.set("GATEWAY_INTERFACE", "CGI/1.1");
        env.set("SERVER_PROTOCOL", req.proto());
        env.set("SERVER_SOFTWARE", SERVER_SOFTWARE);
        env.set("REQUEST_METHOD", req.method().as_str());
        env.set("SCRIPT_NAME", location.script_name);

        if !location.path_info.is_empty() {
            env.set("PATH_INFO", location.path_info);
            let translated = location
                .document_root
                .join(location.path_info.trim_start_matches('/'));
            env.set("PATH_TRANSLATED", translated.to_string_lossy());
        }

        env.set("QUERY_STRING", req.query());

        if let Some(addr) = req.remote_addr() {
            let ip = addr.ip().to_string();
            env.set("REMOTE_ADDR", ip.as_str());
            env.set("REMOTE_HOST", ip);
        }

        if let Some(host) = req.header(header::HOST).or_else(|| req.uri().authority().map(|a| a.as_str())) {
            let (name, port) = split_host(host);
            env.set("SERVER_NAME", name);
            env.set("SERVER_PORT", port);
        }

        env.set("HTTP_USER_AGENT", req.user_agent().unwrap_or(""));
        if let Some(cookie) = req.header(header::COOKIE) {
            env.set("HTTP_COOKIE", cookie);
        }

        let path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());
        env.set("PATH", path);

        Ok(env)
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.vars.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Declared request body length, if the request had one.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Split a `Host` value into name and port, defaulting the port to 80.
fn split_host(host: &str) -> (&str, &str) {
    // Bracketed IPv6 literal.
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((addr, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').unwrap_or("80");
            return (addr, port);
        }
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => (name, port),
        _ => (host, "80"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Version;
    use std::net::SocketAddr;

    fn location<'a>(script_name: &'a str, path_info: &'a str) -> ScriptLocation<'a> {
        ScriptLocation {
            script_name,
            path_info,
            document_root: Path::new("/srv/www"),
        }
    }

    #[test]
    fn builds_meta_variables() {
        let http_req = axum::http::Request::post("/cgi-bin/env/extra?a=1&b=2")
            .version(Version::HTTP_11)
            .header("Host", "example.org:8080")
            .header("User-Agent", "probe/2")
            .header("Cookie", "session=abc")
            .header("Content-Length", "5")
            .header("Content-Type", "text/plain")
            .body(())
            .unwrap();
        let parts = http_req.into_parts().0;
        let addr: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        let req = Request::from_parts(&parts, Some(addr));

        let env = CgiEnv::build(&req, location("/cgi-bin/env", "/extra")).unwrap();

        assert_eq!(env.get("GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(env.get("SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(env.get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(env.get("SCRIPT_NAME"), Some("/cgi-bin/env"));
        assert_eq!(env.get("PATH_INFO"), Some("/extra"));
        assert_eq!(env.get("PATH_TRANSLATED"), Some("/srv/www/extra"));
        assert_eq!(env.get("QUERY_STRING"), Some("a=1&b=2"));
        assert_eq!(env.get("REMOTE_ADDR"), Some("10.1.2.3"));
        assert_eq!(env.get("REMOTE_HOST"), Some("10.1.2.3"));
        assert_eq!(env.get("SERVER_NAME"), Some("example.org"));
        assert_eq!(env.get("SERVER_PORT"), Some("8080"));
        assert_eq!(env.get("HTTP_USER_AGENT"), Some("probe/2"));
        assert_eq!(env.get("HTTP_COOKIE"), Some("session=abc"));
        assert_eq!(env.get("CONTENT_LENGTH"), Some("5"));
        assert_eq!(env.get("CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(env.content_length(), Some(5));
        assert!(env.get("PATH").is_some());
    }

    #[test]
    fn optional_variables_are_omitted() {
        let req = Request::from(&axum::http::Request::get("/env").body(()).unwrap());
        let env = CgiEnv::build(&req, location("/env", "")).unwrap();

        assert_eq!(env.get("PATH_INFO"), None);
        assert_eq!(env.get("PATH_TRANSLATED"), None);
        assert_eq!(env.get("CONTENT_LENGTH"), None);
        assert_eq!(env.get("HTTP_COOKIE"), None);
        assert_eq!(env.get("QUERY_STRING"), Some(""));
        assert_eq!(env.content_length(), None);
    }

    #[test]
    fn malformed_content_length_is_rejected() {
        let req = Request::from(
            &axum::http::Request::post("/env")
                .header("Content-Length", "ten")
                .body(())
                .unwrap(),
        );
        let err = CgiEnv::build(&req, location("/env", "")).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn host_splitting() {
        assert_eq!(split_host("example.org"), ("example.org", "80"));
        assert_eq!(split_host("example.org:81"), ("example.org", "81"));
        assert_eq!(split_host("[::1]:8080"), ("::1", "8080"));
        assert_eq!(split_host("[::1]"), ("::1", "80"));
    }
}
