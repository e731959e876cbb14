//! CGI gateway source.
//!
//! # Responsibilities
//! - Map the request to a script (single script or directory of scripts)
//! - Spawn the script with a CGI/1.1 environment
//! - Feed the declared request body to stdin
//! - Parse the header block and stream the body into the content pipe
//!
//! # Design Decisions
//! - Outputs up to `buffer_limit` bytes are held back until the child exits,
//!   so a failing exit status can still become a 500
//! - Larger outputs stream; a late failure is only logged
//! - The request body is copied to stdin on its own task while stdout is
//!   read; its outcome is joined before the exit status is judged
//! - The child is killed if its handle is dropped before it exits

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::cgi::env::{CgiEnv, ScriptLocation};
use crate::cgi::headers::{parse_headers, CgiHeaders};
use crate::cgi::translate::translate_path;
use crate::component::{spawn_producer, Source};
use crate::conn::{Connection, ContentWriter};
use crate::error::{PipeError, PipelineError};
use crate::http::Request;
use crate::observability::metrics;

/// Default amount of script output held back while waiting for the exit
/// status.
pub const DEFAULT_BUFFER_LIMIT: usize = 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct CgiOptions {
    /// Output bytes buffered before committing to a streamed response.
    pub buffer_limit: usize,
    /// Follow symbolic links while locating scripts in directory mode.
    pub follow_symlinks: bool,
    /// Base for `PATH_TRANSLATED`; defaults to the script's directory.
    pub document_root: Option<PathBuf>,
}

impl Default for CgiOptions {
    fn default() -> Self {
        Self {
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            follow_symlinks: false,
            document_root: None,
        }
    }
}

#[derive(Debug, Clone)]
enum Mode {
    /// Every request under the prefix runs this script.
    Script(PathBuf),
    /// Requests under the prefix name a script inside this directory.
    Dir(PathBuf),
}

/// A Source that runs CGI scripts.
#[derive(Debug, Clone)]
pub struct CgiGateway {
    mode: Mode,
    prefix: String,
    options: CgiOptions,
}

impl CgiGateway {
    /// Run `script` for every request under `prefix`; the rest of the path
    /// becomes `PATH_INFO`.
    pub fn script(script: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            mode: Mode::Script(script.into()),
            prefix: prefix.into(),
            options: CgiOptions::default(),
        }
    }

    /// Locate scripts under `base` using the path after `prefix`.
    pub fn dir(base: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            mode: Mode::Dir(base.into()),
            prefix: prefix.into(),
            options: CgiOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CgiOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolve the request to (script, SCRIPT_NAME, PATH_INFO).
    async fn locate(&self, req: &Request) -> Result<(PathBuf, String, String), PipelineError> {
        let path = req.path();
        let rest = path
            .strip_prefix(self.prefix.as_str())
            .ok_or_else(|| PipelineError::NotFound(path.to_string()))?;

        match &self.mode {
            Mode::Script(script) => Ok((script.clone(), self.prefix.clone(), rest.to_string())),
            Mode::Dir(base) => {
                let found = translate_path(rest, base, self.options.follow_symlinks).await?;
                let script_name = format!("{}/{}", self.prefix.trim_end_matches('/'), found.relative);
                Ok((found.script, script_name, found.path_info))
            }
        }
    }

    async fn run(
        &self,
        conn: &mut Connection,
        req: &Request,
        writer: ContentWriter,
    ) -> Result<(), PipelineError> {
        let (script, script_name, path_info) = self.locate(req).await?;
        let script_dir = script.parent().map(Path::to_path_buf).unwrap_or_default();
        let document_root = self.options.document_root.clone().unwrap_or_else(|| script_dir.clone());

        let env = CgiEnv::build(
            req,
            ScriptLocation {
                script_name: &script_name,
                path_info: &path_info,
                document_root: &document_root,
            },
        )?;

        let mut command = Command::new(&script);
        command
            .env_clear()
            .envs(env.iter())
            .stdin(if env.content_length().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !script_dir.as_os_str().is_empty() {
            command.current_dir(&script_dir);
        }

        let mut child = command.spawn().map_err(|e| {
            PipelineError::UpstreamFailure(format!("could not run {}: {}", script.display(), e))
        })?;
        tracing::debug!(
            connection_id = %conn.id(),
            script = %script.display(),
            script_name = %script_name,
            path_info = %path_info,
            "CGI script started"
        );

        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(script.clone(), stderr);
        }

        // The body is fed while stdout is read, so a script echoing its input
        // never blocks on a full pipe.
        let mut stdin_copy = match (env.content_length(), child.stdin.take()) {
            (Some(expected), Some(stdin)) => {
                let body = conn.take_request_body().unwrap_or_else(Body::empty);
                StdinCopy::spawn(body, stdin, expected)
            }
            _ => StdinCopy::none(),
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::UpstreamFailure("script stdout unavailable".to_string()))?;
        let mut stdout = BufReader::new(stdout);
        let headers = match parse_headers(&mut stdout).await {
            Ok(headers) => headers,
            Err(e) => {
                tracing::warn!(script = %script.display(), reason = e.reason(), "Bad CGI header block");
                return Err(e.into());
            }
        };

        let (buffered, finished) = read_up_to(&mut stdout, self.options.buffer_limit).await?;

        if finished {
            stdin_copy.finish().await?;
            let status = child
                .wait()
                .await
                .map_err(|e| PipelineError::UpstreamFailure(e.to_string()))?;
            check_exit(status)?;
            apply_headers(conn, headers);
            spawn_producer(conn, writer, |mut writer| async move {
                let _ = writer.write(buffered).await;
            });
            return Ok(());
        }

        apply_headers(conn, headers);
        let id = conn.id();
        spawn_producer(conn, writer, move |mut writer| async move {
            if stream_rest(buffered, stdout, &mut writer).await.is_err() {
                tracing::debug!(connection_id = %id, "Client went away during CGI output");
            }
            let mut stdin_copy = stdin_copy;
            let fed = stdin_copy.finish().await;
            let exited = fed.and(
                child
                    .wait()
                    .await
                    .map_err(|e| PipelineError::UpstreamFailure(e.to_string()))
                    .and_then(check_exit),
            );
            match exited {
                Ok(()) => {}
                Err(e) => {
                    metrics::record_cgi_failure("late_exit_status");
                    tracing::error!(connection_id = %id, error = %e, "CGI script failed after streaming began");
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Source for CgiGateway {
    async fn produce(&self, conn: &mut Connection, req: &Request, writer: ContentWriter) -> bool {
        if let Err(e) = self.run(conn, req, writer).await {
            match &e {
                PipelineError::NotFound(path) => {
                    tracing::debug!(connection_id = %conn.id(), path = %path, "No CGI script for path");
                }
                _ => {
                    metrics::record_cgi_failure(e.kind());
                    tracing::error!(connection_id = %conn.id(), path = %req.path(), error = %e, "CGI request failed");
                }
            }
            conn.status_response(e.status());
        }
        true
    }

    fn name(&self) -> &'static str {
        "cgi"
    }
}

fn apply_headers(conn: &mut Connection, headers: CgiHeaders) {
    conn.set_status(headers.status);
    for (name, value) in headers.headers.iter() {
        conn.set_header(name.clone(), value.clone());
    }
}

fn check_exit(status: ExitStatus) -> Result<(), PipelineError> {
    if status.success() {
        Ok(())
    } else {
        Err(PipelineError::UpstreamFailure(format!("script exited with {}", status)))
    }
}

/// Request body copy running beside the stdout reader. Aborted if dropped
/// before it is joined.
struct StdinCopy(Option<JoinHandle<Result<(), PipelineError>>>);

impl StdinCopy {
    fn none() -> Self {
        Self(None)
    }

    fn spawn(body: Body, stdin: ChildStdin, expected: u64) -> Self {
        Self(Some(tokio::spawn(copy_request_body(body, stdin, expected))))
    }

    /// Wait for the copy and report a short or failed body.
    async fn finish(&mut self) -> Result<(), PipelineError> {
        let Some(task) = self.0.take() else {
            return Ok(());
        };
        task.await
            .map_err(|e| PipelineError::UpstreamFailure(format!("stdin copy task: {}", e)))?
    }
}

impl Drop for StdinCopy {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

/// Copy exactly `expected` bytes of the request body into the script.
/// Dropping `stdin` at the end signals EOF.
async fn copy_request_body(body: Body, mut stdin: ChildStdin, expected: u64) -> Result<(), PipelineError> {
    let mut stream = body.into_data_stream();
    let mut copied = 0u64;
    while copied < expected {
        let Some(chunk) = stream.next().await else {
            break;
        };
        let chunk = chunk.map_err(|e| PipelineError::UpstreamFailure(format!("request body: {}", e)))?;
        let take = chunk.len().min((expected - copied) as usize);
        stdin
            .write_all(&chunk[..take])
            .await
            .map_err(|e| PipelineError::UpstreamFailure(format!("writing to script stdin: {}", e)))?;
        copied += take as u64;
    }
    if copied != expected {
        return Err(PipelineError::ProtocolViolation(format!(
            "short request body: {} of {} bytes",
            copied, expected
        )));
    }
    stdin
        .flush()
        .await
        .map_err(|e| PipelineError::UpstreamFailure(format!("writing to script stdin: {}", e)))
}

/// Read until EOF or until more than `limit` bytes have arrived. Returns
/// the bytes and whether EOF was reached.
async fn read_up_to<R>(reader: &mut R, limit: usize) -> Result<(Vec<u8>, bool), PipelineError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| PipelineError::UpstreamFailure(format!("reading script output: {}", e)))?;
        if n == 0 {
            return Ok((buf, true));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit {
            return Ok((buf, false));
        }
    }
}

async fn stream_rest(
    head: Vec<u8>,
    mut stdout: BufReader<ChildStdout>,
    writer: &mut ContentWriter,
) -> Result<(), PipeError> {
    writer.write(head).await?;
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => return Ok(()),
            Ok(n) => writer.write(Bytes::copy_from_slice(&chunk[..n])).await?,
            Err(e) => {
                tracing::warn!(error = %e, "Reading CGI output failed mid-stream");
                return Ok(());
            }
        }
    }
}

fn spawn_stderr_logger(script: PathBuf, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(script = %script.display(), "{}", line);
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::component::testing::{body_text, request};
    use crate::component::Component;
    use axum::http::StatusCode;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn run(gateway: CgiGateway, conn: &mut Connection, req: &Request) {
        assert!(Component::source(gateway).handle(conn, req).await);
    }

    #[tokio::test]
    async fn script_mode_sets_script_name_and_path_info() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "env.sh",
            r#"printf 'Content-Type: text/plain\r\n\r\n'
printf 'SCRIPT_NAME=%s\n' "$SCRIPT_NAME"
printf 'PATH_INFO=%s\n' "$PATH_INFO"
printf 'QUERY_STRING=%s\n' "$QUERY_STRING"
printf 'GATEWAY_INTERFACE=%s\n' "$GATEWAY_INTERFACE"
"#,
        );

        let mut conn = Connection::detached();
        run(CgiGateway::script(script, "/env"), &mut conn, &request("/env/extra?x=1")).await;

        let response = conn.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(
            body_text(response).await,
            "SCRIPT_NAME=/env\nPATH_INFO=/extra\nQUERY_STRING=x=1\nGATEWAY_INTERFACE=CGI/1.1\n"
        );
    }

    #[tokio::test]
    async fn status_header_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "missing.sh",
            "printf 'Status: 404 Not Found\\r\\nContent-Type: text/plain\\r\\n\\r\\nbody'\n",
        );

        let mut conn = Connection::detached();
        run(CgiGateway::script(script, "/missing"), &mut conn, &request("/missing")).await;

        let response = conn.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("status").is_none());
        assert_eq!(body_text(response).await, "body");
    }

    #[tokio::test]
    async fn failing_exit_becomes_500() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "fail.sh",
            "printf 'Content-Type: text/plain\\n\\npartial'\nexit 3\n",
        );

        let mut conn = Connection::detached();
        run(CgiGateway::script(script, "/fail"), &mut conn, &request("/fail")).await;

        let response = conn.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "Internal Server Error\n");
    }

    #[tokio::test]
    async fn oversized_header_line_becomes_500() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "big.sh",
            "printf 'X-Big: '\nhead -c 5000 /dev/zero | tr '\\0' 'a'\nprintf '\\nContent-Type: text/plain\\n\\n'\n",
        );

        let mut conn = Connection::detached();
        run(CgiGateway::script(script, "/big"), &mut conn, &request("/big")).await;
        assert_eq!(conn.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn request_body_reaches_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "echo.sh",
            "printf 'Content-Type: text/plain\\n\\n'\nprintf '%s:' \"$CONTENT_LENGTH\"\ncat\n",
        );

        let http_req = axum::http::Request::post("/echo")
            .header("Content-Length", "5")
            .body(())
            .unwrap();
        let req = Request::from(&http_req);
        let mut conn = Connection::new(Body::from("hello"));
        run(CgiGateway::script(script, "/echo"), &mut conn, &req).await;

        assert_eq!(body_text(conn.into_response()).await, "5:hello");
    }

    #[tokio::test]
    async fn echo_of_body_larger_than_pipe_completes() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "cat.sh", "printf 'Content-Type: text/plain\\n\\n'\ncat\n");
        let payload = vec![b'p'; 300_000];

        for buffer_limit in [DEFAULT_BUFFER_LIMIT, 4096] {
            let http_req = axum::http::Request::post("/cat")
                .header("Content-Length", payload.len().to_string())
                .body(())
                .unwrap();
            let req = Request::from(&http_req);
            let mut conn = Connection::new(Body::from(payload.clone()));
            let gateway = CgiGateway::script(&script, "/cat").with_options(CgiOptions {
                buffer_limit,
                ..CgiOptions::default()
            });

            tokio::time::timeout(std::time::Duration::from_secs(10), run(gateway, &mut conn, &req))
                .await
                .expect("echo must not stall");

            let response = conn.into_response();
            assert_eq!(response.status(), StatusCode::OK, "limit {}", buffer_limit);
            let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(body.len(), payload.len(), "limit {}", buffer_limit);
        }
    }

    #[tokio::test]
    async fn short_request_body_becomes_500() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo.sh", "printf 'Content-Type: text/plain\\n\\n'\ncat\n");

        let http_req = axum::http::Request::post("/echo")
            .header("Content-Length", "50")
            .body(())
            .unwrap();
        let req = Request::from(&http_req);
        let mut conn = Connection::new(Body::from("short"));
        run(CgiGateway::script(script, "/echo"), &mut conn, &req).await;

        assert_eq!(conn.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn dir_mode_locates_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tools")).unwrap();
        write_script(
            &dir.path().join("tools"),
            "hello.sh",
            r#"printf 'Content-Type: text/plain\n\n'
printf '%s|%s|%s' "$SCRIPT_NAME" "$PATH_INFO" "$(basename "$(pwd)")"
"#,
        );
        let gateway = CgiGateway::dir(dir.path(), "/cgi-bin");

        let mut conn = Connection::detached();
        run(gateway.clone(), &mut conn, &request("/cgi-bin/tools/hello.sh/more")).await;
        assert_eq!(
            body_text(conn.into_response()).await,
            "/cgi-bin/tools/hello.sh|/more|tools"
        );

        let mut conn = Connection::detached();
        run(gateway, &mut conn, &request("/cgi-bin/tools/absent.sh")).await;
        assert_eq!(conn.status(), Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn large_output_streams() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "large.sh",
            "printf 'Content-Type: application/octet-stream\\n\\n'\nhead -c 100000 /dev/zero\n",
        );
        let gateway = CgiGateway::script(script, "/large").with_options(CgiOptions {
            buffer_limit: 1024,
            ..CgiOptions::default()
        });

        let mut conn = Connection::detached();
        run(gateway, &mut conn, &request("/large")).await;

        let response = conn.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 100_000);
    }
}
