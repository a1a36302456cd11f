//! CGI gateway
//!
//! Runs a script per request. The script gets request metadata through a
//! fixed set of environment variables and the raw request line on stdin.
//! Its stdout is the response, status line included.
//!
//! Each script is watched by a supervisor task that enforces the timeout
//! and terminates the process (SIGTERM, then SIGKILL after the grace period)
//! when it runs too long or the response is closed early. Failures show up
//! as read errors on the response stream, never as a clean end of stream.

use crate::error::{CgiError, Status};
use crate::response::{Request, Response};
use crate::{PKG_NAME, VERSION};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, error, warn};

/// Limits applied to every script run
#[derive(Debug, Clone, Copy)]
pub struct CgiSettings {
    /// Maximum runtime before the script is terminated
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL, also the time allowed for stdout to
    /// close once the script has exited
    pub grace_period: Duration,
}

impl Default for CgiSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// How the supervisor saw the script end
#[derive(Debug, Clone, Copy)]
enum ExitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed,
}

impl ExitOutcome {
    /// Error to report once stdout is exhausted, `None` for a clean exit
    fn error(self) -> Option<CgiError> {
        match self {
            ExitOutcome::Exited(status) if status.success() => None,
            ExitOutcome::Exited(status) => Some(match status.code() {
                Some(code) => CgiError::Exit(code),
                None => CgiError::Signal,
            }),
            ExitOutcome::TimedOut => Some(CgiError::Timeout),
            ExitOutcome::Cancelled => Some(CgiError::Cancelled),
            ExitOutcome::WaitFailed => Some(CgiError::Wait),
        }
    }
}

/// Output of a running CGI script
#[derive(Debug)]
pub struct CgiResponse {
    script: PathBuf,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    exit_rx: Option<oneshot::Receiver<ExitOutcome>>,
    outcome: Option<ExitOutcome>,
    cancel_tx: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
    /// Started when the script has exited but stdout is still open
    drain_deadline: Option<Pin<Box<Sleep>>>,
    grace_period: Duration,
    failed: Option<CgiError>,
}

/// Start `script` for `req`.
///
/// A script that cannot be started yields a `43 CGI Error` response instead
/// of an error.
pub fn spawn(req: &Request, script: &Path, settings: &CgiSettings) -> Response {
    let mut cmd = Command::new(script);
    cmd.env_clear();
    cmd.envs(cgi_env(req, script));
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(script = %script.display(), error = %e, "Error running CGI script");
            return Response::status_only(Status::CgiError);
        }
    };

    debug!(script = %script.display(), pid = child.id().unwrap_or(0), "CGI script started");

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(stderr, script.to_path_buf()));
    }

    let (exit_tx, exit_rx) = oneshot::channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let supervisor = tokio::spawn(supervise(
        child,
        *settings,
        cancel_rx,
        exit_tx,
        script.to_path_buf(),
    ));

    Response::Cgi(CgiResponse {
        script: script.to_path_buf(),
        stdin,
        stdout,
        exit_rx: Some(exit_rx),
        outcome: None,
        cancel_tx: Some(cancel_tx),
        supervisor: Some(supervisor),
        drain_deadline: None,
        grace_period: settings.grace_period,
        failed: None,
    })
}

/// The environment a script runs with. Nothing else is inherited.
fn cgi_env(req: &Request, script: &Path) -> Vec<(&'static str, String)> {
    let raw_path = req.url.path();
    let path = urlencoding::decode(raw_path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| raw_path.to_string());
    let remote = req.remote_addr.ip().to_string();

    vec![
        ("GATEWAY_INTERFACE", "CGI/1.1".to_string()),
        ("SERVER_PROTOCOL", "GEMINI".to_string()),
        ("REQUEST_METHOD", String::new()),
        ("SERVER_SOFTWARE", format!("{}/{}", PKG_NAME, VERSION)),
        ("GEMINI_URL", req.url.to_string()),
        ("GEMINI_URL_PATH", path.clone()),
        ("PATH_INFO", path),
        ("QUERY_STRING", req.url.query().unwrap_or_default().to_string()),
        ("SCRIPT_NAME", script.display().to_string()),
        ("SERVER_NAME", req.url.host_str().unwrap_or_default().to_string()),
        ("REMOTE_ADDR", remote.clone()),
        ("REMOTE_HOST", remote),
    ]
}

async fn drain_stderr(stderr: ChildStderr, script: PathBuf) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                debug!(script = %script.display(), "stderr: {}", text.trim_end());
            }
            Err(e) => {
                debug!(script = %script.display(), error = %e, "Error reading CGI stderr");
                break;
            }
        }
    }
}

/// Wait for the script to exit, time out, or be cancelled. Reports the
/// outcome before tearing the process down.
async fn supervise(
    mut child: Child,
    settings: CgiSettings,
    cancel_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<ExitOutcome>,
    script: PathBuf,
) {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ExitOutcome::Exited(status),
            Err(e) => {
                warn!(script = %script.display(), error = %e, "Error waiting for CGI script");
                ExitOutcome::WaitFailed
            }
        },
        _ = tokio::time::sleep(settings.timeout) => {
            warn!(
                script = %script.display(),
                timeout_secs = settings.timeout.as_secs(),
                "CGI script timeout"
            );
            ExitOutcome::TimedOut
        }
        _ = cancel_rx => ExitOutcome::Cancelled,
    };

    let _ = exit_tx.send(outcome);

    if let ExitOutcome::Exited(status) = outcome {
        debug!(script = %script.display(), ?status, "CGI script exited");
    } else {
        terminate(&mut child, settings.grace_period, &script).await;
    }
}

/// SIGTERM, then SIGKILL once the grace period has passed
async fn terminate(child: &mut Child, grace_period: Duration, script: &Path) {
    if let Some(pid) = child.id() {
        debug!(script = %script.display(), pid, "Sending SIGTERM to CGI script");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(script = %script.display(), ?status, "CGI script terminated");
        }
        Ok(Err(e)) => {
            warn!(script = %script.display(), error = %e, "Error waiting for CGI script to exit");
        }
        Err(_) => {
            warn!(
                script = %script.display(),
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

impl CgiResponse {
    /// Send the request line to the script and close its stdin.
    ///
    /// Scripts are free to exit without reading stdin.
    pub(crate) async fn init(&mut self, req: &Request) -> io::Result<()> {
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(());
        };

        let line = format!("{}\r\n", req.url);
        match stdin.write_all(line.as_bytes()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(script = %self.script.display(), "CGI script closed stdin early");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Close the pipes and stop the script if it is still running.
    pub(crate) async fn close(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.drain_deadline = None;

        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }

        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                warn!(script = %self.script.display(), error = %e, "CGI supervisor task failed");
            }
        }
    }

    fn poll_outcome(&mut self, cx: &mut Context<'_>) {
        if self.outcome.is_some() {
            return;
        }
        if let Some(exit_rx) = self.exit_rx.as_mut() {
            if let Poll::Ready(result) = Pin::new(exit_rx).poll(cx) {
                self.outcome = Some(result.unwrap_or(ExitOutcome::WaitFailed));
                self.exit_rx = None;
            }
        }
    }

    fn fail(&mut self, err: CgiError) -> Poll<io::Result<()>> {
        self.failed = Some(err);
        Poll::Ready(Err(err.into()))
    }
}

impl AsyncRead for CgiResponse {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(err) = this.failed {
            return Poll::Ready(Err(err.into()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        this.poll_outcome(cx);
        match this.outcome {
            Some(ExitOutcome::TimedOut) => return this.fail(CgiError::Timeout),
            Some(ExitOutcome::Cancelled) => return this.fail(CgiError::Cancelled),
            _ => {}
        }

        let Some(stdout) = this.stdout.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let filled = buf.filled().len();
        match Pin::new(stdout).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() > filled => {
                this.drain_deadline = None;
                Poll::Ready(Ok(()))
            }
            // stdout closed; the exit status decides between EOF and error
            Poll::Ready(Ok(())) => match this.outcome {
                None => Poll::Pending,
                Some(outcome) => match outcome.error() {
                    None => Poll::Ready(Ok(())),
                    Some(err) => this.fail(err),
                },
            },
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                if this.outcome.is_none() {
                    return Poll::Pending;
                }
                let grace_period = this.grace_period;
                let deadline = this
                    .drain_deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(grace_period)));
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => this.fail(CgiError::OutputNotClosed),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::AsyncReadExt;
    use url::Url;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\nPATH=/usr/local/bin:/usr/bin:/bin\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request(url: &str) -> Request {
        Request::new(Url::parse(url).unwrap(), "192.0.2.7:40000".parse().unwrap())
    }

    fn settings(timeout_secs: u64) -> CgiSettings {
        CgiSettings {
            timeout: Duration::from_secs(timeout_secs),
            grace_period: Duration::from_secs(1),
        }
    }

    /// Read until EOF or error, returning the bytes seen and the error
    async fn read_all(response: &mut Response) -> (Vec<u8>, Option<io::Error>) {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match response.read(&mut buf).await {
                Ok(0) => return (out, None),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => return (out, Some(e)),
            }
        }
    }

    #[tokio::test]
    async fn test_successful_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ok.sh", "printf '20 text/gemini\\r\\nhello\\n'\n");
        let req = request("gemini://example.org/ok");

        let mut response = spawn(&req, &script, &settings(5));
        assert_eq!(response.backend_kind(), "cgi");
        assert_eq!(response.status(), None);
        response.init(&req).await.unwrap();

        let (out, err) = read_all(&mut response).await;
        response.close().await;

        assert!(err.is_none(), "unexpected error: {:?}", err);
        assert_eq!(out, b"20 text/gemini\r\nhello\n");
    }

    #[tokio::test]
    async fn test_environment_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "env.sh",
            r#"printf '20 text/plain\r\n'
echo "$GATEWAY_INTERFACE|$SERVER_PROTOCOL|$REQUEST_METHOD|$GEMINI_URL"
echo "$GEMINI_URL_PATH|$PATH_INFO|$QUERY_STRING|$SERVER_NAME"
echo "$REMOTE_ADDR|$REMOTE_HOST|$SCRIPT_NAME|$SERVER_SOFTWARE"
echo "${HOME:-no home}"
"#,
        );
        let req = request("gemini://example.org/app/hello%20there?name=x");

        let mut response = spawn(&req, &script, &settings(5));
        response.init(&req).await.unwrap();
        let (out, err) = read_all(&mut response).await;
        response.close().await;
        assert!(err.is_none());

        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "20 text/plain");
        assert_eq!(
            lines[1],
            "CGI/1.1|GEMINI||gemini://example.org/app/hello%20there?name=x"
        );
        assert_eq!(lines[2], "/app/hello there|/app/hello there|name=x|example.org");
        assert_eq!(
            lines[3],
            format!(
                "192.0.2.7|192.0.2.7|{}|{}/{}",
                script.display(),
                PKG_NAME,
                VERSION
            )
        );
        assert_eq!(lines[4], "no home");
    }

    #[tokio::test]
    async fn test_request_line_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "stdin.sh",
            "read -r line\nprintf '20 text/plain\\r\\n%s\\n' \"$line\"\n",
        );
        let req = request("gemini://example.org/echo");

        let mut response = spawn(&req, &script, &settings(5));
        response.init(&req).await.unwrap();
        let (out, err) = read_all(&mut response).await;
        response.close().await;

        assert!(err.is_none());
        assert_eq!(out, b"20 text/plain\r\ngemini://example.org/echo\r\n");
    }

    #[tokio::test]
    async fn test_script_ignoring_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "quiet.sh", "exit 0\n");
        let req = request("gemini://example.org/");

        let mut response = spawn(&req, &script, &settings(5));
        // Broken pipe on stdin is not an init failure
        response.init(&req).await.unwrap();
        let (out, err) = read_all(&mut response).await;
        response.close().await;

        assert!(err.is_none());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_non_zero_exit_after_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "fail.sh",
            "printf '20 text/gemini\\r\\npartial\\n'\nexit 2\n",
        );
        let req = request("gemini://example.org/fail");

        let mut response = spawn(&req, &script, &settings(5));
        response.init(&req).await.unwrap();
        let (out, err) = read_all(&mut response).await;

        assert_eq!(out, b"20 text/gemini\r\npartial\n");
        let err = err.expect("exit code 2 must surface as an error");
        assert_eq!(CgiError::from_io(&err), Some(CgiError::Exit(2)));

        // The error sticks
        let mut buf = [0u8; 8];
        let again = response.read(&mut buf).await.unwrap_err();
        assert_eq!(CgiError::from_io(&again), Some(CgiError::Exit(2)));

        response.close().await;
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "slow.sh",
            "printf '20 text/gemini\\r\\n'\nsleep 30\nprintf 'too late\\n'\n",
        );
        let req = request("gemini://example.org/slow");

        let mut response = spawn(&req, &script, &settings(1));
        response.init(&req).await.unwrap();

        let started = tokio::time::Instant::now();
        let (out, err) = read_all(&mut response).await;
        let err = err.expect("timeout must not look like a clean EOF");

        assert_eq!(CgiError::from_io(&err), Some(CgiError::Timeout));
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(!String::from_utf8_lossy(&out).contains("too late"));
        assert!(started.elapsed() < Duration::from_secs(10));

        tokio::time::timeout(Duration::from_secs(10), response.close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_stops_running_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "forever.sh", "exec sleep 30\n");
        let req = request("gemini://example.org/forever");

        let mut response = spawn(&req, &script, &settings(60));
        response.init(&req).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), response.close())
            .await
            .expect("close must not wait for the script to finish");
        // Idempotent
        response.close().await;
    }

    fn read_pid(path: &Path) -> i32 {
        std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    fn process_exists(pid: i32) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }

    /// Script that ignores SIGTERM and records its pid
    fn stubborn_script(dir: &Path, pid_file: &Path) -> PathBuf {
        write_script(
            dir,
            "stubborn.sh",
            &format!(
                "trap '' TERM\necho $$ > '{}'\nprintf '20 text/gemini\\r\\n'\n\
                 while true; do sleep 1; done\n",
                pid_file.display()
            ),
        )
    }

    #[tokio::test]
    async fn test_stdout_held_open_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        // The background sleep keeps stdout open after the script exits
        let script = write_script(
            dir.path(),
            "orphan.sh",
            &format!(
                "sleep 30 2>/dev/null &\necho $! > '{}'\nprintf '20 text/gemini\\r\\n'\nexit 0\n",
                pid_file.display()
            ),
        );
        let req = request("gemini://example.org/orphan");

        let mut response = spawn(&req, &script, &settings(60));
        response.init(&req).await.unwrap();

        let started = tokio::time::Instant::now();
        let (out, err) = tokio::time::timeout(Duration::from_secs(10), read_all(&mut response))
            .await
            .expect("held stdout must not block forever");
        let err = err.expect("unclosed stdout must surface as an error");

        assert_eq!(out, b"20 text/gemini\r\n");
        assert_eq!(CgiError::from_io(&err), Some(CgiError::OutputNotClosed));
        assert!(started.elapsed() >= Duration::from_millis(900));

        response.close().await;
        unsafe {
            libc::kill(read_pid(&pid_file), libc::SIGKILL);
        }
    }

    #[tokio::test]
    async fn test_close_kills_script_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("script.pid");
        let script = stubborn_script(dir.path(), &pid_file);
        let req = request("gemini://example.org/stubborn");

        let mut response = spawn(&req, &script, &settings(60));
        response.init(&req).await.unwrap();

        let mut header = [0u8; 16];
        response.read_exact(&mut header).await.unwrap();
        assert_eq!(&header, b"20 text/gemini\r\n");
        let pid = read_pid(&pid_file);
        assert!(process_exists(pid));

        let started = tokio::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(10), response.close())
            .await
            .expect("SIGKILL must follow the grace period");

        assert!(started.elapsed() >= Duration::from_millis(900));
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_timeout_kills_script_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("script.pid");
        let script = stubborn_script(dir.path(), &pid_file);
        let req = request("gemini://example.org/stubborn");

        let mut response = spawn(&req, &script, &settings(1));
        response.init(&req).await.unwrap();

        let (out, err) = tokio::time::timeout(Duration::from_secs(10), read_all(&mut response))
            .await
            .expect("timeout must end the read");
        assert_eq!(out, b"20 text/gemini\r\n");
        assert_eq!(
            CgiError::from_io(&err.expect("timeout is an error")),
            Some(CgiError::Timeout)
        );
        let pid = read_pid(&pid_file);

        tokio::time::timeout(Duration::from_secs(10), response.close())
            .await
            .expect("SIGKILL must follow the grace period");
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_missing_script_yields_cgi_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let req = request("gemini://example.org/missing");

        let mut response = spawn(&req, &dir.path().join("missing.sh"), &settings(5));
        assert_eq!(response.backend_kind(), "error");
        assert_eq!(response.status(), Some(Status::CgiError));

        response.init(&req).await.unwrap();
        let (out, err) = read_all(&mut response).await;
        assert!(err.is_none());
        assert_eq!(out, b"43 CGI Error\r\n");
    }
}
