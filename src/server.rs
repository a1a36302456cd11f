//! Gemini connection handling
//!
//! One task per accepted connection. Each connection carries exactly one
//! request: the handler reads the request line, validates it against the
//! TLS server name, routes it, and streams the response back while watching
//! for stray client input.

use crate::cgi::{self, CgiSettings};
use crate::config::{BackendKind, Config, ContentTypes};
use crate::error::{RequestError, Status};
use crate::response::{Request, Response};
use crate::router::Router;
use crate::static_file::StaticFiles;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Longest request line accepted, terminator included
pub const MAX_REQUEST_LINE: usize = 1024;

/// How a connection should be closed once the exchange is over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Response fully sent and the write side shut down
    Graceful,
    /// Drop the connection with a reset and no TLS close_notify
    Abort,
}

/// A finished exchange whose response has not been released yet.
///
/// The caller closes or resets the transport first, then calls
/// [`Exchange::close`], so releasing a slow backend never holds the client
/// connection open.
#[derive(Debug)]
pub struct Exchange {
    pub disposition: Disposition,
    response: Option<Response>,
}

impl Exchange {
    fn abort() -> Self {
        Self {
            disposition: Disposition::Abort,
            response: None,
        }
    }

    /// Release the files or process behind the response
    pub async fn close(mut self) {
        if let Some(response) = self.response.as_mut() {
            response.close().await;
        }
    }
}

/// Everything a connection needs, shared read-only by all connections
#[derive(Debug)]
pub struct ServerContext {
    pub router: Router,
    pub content_types: ContentTypes,
    pub cgi: CgiSettings,
    pub connection_timeout: Duration,
    pub require_sni_match: bool,
}

impl ServerContext {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            router: Router::from_config(config)?,
            content_types: config.content_types.clone(),
            cgi: CgiSettings {
                timeout: config.server.cgi_timeout(),
                grace_period: config.server.cgi_grace_period(),
            },
            connection_timeout: config.server.connection_timeout(),
            require_sni_match: config.server.require_sni_match,
        })
    }

    /// Route a request and build its (uninitialized) response
    pub async fn route(&self, req: &Request) -> (Option<String>, Response) {
        let route = match self.router.resolve(&req.url) {
            Ok(route) => route,
            Err(e) => {
                debug!(url = %req.url, error = %e, "Routing failed");
                return (None, Response::not_found());
            }
        };

        let backend = route.backend.name.clone();
        let response = match &route.backend.kind {
            BackendKind::Static { location, file_ext } => {
                let files = StaticFiles {
                    location,
                    file_ext: *file_ext,
                    options: self.router.options(),
                    content_types: &self.content_types,
                };
                files.respond(req, &route.unmatched).await
            }
            BackendKind::Cgi { script } => cgi::spawn(req, script, &self.cgi),
        };

        (Some(backend), response)
    }
}

/// TLS listener serving Gemini requests
pub struct GeminiServer {
    ctx: Arc<ServerContext>,
    tls_acceptor: TlsAcceptor,
    shutdown_rx: watch::Receiver<bool>,
}

impl GeminiServer {
    pub fn new(
        ctx: Arc<ServerContext>,
        tls_acceptor: TlsAcceptor,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            tls_acceptor,
            shutdown_rx,
        }
    }

    /// Accept connections from an already bound listener until shutdown.
    ///
    /// After shutdown, in-flight connections get up to the connection
    /// timeout to finish before this returns.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Gemini server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            let ctx = Arc::clone(&self.ctx);
                            let acceptor = self.tls_acceptor.clone();
                            connections.spawn(handle_connection(stream, remote, acceptor, ctx));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                // Reap finished connections
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gemini server shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        drain_connections(connections, self.ctx.connection_timeout).await;

        Ok(())
    }
}

/// Wait for in-flight connection tasks, aborting whatever is left after
/// `limit`
pub(crate) async fn drain_connections(mut connections: JoinSet<()>, limit: Duration) {
    if connections.is_empty() {
        return;
    }

    info!(in_flight = connections.len(), "Waiting for in-flight connections");
    let drained = tokio::time::timeout(limit, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "Shutdown timeout exceeded, aborting connections"
        );
        connections.shutdown().await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: Arc<ServerContext>,
) {
    let conn_id = Uuid::new_v4();
    let deadline = Instant::now() + ctx.connection_timeout;

    let exchange = serve_tls(stream, remote, acceptor, &ctx, conn_id);
    match tokio::time::timeout_at(deadline, exchange).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(%conn_id, remote = %remote, error = %e, "Connection error");
        }
        Err(_) => {
            debug!(%conn_id, remote = %remote, "Connection deadline exceeded");
        }
    }
}

async fn serve_tls(
    stream: TcpStream,
    remote: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: &ServerContext,
    conn_id: Uuid,
) -> io::Result<()> {
    let mut tls = acceptor.accept(stream).await?;
    let sni = tls.get_ref().1.server_name().map(str::to_string);

    let exchange = serve_request(&mut tls, remote, sni.as_deref(), ctx, conn_id).await?;
    if exchange.disposition == Disposition::Abort {
        if let Err(e) = reset_on_close(tls.get_ref().0) {
            debug!(%conn_id, error = %e, "Failed to arm connection reset");
        }
    }

    // The client sees the close before the backend is released
    drop(tls);
    exchange.close().await;

    Ok(())
}

/// Zero linger turns the close into a reset
#[allow(deprecated)]
fn reset_on_close(stream: &TcpStream) -> io::Result<()> {
    stream.set_linger(Some(Duration::ZERO))
}

/// Run one request/response exchange over an established stream.
///
/// The caller owns the transport and closes it according to the returned
/// [`Disposition`], then releases the response with [`Exchange::close`].
/// On the graceful path the write side has already been shut down.
pub async fn serve_request<S>(
    stream: &mut S,
    remote: SocketAddr,
    sni: Option<&str>,
    ctx: &ServerContext,
    conn_id: Uuid,
) -> io::Result<Exchange>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = match read_request_line(stream).await {
        Ok(line) => line,
        Err(e) => {
            debug!(%conn_id, remote = %remote, error = %e, "Failed to read request");
            return Ok(Exchange::abort());
        }
    };

    let (request, backend, mut response) =
        match parse_request(&line, remote, sni, ctx.require_sni_match) {
            Ok(request) => {
                let (backend, response) = ctx.route(&request).await;
                (Some(request), backend, response)
            }
            Err(e) => {
                debug!(%conn_id, remote = %remote, error = %e, "Rejected request");
                let status = e.status().unwrap_or(Status::BadRequest);
                (None, None, Response::status_only(status))
            }
        };

    if let Some(request) = &request {
        if let Err(e) = response.init(request).await {
            error!(%conn_id, url = %request.url, error = %e, "Failed to initialize response");
            response.close().await;
            response = Response::status_only(Status::InternalError);
        }
    }

    info!(
        %conn_id,
        remote = %remote,
        sni = sni.unwrap_or("-"),
        url = request.as_ref().map(|r| r.url.as_str()).unwrap_or("-"),
        backend = backend.as_deref().unwrap_or("-"),
        kind = response.backend_kind(),
        status = response.status().map(|s| s.code()),
        "Request"
    );

    let disposition = stream_response(stream, &mut response, conn_id).await;

    Ok(Exchange {
        disposition,
        response: Some(response),
    })
}

/// Read the request line, up to and including `\n`, stripping the
/// terminator.
pub async fn read_request_line<R>(reader: &mut R) -> Result<Vec<u8>, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    while line.len() < MAX_REQUEST_LINE {
        if reader.read(&mut byte).await? == 0 {
            return Err(RequestError::Incomplete);
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(line);
        }
        line.push(byte[0]);
    }

    Err(RequestError::TooLong(MAX_REQUEST_LINE))
}

/// Parse and validate a request line
pub fn parse_request(
    line: &[u8],
    remote: SocketAddr,
    sni: Option<&str>,
    require_sni_match: bool,
) -> Result<Request, RequestError> {
    let text = std::str::from_utf8(line).map_err(|_| RequestError::InvalidUtf8)?;
    let url = Url::parse(text)?;

    if url.scheme() != "gemini" {
        return Err(RequestError::UnsupportedScheme(url.scheme().to_string()));
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or(RequestError::MissingHost)?;

    if require_sni_match && !sni.is_some_and(|name| name.eq_ignore_ascii_case(host)) {
        return Err(RequestError::SniMismatch {
            host: host.to_string(),
            sni: sni.map(str::to_string),
        });
    }

    Ok(Request::new(url, remote))
}

/// Copy the response to the client while guarding against client input.
///
/// Both sides run until they are done; whichever fails first stops the
/// other.
async fn stream_response<S>(stream: &mut S, response: &mut Response, conn_id: Uuid) -> Disposition
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (abort_tx, mut abort_rx) = watch::channel(false);
    let (done_tx, mut done_rx) = watch::channel(false);

    let send = async {
        let outcome = tokio::select! {
            result = copy_and_close(response, &mut writer) => match result {
                Ok(bytes) => {
                    debug!(%conn_id, bytes, "Response sent");
                    Disposition::Graceful
                }
                Err(e) => {
                    debug!(%conn_id, error = %e, "Response stream failed");
                    Disposition::Abort
                }
            },
            _ = abort_rx.changed() => Disposition::Abort,
        };
        let _ = done_tx.send(true);
        outcome
    };

    let guard = async {
        let mut byte = [0u8; 1];
        let outcome = tokio::select! {
            result = reader.read(&mut byte) => match result {
                // Client closed its write side, which is allowed
                Ok(0) => Disposition::Graceful,
                Ok(_) => {
                    debug!(%conn_id, "Client sent data after the request");
                    Disposition::Abort
                }
                Err(e) => {
                    debug!(%conn_id, error = %e, "Client read failed");
                    Disposition::Abort
                }
            },
            _ = done_rx.changed() => Disposition::Graceful,
        };
        if outcome == Disposition::Abort {
            let _ = abort_tx.send(true);
        }
        outcome
    };

    match tokio::join!(send, guard) {
        (Disposition::Graceful, Disposition::Graceful) => Disposition::Graceful,
        _ => Disposition::Abort,
    }
}

async fn copy_and_close<W>(response: &mut Response, writer: &mut W) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let bytes = tokio::io::copy(response, writer).await?;
    writer.shutdown().await?;
    Ok(bytes)
}
