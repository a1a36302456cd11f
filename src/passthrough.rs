//! SNI passthrough proxy
//!
//! Forwards TLS connections to upstreams without terminating them. The
//! ClientHello is read through a recording adapter so rustls can parse the
//! SNI hostname; the recorded bytes are then replayed to the chosen upstream
//! and the rest of the connection is tunneled untouched.

use crate::config::{Config, Upstream};
use crate::server::drain_connections;
use rustls::server::Acceptor;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Hostname to upstream lookup, case-insensitive
#[derive(Debug, Clone, Default)]
pub struct UpstreamTable {
    by_hostname: HashMap<String, Upstream>,
}

impl UpstreamTable {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut table = Self::default();
        for route in &config.sni_routes {
            let upstream = config.upstream(&route.upstream).ok_or_else(|| {
                anyhow::anyhow!("SNI route {} refers to unknown upstream {}", route.hostname, route.upstream)
            })?;
            table.insert(&route.hostname, upstream.clone());
        }
        Ok(table)
    }

    pub fn insert(&mut self, hostname: &str, upstream: Upstream) {
        self.by_hostname.insert(normalize_hostname(hostname), upstream);
    }

    pub fn lookup(&self, hostname: &str) -> Option<&Upstream> {
        self.by_hostname.get(&normalize_hostname(hostname))
    }

    pub fn len(&self) -> usize {
        self.by_hostname.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hostname.is_empty()
    }
}

fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}

/// Passes reads through while keeping a copy; swallows writes
struct Recorder<'a, S> {
    inner: &'a mut S,
    recorded: Vec<u8>,
}

impl<S: AsyncRead + Unpin> AsyncRead for Recorder<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;
        this.recorded.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for Recorder<'_, S> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// What was learned from the start of a TLS connection
#[derive(Debug)]
pub struct ClientHelloPeek {
    /// SNI hostname, lowercased
    pub server_name: Option<String>,
    /// Every byte read from the client so far
    pub recorded: Vec<u8>,
}

/// Read the ClientHello from `stream` without answering it.
///
/// The handshake is never completed; nothing is written to the client.
pub async fn peek_client_hello<S>(stream: &mut S) -> io::Result<ClientHelloPeek>
where
    S: AsyncRead + Unpin,
{
    let mut recorder = Recorder {
        inner: stream,
        recorded: Vec::new(),
    };

    let server_name = {
        let start = LazyConfigAcceptor::new(Acceptor::default(), &mut recorder).await?;
        start.client_hello().server_name().map(normalize_hostname)
    };

    Ok(ClientHelloPeek {
        server_name,
        recorded: recorder.recorded,
    })
}

/// How long tunnels may keep running after shutdown unless configured
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Listener that routes raw TLS connections by SNI
pub struct PassthroughServer {
    upstreams: Arc<UpstreamTable>,
    client_hello_timeout: Duration,
    drain_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl PassthroughServer {
    pub fn new(
        upstreams: Arc<UpstreamTable>,
        client_hello_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            upstreams,
            client_hello_timeout,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            shutdown_rx,
        }
    }

    /// Bound on how long open tunnels may continue after shutdown
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, upstreams = self.upstreams.len(), "Passthrough proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            let upstreams = Arc::clone(&self.upstreams);
                            let hello_timeout = self.client_hello_timeout;
                            connections.spawn(async move {
                                let conn_id = Uuid::new_v4();
                                if let Err(e) = forward(stream, remote, &upstreams, hello_timeout, conn_id).await {
                                    debug!(%conn_id, remote = %remote, error = %e, "Passthrough connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Passthrough proxy shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        drain_connections(connections, self.drain_timeout).await;

        Ok(())
    }
}

async fn forward(
    mut client: TcpStream,
    remote: SocketAddr,
    upstreams: &UpstreamTable,
    hello_timeout: Duration,
    conn_id: Uuid,
) -> io::Result<()> {
    let peek = match tokio::time::timeout(hello_timeout, peek_client_hello(&mut client)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!(%conn_id, remote = %remote, "Timed out waiting for ClientHello");
            return Ok(());
        }
    };

    let Some(sni) = peek.server_name else {
        info!(%conn_id, remote = %remote, "ClientHello without SNI, closing");
        return Ok(());
    };

    let Some(upstream) = upstreams.lookup(&sni) else {
        info!(%conn_id, remote = %remote, sni = %sni, "No upstream for SNI, closing");
        return Ok(());
    };

    info!(
        %conn_id,
        remote = %remote,
        sni = %sni,
        upstream = %upstream.name,
        address = %upstream.address,
        "Forwarding connection"
    );

    let mut server = TcpStream::connect(&upstream.address).await?;
    server.write_all(&peek.recorded).await?;

    let (to_upstream, to_client) = tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    debug!(
        %conn_id,
        to_upstream = to_upstream + peek.recorded.len() as u64,
        to_client,
        "Passthrough connection closed"
    );

    Ok(())
}
