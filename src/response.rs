//! Response variants
//!
//! Every request produces exactly one [`Response`]. It is read as a byte
//! stream that starts with a single status line (`<code> <meta>\r\n`),
//! optionally followed by a body. Status lines of the built-in variants are
//! produced lazily and may be consumed through buffers of any size.

use crate::cgi::CgiResponse;
use crate::error::Status;
use crate::static_file::StaticResponse;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use url::Url;

/// A parsed Gemini request
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub remote_addr: SocketAddr,
}

impl Request {
    pub fn new(url: Url, remote_addr: SocketAddr) -> Self {
        Self { url, remote_addr }
    }
}

/// A status line handed out across as many reads as the caller needs
#[derive(Debug)]
pub(crate) struct StatusLine {
    bytes: Vec<u8>,
    pos: usize,
}

impl StatusLine {
    pub(crate) fn new(status: Status, meta: &str) -> Self {
        Self {
            bytes: status.line(meta).into_bytes(),
            pos: 0,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Copy as much of the remaining line as fits into `buf`
    pub(crate) fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let remaining = &self.bytes[self.pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        self.pos += n;
    }
}

/// Status line only, no body
#[derive(Debug)]
pub struct ErrorResponse {
    status: Status,
    line: StatusLine,
}

impl ErrorResponse {
    pub fn new(status: Status, meta: &str) -> Self {
        Self {
            status,
            line: StatusLine::new(status, meta),
        }
    }
}

/// Redirect to another URL, no body
#[derive(Debug)]
pub struct RedirectResponse {
    status: Status,
    line: StatusLine,
}

impl RedirectResponse {
    pub fn new(permanent: bool, target: &str) -> Self {
        let status = if permanent {
            Status::PermanentRedirect
        } else {
            Status::TemporaryRedirect
        };
        Self {
            status,
            line: StatusLine::new(status, target),
        }
    }
}

#[derive(Debug)]
pub enum Response {
    Static(StaticResponse),
    Cgi(CgiResponse),
    Error(ErrorResponse),
    Redirect(RedirectResponse),
}

impl Response {
    pub fn error(status: Status, meta: &str) -> Self {
        Response::Error(ErrorResponse::new(status, meta))
    }

    /// Error response using the status' default meta text
    pub fn status_only(status: Status) -> Self {
        Self::error(status, status.default_meta())
    }

    pub fn not_found() -> Self {
        Self::status_only(Status::NotFound)
    }

    pub fn temporary_redirect(target: &str) -> Self {
        Response::Redirect(RedirectResponse::new(false, target))
    }

    pub fn permanent_redirect(target: &str) -> Self {
        Response::Redirect(RedirectResponse::new(true, target))
    }

    /// Prepare the response for reading. Must complete before the first read.
    pub async fn init(&mut self, req: &Request) -> io::Result<()> {
        match self {
            Response::Cgi(cgi) => cgi.init(req).await,
            Response::Static(_) | Response::Error(_) | Response::Redirect(_) => Ok(()),
        }
    }

    /// Release files and processes held by the response.
    ///
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        match self {
            Response::Static(file) => file.close(),
            Response::Cgi(cgi) => cgi.close().await,
            Response::Error(_) | Response::Redirect(_) => {}
        }
    }

    /// Variant name used in logs
    pub fn backend_kind(&self) -> &'static str {
        match self {
            Response::Static(_) => "static",
            Response::Cgi(_) => "cgi",
            Response::Error(_) => "error",
            Response::Redirect(_) => "redirect",
        }
    }

    /// Status the response will start with, when known in advance.
    ///
    /// CGI scripts write their own status line, so this is `None` for them.
    pub fn status(&self) -> Option<Status> {
        match self {
            Response::Static(_) => Some(Status::Success),
            Response::Cgi(_) => None,
            Response::Error(e) => Some(e.status),
            Response::Redirect(r) => Some(r.status),
        }
    }
}

impl AsyncRead for Response {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Response::Static(file) => Pin::new(file).poll_read(cx, buf),
            Response::Cgi(cgi) => Pin::new(cgi).poll_read(cx, buf),
            Response::Error(err) => {
                err.line.fill(buf);
                Poll::Ready(Ok(()))
            }
            Response::Redirect(redirect) => {
                redirect.line.fill(buf);
                Poll::Ready(Ok(()))
            }
        }
    }
}
