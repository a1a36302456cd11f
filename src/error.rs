//! Gemini status codes and the error types that map onto them

use std::io;
use thiserror::Error;

/// Status codes emitted by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Request handled, body follows (meta is the content type)
    Success,
    /// Temporary redirect (meta is the target URL)
    TemporaryRedirect,
    /// Permanent redirect (meta is the target URL)
    PermanentRedirect,
    /// Backend could not be initialized
    InternalError,
    /// CGI script could not be run
    CgiError,
    /// No route or no file for the URL
    NotFound,
    /// URL hostname does not match the TLS server name
    ProxyRequestRefused,
    /// Malformed request line or unsupported scheme
    BadRequest,
}

impl Status {
    /// Two-digit code sent on the wire
    pub fn code(&self) -> u8 {
        match self {
            Status::Success => 20,
            Status::TemporaryRedirect => 30,
            Status::PermanentRedirect => 31,
            Status::InternalError => 40,
            Status::CgiError => 43,
            Status::NotFound => 51,
            Status::ProxyRequestRefused => 53,
            Status::BadRequest => 59,
        }
    }

    /// Meta text used when no specific meta is supplied
    pub fn default_meta(&self) -> &'static str {
        match self {
            Status::Success => "text/gemini",
            Status::TemporaryRedirect | Status::PermanentRedirect => "/",
            Status::InternalError => "Internal error",
            Status::CgiError => "CGI Error",
            Status::NotFound => "Not Found",
            Status::ProxyRequestRefused => "URL hostname does not match SNI",
            Status::BadRequest => "Bad Request",
        }
    }

    /// Format a full status line, including the trailing CRLF.
    ///
    /// Line breaks in `meta` are dropped so a status line can never be split.
    pub fn line(&self, meta: &str) -> String {
        let meta: String = meta.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        format!("{} {}\r\n", self.code(), meta)
    }
}

/// Problems with the request line, detected before routing
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request line exceeds {0} bytes")]
    TooLong(usize),
    #[error("connection closed before the request line was complete")]
    Incomplete,
    #[error("request line is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported URL scheme ({0})")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("URL hostname {host} does not match SNI {sni:?}")]
    SniMismatch { host: String, sni: Option<String> },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RequestError {
    /// Status to report to the client, or `None` when the connection should
    /// be dropped without a reply.
    pub fn status(&self) -> Option<Status> {
        match self {
            RequestError::TooLong(_) | RequestError::Incomplete | RequestError::Io(_) => None,
            RequestError::InvalidUtf8
            | RequestError::InvalidUrl(_)
            | RequestError::UnsupportedScheme(_)
            | RequestError::MissingHost => Some(Status::BadRequest),
            RequestError::SniMismatch { .. } => Some(Status::ProxyRequestRefused),
        }
    }
}

/// Routing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no route for URL {0}")]
    NoRoute(String),
    #[error("route refers to unknown backend '{0}'")]
    UnknownBackend(String),
}

/// Failures of a running CGI script, surfaced as read errors on its output
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CgiError {
    #[error("CGI script exited with non-zero exit code {0}")]
    Exit(i32),
    #[error("CGI script was terminated by a signal")]
    Signal,
    #[error("CGI timeout")]
    Timeout,
    #[error("CGI script was cancelled")]
    Cancelled,
    #[error("CGI script output was not closed after exit")]
    OutputNotClosed,
    #[error("Error running CGI script")]
    Wait,
}

impl CgiError {
    /// Recover a `CgiError` carried inside an `io::Error`
    pub fn from_io(err: &io::Error) -> Option<CgiError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<CgiError>())
            .copied()
    }
}

impl From<CgiError> for io::Error {
    fn from(err: CgiError) -> Self {
        let kind = match err {
            CgiError::Timeout => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
