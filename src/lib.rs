//! Gemgate - A Gemini application server
//!
//! This library provides a Gemini protocol server that:
//! - Terminates TLS, selecting certificates by SNI
//! - Routes request URLs to backends by hostname, prefix or exact URL
//! - Serves static files with index and default-extension fallbacks
//! - Runs CGI scripts per request under a supervised timeout
//! - Optionally acts as an SNI passthrough proxy that forwards TLS
//!   connections to upstreams without terminating them

pub mod cgi;
pub mod config;
pub mod error;
pub mod passthrough;
pub mod response;
pub mod router;
pub mod server;
pub mod static_file;
pub mod tls;

/// Version information for the server
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
