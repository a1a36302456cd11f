//! Integration tests for Gemgate
//!
//! These drive real listeners over TCP with a rustls client, using
//! self-signed certificates generated per test.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gemgate::config::Config;
use gemgate::passthrough::{PassthroughServer, UpstreamTable};
use gemgate::server::{GeminiServer, ServerContext};
use gemgate::tls;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A running Gemini server with its site on disk
struct TestServer {
    addr: SocketAddr,
    roots: rustls::RootCertStore,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

fn write_cert(dir: &Path, stem: &str, name: &str, roots: &mut rustls::RootCertStore) -> (String, String) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    roots.add(cert.der().clone()).unwrap();

    let cert_path = dir.join(format!("{}.crt", stem));
    let key_path = dir.join(format!("{}.key", stem));
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    (
        cert_path.to_string_lossy().into_owned(),
        key_path.to_string_lossy().into_owned(),
    )
}

#[cfg(unix)]
fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, format!("#!/bin/sh\nPATH=/usr/local/bin:/usr/bin:/bin\n{}", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    std::fs::create_dir_all(root.join("site/blog")).unwrap();
    std::fs::write(root.join("site/index.gmi"), "# Home\n").unwrap();
    std::fs::write(root.join("site/about.gmi"), "About this capsule\n").unwrap();
    std::fs::write(root.join("site/blog/index.gmi"), "# Blog\n").unwrap();
    std::fs::create_dir_all(root.join("capsule")).unwrap();
    std::fs::write(root.join("capsule/index.gmi"), "# Second capsule\n").unwrap();
    std::fs::create_dir_all(root.join("cgi")).unwrap();

    #[cfg(unix)]
    {
        write_script(
            &root.join("cgi/hello.sh"),
            "printf '20 text/gemini\\r\\n'\necho \"Hello from $SERVER_NAME\"\n",
        );
        write_script(
            &root.join("cgi/fail.sh"),
            "printf '20 text/gemini\\r\\npartial\\n'\nexit 2\n",
        );
        write_script(
            &root.join("cgi/slow.sh"),
            "sleep 2\nprintf '20 text/gemini\\r\\nlate\\n'\n",
        );
    }

    let mut roots = rustls::RootCertStore::empty();
    let (local_cert, local_key) = write_cert(root, "localhost", "localhost", &mut roots);
    let (capsule_cert, capsule_key) = write_cert(root, "capsule", "capsule.test", &mut roots);

    let toml = format!(
        r#"
[server]
connection_timeout_secs = 5
cgi_timeout_secs = 3
cgi_grace_period_secs = 1

[[routes]]
url = "localhost/cgi/hello/"
backend = "hello"

[[routes]]
url = "localhost/cgi/fail/"
backend = "fail"

[[routes]]
url = "localhost/cgi/slow/"
backend = "slow"

[[routes]]
hostname = "localhost"
backend = "site"

[[routes]]
hostname = "capsule.test"
backend = "capsule"

[[backends]]
name = "site"
type = "static"
location = "{site}"

[[backends]]
name = "capsule"
type = "static"
location = "{capsule}"

[[backends]]
name = "hello"
type = "cgi"
script = "{hello}"

[[backends]]
name = "fail"
type = "cgi"
script = "{fail}"

[[backends]]
name = "slow"
type = "cgi"
script = "{slow}"

[[certs]]
cert = "{local_cert}"
key = "{local_key}"

[[certs]]
cert = "{capsule_cert}"
key = "{capsule_key}"
"#,
        site = root.join("site").display(),
        capsule = root.join("capsule").display(),
        hello = root.join("cgi/hello.sh").display(),
        fail = root.join("cgi/fail.sh").display(),
        slow = root.join("cgi/slow.sh").display(),
    );

    let config_path = root.join("config.toml");
    std::fs::write(&config_path, toml).unwrap();
    let config = Config::load(&config_path).unwrap();

    let acceptor = tls::acceptor_from_config(&config.certs).unwrap();
    let ctx = Arc::new(ServerContext::from_config(&config).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = GeminiServer::new(ctx, acceptor, shutdown_rx);
    let handle = tokio::spawn(server.serve(listener));

    TestServer {
        addr,
        roots,
        shutdown: shutdown_tx,
        handle,
        _dir: dir,
    }
}

/// Send one request and read until the server closes the connection.
///
/// Returns what was received and whether the stream ended with a proper
/// TLS close.
async fn gemini_request(
    addr: SocketAddr,
    roots: &rustls::RootCertStore,
    sni: &str,
    line: &str,
) -> (Vec<u8>, io::Result<usize>) {
    let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots.clone())
    .with_no_client_auth();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let stream = TcpStream::connect(addr).await.unwrap();
    let domain = ServerName::try_from(sni.to_string()).unwrap();
    let mut tls_stream = connector.connect(domain, stream).await.unwrap();

    tls_stream.write_all(line.as_bytes()).await.unwrap();

    let mut out = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(10), tls_stream.read_to_end(&mut out))
        .await
        .expect("server should finish the response");
    (out, result)
}

/// Test that the index file is served for the root URL
#[tokio::test]
async fn test_static_index() {
    let server = start_server().await;

    let (out, result) =
        gemini_request(server.addr, &server.roots, "localhost", "gemini://localhost/\r\n").await;

    assert!(result.is_ok(), "expected a clean TLS close: {:?}", result);
    assert_eq!(out, b"20 text/gemini\r\n# Home\n");
}

/// Test the canonical redirect for directories and the extension fallback
#[tokio::test]
async fn test_static_redirect_and_extension_fallback() {
    let server = start_server().await;

    let (out, _) =
        gemini_request(server.addr, &server.roots, "localhost", "gemini://localhost/blog\r\n").await;
    assert_eq!(out, b"31 gemini://localhost/blog/\r\n");

    let (out, _) =
        gemini_request(server.addr, &server.roots, "localhost", "gemini://localhost/blog/\r\n").await;
    assert_eq!(out, b"20 text/gemini\r\n# Blog\n");

    let (out, _) =
        gemini_request(server.addr, &server.roots, "localhost", "gemini://localhost/about\r\n").await;
    assert_eq!(out, b"20 text/gemini\r\nAbout this capsule\n");

    let (out, _) =
        gemini_request(server.addr, &server.roots, "localhost", "gemini://localhost/nope\r\n").await;
    assert_eq!(out, b"51 Not Found\r\n");
}

/// Test protocol errors reported before routing
#[tokio::test]
async fn test_protocol_errors() {
    let server = start_server().await;

    let (out, _) =
        gemini_request(server.addr, &server.roots, "localhost", "https://localhost/\r\n").await;
    assert_eq!(out, b"59 Bad Request\r\n");

    let (out, _) = gemini_request(
        server.addr,
        &server.roots,
        "localhost",
        "gemini://capsule.test/\r\n",
    )
    .await;
    assert_eq!(out, b"53 URL hostname does not match SNI\r\n");
}

/// Test that the certificate is picked by SNI
#[tokio::test]
async fn test_second_certificate_by_sni() {
    let server = start_server().await;

    // The handshake only verifies if the capsule.test certificate is served
    let (out, result) = gemini_request(
        server.addr,
        &server.roots,
        "capsule.test",
        "gemini://capsule.test/\r\n",
    )
    .await;

    assert!(result.is_ok());
    assert_eq!(out, b"20 text/gemini\r\n# Second capsule\n");
}

/// Test a CGI script response
#[cfg(unix)]
#[tokio::test]
async fn test_cgi_response() {
    let server = start_server().await;

    let (out, result) = gemini_request(
        server.addr,
        &server.roots,
        "localhost",
        "gemini://localhost/cgi/hello\r\n",
    )
    .await;

    assert!(result.is_ok(), "expected a clean TLS close: {:?}", result);
    assert_eq!(out, b"20 text/gemini\r\nHello from localhost\n");
}

/// Test that a failing CGI script does not look like a complete response
#[cfg(unix)]
#[tokio::test]
async fn test_cgi_failure_truncates_connection() {
    let server = start_server().await;

    let (_, result) = gemini_request(
        server.addr,
        &server.roots,
        "localhost",
        "gemini://localhost/cgi/fail\r\n",
    )
    .await;

    assert!(result.is_err(), "a failed script must not end with a clean close");
}

/// Test that stray client bytes after the request line abort the connection
#[cfg(unix)]
#[tokio::test]
async fn test_extra_client_data_is_rejected() {
    let server = start_server().await;

    let (_, result) = gemini_request(
        server.addr,
        &server.roots,
        "localhost",
        "gemini://localhost/cgi/slow\r\nunexpected",
    )
    .await;

    assert!(result.is_err(), "connection should be aborted");
}

/// Test a full TLS session tunneled through the passthrough proxy
#[tokio::test]
async fn test_passthrough_to_gemini_server() {
    let server = start_server().await;

    let toml = format!(
        r#"
[server]
mode = "passthrough"

[[upstreams]]
name = "gemini"
address = "{}"

[[sni_routes]]
hostname = "localhost"
upstream = "gemini"
"#,
        server.addr
    );
    let config: Config = toml::from_str(&toml).unwrap();
    config.validate().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = PassthroughServer::new(
        Arc::new(UpstreamTable::from_config(&config).unwrap()),
        config.server.client_hello_timeout(),
        shutdown_rx,
    );
    tokio::spawn(proxy.serve(listener));

    let (out, result) =
        gemini_request(proxy_addr, &server.roots, "localhost", "gemini://localhost/\r\n").await;

    assert!(result.is_ok(), "expected a clean TLS close: {:?}", result);
    assert_eq!(out, b"20 text/gemini\r\n# Home\n");
}

/// Test that the accept loop stops on shutdown
#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let dir = tempfile::tempdir().unwrap();
    let mut roots = rustls::RootCertStore::empty();
    let (cert, key) = write_cert(dir.path(), "localhost", "localhost", &mut roots);

    let toml = format!(
        "[[certs]]\ncert = \"{}\"\nkey = \"{}\"\n",
        cert, key
    );
    let config: Config = toml::from_str(&toml).unwrap();
    let acceptor = tls::acceptor_from_config(&config.certs).unwrap();
    let ctx = Arc::new(ServerContext::from_config(&config).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(GeminiServer::new(ctx, acceptor, shutdown_rx).serve(listener));

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server should stop")
        .unwrap();
    assert!(result.is_ok());
}

/// Test that shutdown lets a request already being served finish
#[cfg(unix)]
#[tokio::test]
async fn test_shutdown_drains_in_flight_request() {
    let server = start_server().await;

    let addr = server.addr;
    let roots = server.roots.clone();
    let request = tokio::spawn(async move {
        gemini_request(addr, &roots, "localhost", "gemini://localhost/cgi/slow\r\n").await
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    server.shutdown.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!server.handle.is_finished(), "server returned with a request in flight");

    let (out, result) = request.await.unwrap();
    assert!(result.is_ok(), "expected a clean TLS close: {:?}", result);
    assert_eq!(out, b"20 text/gemini\r\nlate\n");

    let result = tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .expect("server should stop after draining")
        .unwrap();
    assert!(result.is_ok());
}
