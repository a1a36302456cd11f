use gemgate::config::{BackendKind, Config, Mode};
use gemgate::passthrough::{PassthroughServer, UpstreamTable};
use gemgate::server::{GeminiServer, ServerContext};
use gemgate::{tls, PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let arg = std::env::args().nth(1);
    if matches!(arg.as_deref(), Some("--version") | Some("-V")) {
        println!("{} {}", PKG_NAME, VERSION);
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gemgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = arg
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Bind before spawning anything so a busy port is fatal
    let listener = TcpListener::bind(&config.server.listen).await.map_err(|e| {
        error!(listen = %config.server.listen, error = %e, "Failed to bind listener");
        anyhow::anyhow!("Failed to bind {}: {}", config.server.listen, e)
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_handle = match config.server.mode {
        Mode::Serve => {
            let acceptor = tls::acceptor_from_config(&config.certs).map_err(|e| {
                error!(error = %e, "Failed to load certificates");
                e
            })?;
            let ctx = Arc::new(ServerContext::from_config(&config)?);
            let server = GeminiServer::new(ctx, acceptor, shutdown_rx.clone());

            tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    error!(error = %e, "Gemini server error");
                }
            })
        }
        Mode::Passthrough => {
            let upstreams = Arc::new(UpstreamTable::from_config(&config)?);
            let proxy = PassthroughServer::new(
                upstreams,
                config.server.client_hello_timeout(),
                shutdown_rx.clone(),
            )
            .with_drain_timeout(config.server.connection_timeout());

            tokio::spawn(async move {
                if let Err(e) = proxy.serve(listener).await {
                    error!(error = %e, "Passthrough proxy error");
                }
            })
        }
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // In-flight connections get their full deadline, plus slack for
    // releasing backends
    let drain_limit = config.server.connection_timeout() + Duration::from_secs(5);
    if tokio::time::timeout(drain_limit, server_handle).await.is_err() {
        warn!("Timed out waiting for connections to drain");
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting Gemini server");
    info!(
        listen = %config.server.listen,
        mode = ?config.server.mode,
        connection_timeout_secs = config.server.connection_timeout_secs,
        require_sni_match = config.server.require_sni_match,
        "Server configuration"
    );

    match config.server.mode {
        Mode::Serve => {
            info!(
                query_params = ?config.match_options.query_params,
                trailing_slash = ?config.match_options.trailing_slash,
                default_exts = ?config.match_options.default_exts,
                index_filename = %config.match_options.index_filename,
                "Match options"
            );
            info!(
                cgi_timeout_secs = config.server.cgi_timeout_secs,
                cgi_grace_period_secs = config.server.cgi_grace_period_secs,
                "CGI settings"
            );
            for backend in &config.backends {
                match &backend.kind {
                    BackendKind::Static { location, file_ext } => info!(
                        name = %backend.name,
                        location = %location.display(),
                        file_ext = ?file_ext,
                        "Static backend"
                    ),
                    BackendKind::Cgi { script } => info!(
                        name = %backend.name,
                        script = %script.display(),
                        "CGI backend"
                    ),
                }
            }
            info!(
                route_count = config.routes.len(),
                cert_count = config.certs.len(),
                "Configured routes"
            );
        }
        Mode::Passthrough => {
            info!(
                client_hello_timeout_secs = config.server.client_hello_timeout_secs,
                upstream_count = config.upstreams.len(),
                sni_routes = ?config
                    .sni_routes
                    .iter()
                    .map(|r| format!("{} -> {}", r.hostname, r.upstream))
                    .collect::<Vec<_>>(),
                "Passthrough routes"
            );
        }
    }
}
