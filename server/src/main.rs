//! mrtscope binary — thin CLI shell over the [`mrtscope_server`] library.

use clap::Parser;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use mrtscope_server::api;
use mrtscope_server::archive::{spawn_archive, ArchiveCmd};
use mrtscope_server::session::SessionManager;
use mrtscope_server::types::{
    parse_archives_toml, AppContext, ArchiveConfig, DEFAULT_REFRESH_MINS, SESSION_TTL_SECS,
};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Read-only archive server for MRT-format BGP capture trees.
#[derive(Parser)]
#[command(name = "mrtscope", version, about, long_about = None)]
struct Cli {
    /// Load archives from a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Archive to serve (repeatable, format: COLLECTOR=PATH)
    #[arg(long = "archive", value_name = "COLLECTOR=PATH")]
    archives: Vec<String>,

    /// Path discriminator for --archive specs (e.g. "updates" or "ribs")
    #[arg(long, default_value = "updates")]
    discriminator: String,

    /// Directory for persisted catalog blobs (--archive specs only)
    #[arg(long)]
    savepath: Option<PathBuf>,

    /// Minutes between incremental catalog refreshes
    #[arg(long, default_value_t = DEFAULT_REFRESH_MINS)]
    refresh_mins: u64,

    /// Log files skipped during scans
    #[arg(long)]
    debug_scan: bool,

    /// Bind to 0.0.0.0 instead of 127.0.0.1 (localhost)
    #[arg(long)]
    bind_all: bool,
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mrtscope=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // ---------------------------------------------------------------------------
    // Determine archive list from CLI args
    // ---------------------------------------------------------------------------

    let mut configs: Vec<ArchiveConfig> = Vec::new();

    // --archive collector=/path flags (repeatable)
    for spec in &cli.archives {
        if let Some((collector, path)) = spec.split_once('=') {
            configs.push(ArchiveConfig {
                collector: collector.to_string(),
                path: PathBuf::from(path),
                discriminator: cli.discriminator.clone(),
                savepath: cli.savepath.clone(),
                refresh_mins: Some(cli.refresh_mins),
            });
        } else {
            error!(spec = spec.as_str(), "Invalid --archive format, expected COLLECTOR=PATH");
            std::process::exit(1);
        }
    }

    // --config file
    if let Some(config_path) = &cli.config {
        match parse_archives_toml(config_path) {
            Ok(parsed) => configs.extend(parsed),
            Err(e) => {
                error!(error = e.as_str(), "Could not load archive config");
                std::process::exit(1);
            }
        }
    }

    if configs.is_empty() {
        error!("No archives configured. Use --archive COLLECTOR=PATH or --config archives.toml");
        std::process::exit(1);
    }

    // ---------------------------------------------------------------------------
    // Spawn archive services and the session manager
    // ---------------------------------------------------------------------------

    let tracker = TaskTracker::new();
    let shutdown = CancellationToken::new();

    let mut archives = BTreeMap::new();
    for cfg in configs {
        let key = cfg.key();
        if archives.contains_key(&key) {
            error!(archive = key.as_str(), "Duplicate archive, skipping");
            continue;
        }
        info!(archive = key.as_str(), root = %cfg.path.display(), "Starting archive service");
        let handle = spawn_archive(cfg, &tracker, cli.debug_scan, shutdown.child_token());
        archives.insert(key, handle);
    }

    let sessions = SessionManager::spawn(
        &tracker,
        Duration::from_secs(SESSION_TTL_SECS),
        shutdown.child_token(),
    );

    let ctx = AppContext {
        archives: Arc::new(archives),
        sessions,
        tracker: tracker.clone(),
        shutdown: shutdown.clone(),
        start_time: Instant::now(),
    };

    let app = api::router(ctx.clone()).layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive());

    // ---------------------------------------------------------------------------
    // Bind and serve
    // ---------------------------------------------------------------------------

    // Bind address: 127.0.0.1 by default, --bind-all for 0.0.0.0
    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };

    let explicit_port: Option<u16> = std::env::var("PORT").ok().and_then(|p| p.parse().ok());

    let listener = if let Some(port) = explicit_port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
            error!(port = port, error = %e, "Could not bind to port");
            eprintln!("  PORT={port} was set explicitly. Choose a different port.");
            std::process::exit(1);
        })
    } else {
        // Auto-scan: try 8461..=8470
        const BASE: u16 = 8461;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            match tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                Ok(l) => {
                    found = Some(l);
                    break;
                }
                Err(_) => continue,
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = BASE, range_end = BASE + RANGE - 1, "No free port found");
            eprintln!("  Try: PORT=<port> mrtscope");
            std::process::exit(1);
        })
    };

    let port = listener.local_addr().expect("listener has a local address").port();
    info!(port = port, "http://localhost:{port}");
    // Machine-readable line for scripts (not through tracing)
    eprintln!("MRTSCOPE_PORT={port}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // ---------------------------------------------------------------------------
    // Drain: stop archives and wait for in-flight scans
    // ---------------------------------------------------------------------------

    shutdown.cancel();
    for handle in ctx.archives.values() {
        let _ = handle.send(ArchiveCmd::Stop).await;
    }
    tracker.close();
    tracker.wait().await;
    info!("Shutdown complete");
}
