use std::sync::Arc;

use fluux_httpbind::httpbind::error::RouteError;
use fluux_httpbind::httpbind::services::LoggingOfflineStore;
use fluux_httpbind::{
    BoshConfig, HttpBindServer, HttpSessionManager, PacketRouter, Services, Stanza, StreamId,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const DEFAULT_BIND: &str = "127.0.0.1:7070";

/// Router for client development: every stanza a client sends is delivered
/// back to the session it came from.
///
/// Delivery happens on a separate task so routing never re-enters the
/// session that is admitting the request.
struct LoopbackRouter {
    tx: mpsc::UnboundedSender<(StreamId, Stanza)>,
}

impl PacketRouter for LoopbackRouter {
    fn route(&self, stream_id: &StreamId, stanza: Stanza) -> Result<(), RouteError> {
        self.tx
            .send((stream_id.clone(), stanza))
            .map_err(|_| RouteError::Rejected("loopback delivery stopped".to_string()))
    }
}

async fn run_loopback(
    manager: HttpSessionManager,
    mut rx: mpsc::UnboundedReceiver<(StreamId, Stanza)>,
) {
    while let Some((stream_id, stanza)) = rx.recv().await {
        match manager.get_session(stream_id.as_str()) {
            Ok(session) => {
                debug!(stream_id = %stream_id, kind = stanza.kind().name(), "Looping stanza back");
                session.deliver_stanza(stanza);
            }
            Err(e) => debug!(stream_id = %stream_id, error = %e, "Dropping stanza for closed session"),
        }
    }
}

fn print_usage() {
    eprintln!("fluux-httpbind v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluux-httpbind [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --bind=ADDR        Listen address (default: {DEFAULT_BIND})");
    eprintln!("      --server-name=NAME Domain announced to clients (default: localhost)");
    eprintln!("      --config=PATH      JSON file with BOSH settings");
    eprintln!("      --set KEY=VALUE    Set a BOSH property, e.g. xmpp.httpbind.client.idle=600");
    eprintln!("  -v, --verbose          Enable verbose logging to stderr");
    eprintln!("      --verbose=xmpp     Also log every stanza routed and delivered");
    eprintln!("      --log-file=PATH    Override log file directory (default: platform data dir)");
    eprintln!("  -h, --help             Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG               Override log filter (e.g. RUST_LOG=debug)");
}

/// Config file first, then `--set` properties, then `--server-name`.
fn load_config(args: &[String]) -> Result<BoshConfig, String> {
    let mut config = match args.iter().find_map(|arg| arg.strip_prefix("--config=")) {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config '{}': {}", path, e))?;
            serde_json::from_str(&text)
                .map_err(|e| format!("Failed to parse config '{}': {}", path, e))?
        }
        None => BoshConfig::default(),
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let property = if arg == "--set" {
            iter.next().map(String::as_str)
        } else {
            arg.strip_prefix("--set=")
        };
        if let Some(property) = property {
            let (key, value) = property
                .split_once('=')
                .ok_or_else(|| format!("Expected KEY=VALUE after --set, got '{}'", property))?;
            config.set(key.trim(), value);
        }
    }

    if let Some(name) = args.iter().find_map(|arg| arg.strip_prefix("--server-name=")) {
        config.server_name = name.to_string();
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Parse CLI flags early, before tracing subscriber init
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_usage();
        std::process::exit(0);
    }

    // Parse verbose level: --verbose / -v (default) or --verbose=xmpp (with stanza traffic)
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    let verbose = verbose_level.is_some();

    let log_file_path = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--log-file=").map(|s| s.to_string()));

    // --log-file=<path> overrides the platform data directory
    let log_dir = if let Some(ref path) = log_file_path {
        std::path::PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."))
    } else {
        dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("fluux-httpbind")
            .join("logs")
    };

    // Initialize tracing subscriber:
    // - Always write to a daily log file
    // - Optionally add stderr output when --verbose is passed
    let _guard = {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
        }

        let file_filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new("fluux_httpbind=info,info")
        };

        let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-httpbind.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(file_filter);

        let stderr_layer = if verbose || std::env::var("RUST_LOG").is_ok() {
            let stderr_filter = if std::env::var("RUST_LOG").is_ok() {
                EnvFilter::from_default_env()
            } else if verbose_level == Some("xmpp") {
                EnvFilter::new("fluux_httpbind=debug,info")
            } else {
                EnvFilter::new("fluux_httpbind=info,info")
            };

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(stderr_filter),
            )
        } else {
            None
        };

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .init();

        eprintln!("Log file: {}", log_dir.display());
        // Dropping the guard stops the background writer, keep it for all of main
        guard
    };

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    let bind = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--bind="))
        .unwrap_or(DEFAULT_BIND)
        .to_string();

    info!(
        server_name = %config.server_name,
        inactivity_secs = config.inactivity_timeout,
        max_requests = config.max_requests,
        polling_secs = config.polling_interval,
        "Starting BOSH connection manager"
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let services = Services::new(Arc::new(LoopbackRouter { tx }))
        .with_offline_store(Arc::new(LoggingOfflineStore));
    let manager = HttpSessionManager::new(config, services);
    let loopback = tokio::spawn(run_loopback(manager.clone(), rx));

    let mut server = HttpBindServer::new(manager);
    match server.start(&bind).await {
        Ok(addr) => eprintln!("BOSH endpoint: http://{addr}/http-bind/"),
        Err(e) => {
            error!(error = %e, "Failed to start BOSH server");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    }
    info!("Shutdown requested");
    server.stop().await;
    loopback.abort();
}
