//! Tapline - TLS-intercepting forward proxy.
//!
//! Loads settings, makes sure the root authority exists, installs the
//! interception policy and serves until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use tapline_proxy::{InterceptMode, ProxyServer, ProxySettings};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tapline - TLS-intercepting forward proxy
#[derive(Parser, Debug)]
#[command(name = "tapline", version, about)]
struct Args {
    /// Settings file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8080
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Directory holding the root CA
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Interception mode (none, tls, plain)
    #[arg(long)]
    intercept: Option<InterceptMode>,

    /// Relay HTTP/2 inside intercepted TLS tunnels
    #[arg(long)]
    allow_http2: bool,

    /// Do not verify origin certificates
    #[arg(long)]
    insecure: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Reads the settings file, then applies command-line overrides.
fn load_settings(args: &Args) -> anyhow::Result<ProxySettings> {
    let mut settings = match &args.config {
        Some(path) => ProxySettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => ProxySettings::default(),
    };

    if let Some(addr) = args.addr {
        settings.listen = addr;
    }
    if let Some(dir) = &args.ca_dir {
        settings.ca_dir = Some(dir.clone());
    }
    if let Some(mode) = args.intercept {
        settings.intercept = mode;
    }
    if args.allow_http2 {
        settings.allow_http2 = true;
    }
    if args.insecure {
        settings.skip_origin_verify = true;
    }
    Ok(settings)
}

/// Get the logs directory path.
fn logs_dir(settings: &ProxySettings) -> Option<PathBuf> {
    settings.log_dir.clone().or_else(|| {
        ProjectDirs::from("", "tapline", "Tapline").map(|dirs| dirs.data_dir().join("logs"))
    })
}

/// Initialize logging with file rotation.
fn init_logging(
    args: &Args,
    settings: &ProxySettings,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.verbose { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("tapline={0},tapline_proxy={0},warn", log_level))
    });

    if let Some(log_dir) = logs_dir(settings) {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("tapline")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args)?;
    let _guard = init_logging(&args, &settings);

    let config = settings
        .into_config()
        .context("Failed to build proxy configuration")?;
    let mut server = ProxyServer::new(config).context("Failed to create proxy server")?;
    if let Some(policy) = settings.intercept.connect_filter() {
        server = server.on_connect(policy);
    }
    println!("CA certificate: {}", server.ca_cert_path().display());

    let handle = server.start().await.context("Failed to start proxy")?;
    tracing::info!(
        "Proxy listening on {} (intercept: {})",
        handle.addr(),
        settings.intercept
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    handle.stop().await;
    Ok(())
}
