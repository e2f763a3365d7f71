mod server;

use altay_core::RELABEL_RETRY_INTERVAL;
use clap::Parser;
use server::{HubState, DEFAULT_MAX_MESSAGE_BYTES};
use std::{
    fs::{File, OpenOptions},
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

const DEFAULT_ADDR: &str = ":8081";
const DEFAULT_DATA_DIR: &str = ".";
const LOG_FILE_NAME: &str = "altay-hub.log";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    data_dir: PathBuf,
    log_dir: Option<PathBuf>,
    debug: bool,
    grace: Duration,
    max_message_bytes: usize,
    relabel_retry: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "altay-hub", about = "Records URLs visited by connected browser agents")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    data_dir: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 5)]
    grace_seconds: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,
    #[arg(long, default_value_t = RELABEL_RETRY_INTERVAL.as_secs())]
    relabel_retry_seconds: u64,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);

    let addr: SocketAddr = match normalize_addr(&config.addr).parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            std::process::exit(1);
        }
    };

    if let Err(err) = std::fs::create_dir_all(&config.data_dir) {
        warn!(event = "data_dir_error", error = %err, dir = %config.data_dir.display());
    }

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_failed", error = %err, addr = %addr);
            std::process::exit(1);
        }
    };

    info!(
        event = "hub_start",
        addr = %addr,
        data_dir = %config.data_dir.display(),
        grace_secs = config.grace.as_secs()
    );

    let hub = Arc::new(
        HubState::new(config.data_dir.clone(), config.max_message_bytes)
            .with_relabel_retry(config.relabel_retry),
    );
    if let Err(err) = server::serve(listener, hub.clone(), shutdown_signal(), config.grace).await {
        error!(event = "hub_error", error = %err);
        std::process::exit(1);
    }
    info!(event = "hub_stop", abandoned_sessions = hub.registry().len());
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(event = "signal_error", signal = "interrupt", error = %err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(event = "signal_error", signal = "terminate", error = %err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr =
        resolve_setting(&args.addr, "ALTAY_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let data_dir = resolve_setting(&args.data_dir, "ALTAY_DATA_DIR")
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    let log_dir = resolve_setting(&args.log_dir, "ALTAY_LOG_DIR").map(PathBuf::from);
    Config {
        addr,
        data_dir: PathBuf::from(data_dir),
        log_dir,
        debug: args.debug || env_true("ALTAY_DEBUG"),
        grace: Duration::from_secs(args.grace_seconds),
        max_message_bytes: args.max_message_bytes,
        relabel_retry: Duration::from_secs(args.relabel_retry_seconds),
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else {
        std::env::var("ALTAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let writer = match config.log_dir.as_deref().map(open_log_file).transpose() {
        Ok(Some(file)) => BoxMakeWriter::new(io::stdout.and(Arc::new(file))),
        Ok(None) => BoxMakeWriter::new(io::stdout),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            BoxMakeWriter::new(io::stdout)
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
}

fn open_log_file(dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Flag value, else the environment variable, else `None`.
fn resolve_setting(flag: &str, env_key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    match std::env::var(env_key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Accepts the bare `:PORT` form and binds it on all interfaces.
fn normalize_addr(addr: &str) -> String {
    let addr = addr.trim();
    match addr.strip_prefix(':') {
        Some(port) if !port.contains(':') => format!("0.0.0.0:{port}"),
        _ => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_addr_expands_bare_port() {
        assert_eq!(normalize_addr(":8081"), "0.0.0.0:8081");
        assert_eq!(normalize_addr(" 127.0.0.1:9000 "), "127.0.0.1:9000");
        assert_eq!(normalize_addr("[::1]:8081"), "[::1]:8081");
        assert!(normalize_addr(":8081").parse::<SocketAddr>().is_ok());
    }

    #[test]
    fn flags_win_over_environment() {
        assert_eq!(
            resolve_setting("0.0.0.0:1", "ALTAY_TEST_UNSET_VARIABLE").as_deref(),
            Some("0.0.0.0:1")
        );
        assert_eq!(resolve_setting("  ", "ALTAY_TEST_UNSET_VARIABLE"), None);
    }

    #[test]
    fn log_file_is_created_under_nested_dir() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let nested = dir.path().join("logs");

        open_log_file(&nested).expect("log dir");

        assert!(nested.join(LOG_FILE_NAME).exists());
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::try_parse_from(["altay-hub"]).expect("parse");
        assert_eq!(args.grace_seconds, 5);
        assert_eq!(args.max_message_bytes, 64 << 20);
        assert_eq!(args.relabel_retry_seconds, 5);
        assert!(args.addr.is_empty());
        assert!(!args.debug);
    }
}
