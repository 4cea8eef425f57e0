//! scanlogin - Log in by scanning a QR code from the terminal
//!
//! Prints the provider's login code as a QR code, long-polls the backend
//! until the code is confirmed on a phone, and prints the resulting profile.

use anyhow::{Context, Result};
use clap::Parser;
use scanlogin_auth::{QrLogin, ScriptLoader, TerminalWidget};
use scanlogin_client::HttpTransport;
use scanlogin_core::{AuthConfig, AuthEvent, LoginStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONTAINER: &str = "terminal";

/// scanlogin - Scan a QR code to log in
#[derive(Parser, Debug)]
#[command(name = "scanlogin")]
#[command(version, about, long_about = None)]
struct Args {
    /// Backend base URL (overrides the config file)
    #[arg(short, long)]
    base_url: Option<String>,

    /// Name of the area the code is drawn in [default: terminal]
    #[arg(short, long)]
    container: Option<String>,

    /// Extra request header as KEY=VALUE, may be repeated
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Give up after this many status checks
    #[arg(short, long)]
    max_retries: Option<u32>,

    /// Do not mint the first code before login starts
    #[arg(long)]
    no_auto_start: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{}'", raw));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn build_config(args: &Args) -> Result<AuthConfig> {
    let mut config = match &args.config {
        Some(path) => AuthConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => AuthConfig::new(DEFAULT_CONTAINER),
    };

    if let Some(container) = &args.container {
        config = config.with_container(container.clone());
    }
    if let Some(base_url) = &args.base_url {
        config = config.with_base_url(base_url.clone());
    }
    for (name, value) in &args.headers {
        config = config.with_header(name.clone(), value.clone());
    }
    if let Some(max_retries) = args.max_retries {
        config = config.with_max_retries(max_retries);
    }
    if args.no_auto_start {
        config = config.with_auto_start(false);
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("scanlogin v{}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args)?;
    info!("Backend: {}", config.base_url);

    let transport = Arc::new(HttpTransport::new(&config)?);
    let widget = Arc::new(TerminalWidget::new());
    let session = QrLogin::new(config, transport, widget, ScriptLoader::new())?;

    let mut events = session.subscribe();
    let event_handle = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                AuthEvent::StatusChanged {
                    status: LoginStatus::Scanned,
                } => info!("Code scanned, confirm the login on your phone"),
                AuthEvent::StatusChanged { status } => tracing::debug!("Status: {}", status),
                AuthEvent::CodeRefreshed {
                    correlation_id,
                    expires_at,
                    ..
                } => info!(
                    "Showing code {} (expires {})",
                    correlation_id,
                    expires_at.format("%H:%M:%S")
                ),
                AuthEvent::Error { message } => warn!("{}", message),
                AuthEvent::PhaseChanged { phase } => tracing::debug!("Phase: {:?}", phase),
            }
        }
    });

    let outcome = tokio::select! {
        result = session.login() => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            None
        }
    };

    session.destroy();
    drop(session);
    event_handle.abort();

    match outcome {
        Some(Ok(user)) => {
            println!("{}", serde_json::to_string_pretty(&user)?);
            info!("Goodbye!");
            Ok(())
        }
        Some(Err(e)) => Err(e).context("login failed"),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("datasource=tenant-a").unwrap(),
            ("datasource".to_string(), "tenant-a".to_string())
        );
        assert_eq!(
            parse_header("X-Token = a=b").unwrap(),
            ("X-Token".to_string(), "a=b".to_string())
        );
        assert!(parse_header("no-separator").is_err());
        assert!(parse_header("=value").is_err());
    }

    #[test]
    fn test_build_config_overrides() {
        let args = Args::parse_from([
            "scanlogin",
            "--base-url",
            "http://localhost:8080",
            "-H",
            "datasource=tenant-a",
            "--max-retries",
            "5",
            "--no-auto-start",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.container_id, "terminal");
        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.headers.get("datasource").map(String::as_str), Some("tenant-a"));
        assert_eq!(config.poll.max_retries, 5);
        assert!(!config.auto_start);
    }

    #[test]
    fn test_build_config_rejects_bad_url() {
        let args = Args::parse_from(["scanlogin", "--base-url", "ftp://nope"]);
        assert!(build_config(&args).is_err());
    }
}
