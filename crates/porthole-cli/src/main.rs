//! porthole CLI
//!
//! Starts and supervises an ngrok tunnel for a local port, reports its
//! public URL and traffic metrics, and remembers the last-used settings.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use porthole_core::{
    LastUsed, PollPolicy, StatusClient, StatusError, TunnelRequest, TunnelSupervisor, config,
    status::DEFAULT_API_URL, tracing_init,
};

#[derive(Parser, Debug)]
#[command(name = "porthole")]
#[command(version, about = "Expose a local port through a supervised ngrok tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Tunnel binary to launch
    #[arg(long, global = true, default_value = "ngrok", env = "PORTHOLE_NGROK_BIN")]
    ngrok_bin: PathBuf,

    /// Base URL of the agent's local status API
    #[arg(long, global = true, default_value = DEFAULT_API_URL, env = "PORTHOLE_API_URL")]
    api_url: String,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true, default_value = "info", env = "PORTHOLE_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "PORTHOLE_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a tunnel and keep it up until Ctrl+C
    Up {
        /// Local port to expose; omit to restart the last-used tunnel
        port: Option<u16>,

        /// Reserved domain to bind instead of a dynamically assigned URL
        #[arg(short, long)]
        domain: Option<String>,

        /// Number of status polls while waiting for the public URL
        #[arg(long, default_value_t = 10, env = "PORTHOLE_POLL_ATTEMPTS")]
        attempts: u32,

        /// Delay between status polls, in milliseconds
        #[arg(long, default_value_t = 500, env = "PORTHOLE_POLL_DELAY_MS")]
        delay_ms: u64,

        /// Seconds to wait for graceful tunnel shutdown before SIGKILL
        #[arg(long, default_value_t = 5, env = "PORTHOLE_TERMINATE_TIMEOUT")]
        terminate_timeout: u64,
    },
    /// Show the running tunnel's URL and metrics
    Status,
    /// Check whether the tunnel binary is installed
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("porthole={}", cli.log_level);
    tracing_init::init_tracing(&log_filter, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting porthole");

    match cli.command {
        Command::Up {
            port,
            domain,
            attempts,
            delay_ms,
            terminate_timeout,
        } => {
            let request = resolve_request(port, domain)?;
            let policy = PollPolicy {
                max_attempts: attempts,
                delay: Duration::from_millis(delay_ms),
            };
            run_up(
                cli.ngrok_bin,
                terminate_timeout,
                &cli.api_url,
                request,
                policy,
            )
            .await
        }
        Command::Status => run_status(&cli.api_url).await,
        Command::Check => run_check(&cli.ngrok_bin),
    }
}

/// Resolve the tunnel request from CLI arguments, falling back to the
/// last-used record when no port is given.
fn resolve_request(port: Option<u16>, domain: Option<String>) -> anyhow::Result<TunnelRequest> {
    if let Some(port) = port {
        return Ok(match domain {
            Some(domain) => TunnelRequest::with_domain(port, domain),
            None => TunnelRequest::new(port),
        });
    }

    let last = config::load().context("Failed to load last-used settings")?;
    if last.port.is_empty() {
        anyhow::bail!("no port given and no last-used port on record");
    }
    let port: u16 = last
        .port
        .parse()
        .with_context(|| format!("last-used port '{}' is not a valid port", last.port))?;

    // An explicit --domain wins over the recorded one.
    let domain = domain.or_else(|| (!last.domain.is_empty()).then_some(last.domain));
    info!(port, domain = ?domain, "Reusing last-used settings");

    Ok(match domain {
        Some(domain) => TunnelRequest::with_domain(port, domain),
        None => TunnelRequest::new(port),
    })
}

#[allow(clippy::print_stdout, clippy::print_stderr)]
async fn run_up(
    ngrok_bin: PathBuf,
    terminate_timeout: u64,
    api_url: &str,
    request: TunnelRequest,
    policy: PollPolicy,
) -> anyhow::Result<()> {
    let mut supervisor = TunnelSupervisor::with_options(ngrok_bin, terminate_timeout);
    let handle = supervisor.start(request).await?;

    let record = LastUsed {
        port: handle.request.port.to_string(),
        domain: handle.request.domain.clone().unwrap_or_default(),
    };
    if let Err(e) = config::save(&record) {
        warn!(error = %e, "Failed to persist last-used settings");
    }

    let client = StatusClient::with_base_url(api_url);
    match client.fetch_url_with_retry(&policy).await {
        Some(url) => println!("{url}"),
        None => eprintln!(
            "tunnel started (pid {}), but the agent reported no public URL yet",
            handle.pid
        ),
    }
    if let Ok(Some(status)) = client.fetch_info().await {
        eprintln!("requests: {} | status: {}", status.request_count, status.state);
    }
    eprintln!("Press Ctrl+C to stop the tunnel");

    // Wait for Ctrl+C, checking liveness so a crashed tunnel is noticed
    // within one interval.
    let mut liveness = tokio::time::interval(Duration::from_secs(2));
    liveness.tick().await; // Skip first immediate tick
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
                break;
            }
            _ = liveness.tick() => {
                if !supervisor.is_running() {
                    eprintln!("tunnel process exited unexpectedly");
                    return Ok(());
                }
            }
        }
    }

    supervisor.stop().await?;
    info!("Tunnel stopped");
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn run_status(api_url: &str) -> anyhow::Result<()> {
    let client = StatusClient::with_base_url(api_url);
    match client.fetch_info().await {
        Ok(Some(status)) => {
            let url = status.public_url.as_deref().unwrap_or("not available");
            println!("url: {url}");
            println!("requests: {} | status: {}", status.request_count, status.state);
            Ok(())
        }
        Ok(None) => {
            println!("agent is up, no active tunnels");
            Ok(())
        }
        Err(StatusError::Unreachable(_)) => {
            anyhow::bail!("tunnel agent is not reachable - is the tunnel running?")
        }
        Err(e) => Err(e.into()),
    }
}

#[allow(clippy::print_stdout)]
fn run_check(ngrok_bin: &std::path::Path) -> anyhow::Result<()> {
    let supervisor = TunnelSupervisor::with_options(ngrok_bin.to_path_buf(), 5);
    if supervisor.is_available() {
        println!("{} is installed", ngrok_bin.display());
        Ok(())
    } else {
        anyhow::bail!("{} is not installed or not found in PATH", ngrok_bin.display())
    }
}
