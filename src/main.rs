use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mtr_trace::helper::{self, HELPER_BINARY};
use mtr_trace::{Config, Tracer};

mod cli;

use cli::Args;

/// How long the helper gets to exit after its stdin closes
const HELPER_EXIT_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    init_logging(args.verbose);
    info!("Starting up...");

    let mut config = Config::load_or_default(args.config.as_deref())?;
    args.apply(&mut config);

    let helper_path = match args.helper.clone() {
        Some(path) => path,
        None => helper::find_binary(HELPER_BINARY)
            .with_context(|| format!("{} not found on $PATH (use --helper)", HELPER_BINARY))?,
    };

    // Resolve all targets
    let mut targets: Vec<IpAddr> = Vec::new();
    for target_str in &args.targets {
        let resolved = resolve_target(target_str)
            .with_context(|| format!("Failed to resolve target: {}", target_str))?;

        // Skip duplicate targets
        if targets.contains(&resolved) {
            warn!("Duplicate target {} ({}), skipping", target_str, resolved);
            continue;
        }
        targets.push(resolved);
    }

    let (tracer, mut helper) = Tracer::spawn(config, &helper_path)?;
    info!(
        "Tracing {} targets through {} (max TTL {})",
        targets.len(),
        helper.path().display(),
        tracer.config().max_ttl
    );

    // Setup Ctrl+C handler
    let shutdown = tracer.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Caught keyboard interrupt, shutting down...");
        shutdown.shutdown();
    });

    let mut failed = 0;
    let mut pending = Vec::new();
    for target in &targets {
        match tracer.trace(*target, ()) {
            Ok(trace) => pending.push(trace),
            Err(e) => {
                error!("Cannot trace {}: {}", target, e);
                failed += 1;
            }
        }
    }

    for result in join_all(pending).await {
        match result {
            Some(Ok(trace)) => {
                info!(
                    "Completed traceroute to: {} (started {})",
                    trace.target,
                    trace.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
                for hop in &trace.hops {
                    info!(" - {}", hop);
                }
            }
            Some(Err(failure)) => {
                error!("Error running traceroute: {}", failure);
                for hop in &failure.hops {
                    info!(" - {}", hop);
                }
                failed += 1;
            }
            None => {}
        }
    }

    tracer.shutdown();
    // Shutdown closes the helper's stdin; give it a moment to exit on EOF
    match tokio::time::timeout(HELPER_EXIT_GRACE, helper.wait()).await {
        Ok(Ok(status)) => debug!("Helper exited with {}", status),
        Ok(Err(e)) => warn!("Failed to wait for helper: {}", e),
        Err(_) => {
            if let Err(e) = helper.kill().await {
                warn!("Failed to stop helper: {}", e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} traces failed", failed, targets.len());
    }
    info!("Goodbye");
    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Parse an IP literal, or resolve a hostname (IPv4 preferred)
fn resolve_target(target: &str) -> Result<IpAddr> {
    if let Ok(ip) = helper::parse_ip(target) {
        return Ok(ip);
    }

    let addrs: Vec<IpAddr> = format!("{}:0", target)
        .to_socket_addrs()?
        .map(|s| s.ip())
        .collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .context("No addresses found for hostname")
}
