//! Strand Tracker - topology coordinator for the Strand stream network.
//!
//! Runs a single tracker until interrupted.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use strand_network::{start_tracker, RunningTracker, TrackerConfig};
use strand_protocol::PeerId;
use tokio::time::Interval;

mod logging;

use logging::{init_logging, LogFormat};

/// Strand Tracker - assigns neighbors and relays handshakes between nodes
#[derive(Parser, Debug)]
#[command(name = "strand-tracker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tracker id (defaults to tracker-<port>)
    #[arg(long)]
    id: Option<String>,

    /// Human readable name (defaults to the id)
    #[arg(long, alias = "trackerName")]
    tracker_name: Option<String>,

    /// Port to listen on
    #[arg(long, default_value_t = 27777)]
    port: u16,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    ip: IpAddr,

    /// Upper bound on neighbors assigned per node and partition
    #[arg(long, alias = "maxNeighborsPerNode", default_value_t = 4)]
    max_neighbors_per_node: usize,

    /// Periodically log metrics
    #[arg(long)]
    metrics: bool,

    /// Interval between metrics logs, in milliseconds
    #[arg(long, alias = "metricsInterval", default_value_t = 5000)]
    metrics_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Args {
    fn tracker_config(&self) -> TrackerConfig {
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| format!("tracker-{}", self.port));
        TrackerConfig {
            name: self.tracker_name.clone().unwrap_or_else(|| id.clone()),
            peer_id: PeerId::new(id),
            listen_addr: SocketAddr::new(self.ip, self.port),
            max_neighbors_per_node: self.max_neighbors_per_node,
            ..Default::default()
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_metrics(tracker: &RunningTracker) {
    tracing::info!(
        peer_id = %tracker.peer_id(),
        metrics = %tracker.metrics_text(),
        "Tracker metrics"
    );
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.tracker_config();
    tracing::info!(
        id = %config.peer_id,
        name = %config.name,
        listen_addr = %config.listen_addr,
        max_neighbors = config.max_neighbors_per_node,
        "Tracker configuration"
    );

    let tracker = start_tracker(config)
        .await
        .context("failed to start tracker")?;
    tracing::info!(url = %tracker.url(), "Tracker is ready. Press Ctrl+C to stop.");

    let mut ticker = args
        .metrics
        .then(|| tokio::time::interval(Duration::from_millis(args.metrics_interval.max(1))));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for shutdown signal")?;
                break;
            }
            () = tracker.closed() => {
                anyhow::bail!("tracker coordinator stopped unexpectedly");
            }
            () = next_tick(&mut ticker) => log_metrics(&tracker),
        }
    }

    tracing::info!("Shutting down");
    tracker.stop().await;
    Ok(())
}

/// Logs a panic on any thread and exits with status 1.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "Uncaught panic");
        std::process::exit(1);
    }));
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_format);
    install_panic_hook();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Strand tracker");

    if let Err(e) = run(args).await {
        tracing::error!(error = %format!("{e:#}"), "Tracker failed");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["strand-tracker"]);
        let config = args.tracker_config();
        assert_eq!(config.peer_id, PeerId::new("tracker-27777"));
        assert_eq!(config.name, "tracker-27777");
        assert_eq!(config.listen_addr, "0.0.0.0:27777".parse::<SocketAddr>().unwrap());
        assert_eq!(config.max_neighbors_per_node, 4);
        assert!(!args.metrics);
        assert_eq!(args.metrics_interval, 5000);
        assert_eq!(args.log_format, LogFormat::Pretty);
    }

    #[test]
    fn id_follows_port() {
        let args = Args::parse_from(["strand-tracker", "--port", "30300", "--ip", "127.0.0.1"]);
        let config = args.tracker_config();
        assert_eq!(config.peer_id, PeerId::new("tracker-30300"));
        assert_eq!(config.listen_addr, "127.0.0.1:30300".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn camel_case_aliases() {
        let args = Args::parse_from([
            "strand-tracker",
            "--id",
            "main",
            "--trackerName",
            "Main tracker",
            "--maxNeighborsPerNode",
            "8",
            "--metrics",
            "--metricsInterval",
            "1000",
            "--log-format",
            "json",
        ]);
        let config = args.tracker_config();
        assert_eq!(config.peer_id, PeerId::new("main"));
        assert_eq!(config.name, "Main tracker");
        assert_eq!(config.max_neighbors_per_node, 8);
        assert!(args.metrics);
        assert_eq!(args.metrics_interval, 1000);
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn rejects_bad_port() {
        assert!(Args::try_parse_from(["strand-tracker", "--port", "70000"]).is_err());
    }
}
