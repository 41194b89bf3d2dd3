//! # Experiment Node Runtime
//!
//! Runs one routing node of a sensor-mesh experiment. The orchestration
//! tooling starts every node the same way:
//!
//! ```text
//! waypost <config-file> <section>
//! ```
//!
//! Regular nodes originate one sensor reading towards the sink every
//! `send_delay_secs` until the `max_sends` budget is spent, then keep
//! forwarding other nodes' traffic. The sink node just drains deliveries;
//! its readings land in `sink_save_file`. Every node appends its send log to
//! `save_file_loc` for post-experiment analysis.
//!
//! Shutdown is graceful on SIGINT or when the orchestration sets the
//! `WAYPOST_SHUTDOWN` environment toggle.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use waypost::{Config, MockDataGenerator, Node};

#[derive(Parser, Debug)]
#[command(name = "waypost", about = "Identifier/locator-split routing node")]
struct Args {
    /// Path to the experiment config file.
    config: PathBuf,
    /// Section of the config file describing this node.
    section: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config, &args.section)
        .with_context(|| format!("loading section [{}] of {}", args.section, args.config.display()))?;
    info!(
        id = %config.my_id,
        locators = ?config.locators,
        mode = ?config.mode,
        is_sink = config.is_sink,
        "starting node"
    );

    let node = Node::spawn(config.clone()).context("failed to start node")?;

    // Drain deliveries in the background; the sink's readings are persisted
    // by the dispatch loop itself.
    let mut delivered = node.delivered().await?;
    tokio::spawn(async move {
        while let Some(delivered) = delivered.recv().await {
            debug!(from = %delivered.from, len = delivered.payload.len(), "payload delivered");
        }
    });

    tokio::select! {
        _ = originate(&node, &config), if !config.is_sink => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for interrupt")?;
            info!("interrupt received");
        }
    }

    node.shutdown().await?;
    info!("node stopped");
    Ok(())
}

/// Sends one mock sensor reading to the sink per send-delay interval until
/// the budget is spent, then parks so the node keeps forwarding.
async fn originate(node: &Node, config: &Config) {
    let sink = config.sink_address();
    let mut generator = MockDataGenerator::default();
    let mut interval = tokio::time::interval(config.send_delay);

    for sent in 1..=config.max_sends {
        interval.tick().await;
        let reading = generator.next_reading();
        if let Err(e) = node.send(sink, reading.to_bytes().to_vec()).await {
            warn!(error = %e, "origination failed, stopping sender");
            return;
        }
        debug!(sent, of = config.max_sends, "reading sent towards sink");
    }
    info!(budget = config.max_sends, "send budget spent, forwarding only");
    std::future::pending::<()>().await
}
