//! Meepo CLI - Teleport a remote address to a local port
//!
//! Runs two in-process nodes joined by a memory transport, which exercises
//! the full control protocol without any network setup.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meepo_control::{Meepo, MeepoConfig, TeleportationOptions};
use meepo_proto::Addr;
use meepo_transport::MemoryHub;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Meepo - Teleport remote services to local addresses
#[derive(Parser, Debug)]
#[command(name = "meepo")]
#[command(about = "Meepo - Teleport remote services to local addresses")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Expose a remote address through a loopback peer
    #[command(long_about = r#"
Start two nodes in this process and teleport REMOTE_ADDRESS, as seen by the
second node, to a local address of the first one.

EXAMPLES:
  # Expose a local PostgreSQL on an ephemeral port
  meepo teleport --remote-address "127.0.0.1:5432"

  # Pick the local address and tunnel name
  meepo teleport --remote-address "tcp://127.0.0.1:6379" \
    --local-address "127.0.0.1:16379" --name redis

ENVIRONMENT VARIABLES:
  MEEPO_REMOTE_ADDRESS    Address the peer dials
  MEEPO_LOCAL_ADDRESS     Local address to listen on (optional)
  MEEPO_REQUEST_TIMEOUT   Control request timeout in seconds
    "#)]
    Teleport {
        /// Address the peer dials (e.g., tcp://127.0.0.1:5432)
        #[arg(long, env = "MEEPO_REMOTE_ADDRESS")]
        remote_address: String,

        /// Local address to listen on; an ephemeral port if omitted
        #[arg(long, env = "MEEPO_LOCAL_ADDRESS")]
        local_address: Option<String>,

        /// Teleportation name (defaults to network:address)
        #[arg(long)]
        name: Option<String>,

        /// Control request timeout in seconds
        #[arg(long, env = "MEEPO_REQUEST_TIMEOUT", default_value = "30")]
        request_timeout: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn node(id: &str, hub: &Arc<MemoryHub>, request_timeout: Duration) -> Result<Meepo> {
    let config = MeepoConfig::builder()
        .id(id)
        .request_timeout(request_timeout)
        .build()
        .with_context(|| format!("Invalid config for node {}", id))?;
    Ok(Meepo::new(config, Arc::new(hub.connector(id))))
}

async fn teleport(
    remote_address: &str,
    local_address: Option<&str>,
    name: Option<String>,
    request_timeout: Duration,
) -> Result<()> {
    let remote: Addr = remote_address
        .parse()
        .with_context(|| format!("Invalid remote address: {}", remote_address))?;

    let mut opts = TeleportationOptions::new();
    if let Some(local) = local_address {
        let local: Addr = local
            .parse()
            .with_context(|| format!("Invalid local address: {}", local))?;
        opts = opts.with_local_address(local);
    }
    if let Some(name) = name {
        opts = opts.with_name(name);
    }

    let hub = MemoryHub::new();
    let alice = node("alice", &hub, request_timeout)?;
    let bob = node("bob", &hub, request_timeout)?;
    let server = bob.serve(hub.listen("bob"));

    let local = alice
        .teleport(bob.id(), remote, opts)
        .await
        .context("Failed to teleport")?;
    info!("Teleported {} to {}", remote, local);
    println!("{}", local);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutting down");

    alice.close().await;
    bob.close().await;
    server.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Teleport {
            remote_address,
            local_address,
            name,
            request_timeout,
        } => {
            teleport(
                &remote_address,
                local_address.as_deref(),
                name,
                Duration::from_secs(request_timeout),
            )
            .await
        }
    }
}
