//! WolfCoord - Multi-Context Coordination for Local-First Databases
//!
//! Command-line front end: writes and checks configuration, runs a single
//! context against the shared SQLite mailbox, and simulates a group of
//! contexts in one process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfcoord::config::CoordConfig;
use wolfcoord::degrade::Transports;
use wolfcoord::lease::LockOptions;
use wolfcoord::slot::SlotClaim;
use wolfcoord::transport::{MemoryBus, Transport};
use wolfcoord::Coordinator;

/// WolfCoord - Multi-Context Coordination for Local-First Databases
#[derive(Parser)]
#[command(name = "wolfcoord")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfcoord.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcoord.toml")]
        output: PathBuf,

        /// Context ID
        #[arg(long, default_value = "context-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show context information
    Info,

    /// Run one context until Ctrl-C, coordinating through the mailbox
    Run {
        /// Remote sync endpoint to claim
        #[arg(short, long)]
        endpoint: Option<String>,
    },

    /// Run several contexts in-process and print what they agree on
    Simulate {
        /// Number of contexts
        #[arg(short = 'n', long, default_value_t = 3)]
        contexts: usize,

        /// How long to run
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; the config file may pick the output format
    let logging = CoordConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    init_logging(&cli.log_level, &logging.format);

    match cli.command {
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Run { endpoint } => run_context(cli.config, endpoint).await,
        Commands::Simulate { contexts, seconds } => run_simulate(contexts, seconds).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Write a sample configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    std::fs::write(&output, CoordConfig::sample(&node_id))
        .with_context(|| format!("writing {}", output.display()))?;

    println!("Configuration written to {}", output.display());
    println!("Edit the file, then start a context with: wolfcoord run");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match CoordConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Context ID: {}", config.node.id.as_deref().unwrap_or("(generated)"));
            println!("  Priority:   {}", config.node.priority);
            println!("  Topic:      {}", config.topic());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show context information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = CoordConfig::from_file(&config_path)?;

    println!("WolfCoord Context Information");
    println!("=============================");
    println!();
    println!("Context ID:       {}", config.node.id.as_deref().unwrap_or("(generated)"));
    println!("Priority:         {}", config.node.priority);
    println!("Namespace:        {}", config.node.namespace);
    println!();
    println!("Coordination:");
    println!("  Heartbeat:      {:?}", config.heartbeat_interval());
    println!("  Liveness:       {:?}", config.liveness_timeout());
    println!("  Election:       {:?}", config.election_window());
    println!("  Lease Hold:     {:?}", config.lease_hold());
    println!("  Dedup Timeout:  {:?}", config.dedup_timeout());
    println!();
    println!("Fallback Mailbox:");
    println!("  Enabled:        {}", config.fallback.enabled);
    println!("  Path:           {}", config.fallback.path.display());
    println!("  Polling:        {:?}", config.polling_interval());
    println!("  Retention:      {:?}", config.retention());

    Ok(())
}

/// Run one context over the shared mailbox
async fn run_context(config_path: PathBuf, endpoint: Option<String>) -> anyhow::Result<()> {
    let mut config = CoordConfig::from_file(&config_path)?;
    // A single process has no primary transport; the mailbox is the channel
    config.fallback.enabled = true;

    let transports = Transports::from_config(&config, None)?;
    let coordinator = Coordinator::new(config, transports)?;

    coordinator.on_leader_change(|change| match &change.leader_id {
        Some(id) => println!("leader: {} (term {})", id, change.term),
        None => println!("leader: none (term {})", change.term),
    });
    coordinator.on_capability_change(|change| {
        println!("mode: {} -> {}", change.previous.mode, change.current.mode);
    });
    coordinator.on_slot_change(|event| println!("slot: {:?}", event));

    coordinator.join().await?;
    tracing::info!("Context {} running; Ctrl-C to leave", coordinator.peer_id());

    let mut status = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = status.tick() => {
                if let Some(endpoint) = &endpoint {
                    match coordinator.claim_sync_slot(endpoint).await? {
                        SlotClaim::Granted => tracing::debug!("Holding sync slot {}", endpoint),
                        SlotClaim::AlreadyHeld { holder } => {
                            tracing::debug!("Sync slot {} held by {}", endpoint, holder)
                        }
                    }
                }
                let stats = coordinator.stats().await;
                tracing::info!("{}", serde_json::to_string(&stats)?);
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    coordinator.leave().await?;
    Ok(())
}

/// Run `contexts` coordinators on one in-memory bus
async fn run_simulate(contexts: usize, seconds: u64) -> anyhow::Result<()> {
    if contexts == 0 {
        anyhow::bail!("need at least one context");
    }

    let bus = MemoryBus::new();
    let mut coordinators = Vec::with_capacity(contexts);
    for i in 0..contexts {
        let mut config = CoordConfig::default();
        config.node.id = Some(format!("context-{}", i + 1));
        config.node.priority = (i + 1) as u32;
        config.fallback.enabled = false;

        let transport: Arc<dyn Transport> = Arc::new(bus.endpoint());
        let coordinator = Coordinator::new(config, Transports::primary(transport))?;
        coordinator.join().await?;
        coordinators.push(coordinator);
    }

    // Let an election settle
    let settle = coordinators[0].config().liveness_timeout() * 2;
    tokio::time::sleep(settle).await;

    // Everyone asks for the same query; one of them runs it
    let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let queries = coordinators.iter().map(|c| {
        let runs = Arc::clone(&runs);
        async move {
            c.run_deduped("SELECT count(*) FROM todos", || async move {
                runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(42u64)
            })
            .await
        }
    });
    let results = futures::future::join_all(queries).await;
    println!(
        "query: {} executions for {} callers, results {:?}",
        runs.load(std::sync::atomic::Ordering::SeqCst),
        contexts,
        results.iter().map(|r| r.as_ref().ok()).collect::<Vec<_>>()
    );

    // Everyone competes for the same lease
    for c in &coordinators {
        let outcome = c.acquire_write_lock("todos", LockOptions::default()).await?;
        match outcome.lease() {
            Some(lease) => {
                println!("lease: {} got token {}", c.peer_id(), lease.fencing_token);
                c.release_lease(&lease).await?;
            }
            None => println!("lease: {} denied", c.peer_id()),
        }
    }

    for c in &coordinators {
        c.claim_sync_slot("wss://sync.example").await?;
    }
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    for c in &coordinators {
        let stats = c.stats().await;
        println!("{}", serde_json::to_string(&stats)?);
    }

    // Stop the leader and watch the rest re-elect
    let mut leader_index = None;
    for (i, c) in coordinators.iter().enumerate() {
        if c.is_leader().await {
            leader_index = Some(i);
        }
    }
    if let Some(i) = leader_index {
        let leader = coordinators.remove(i);
        println!("stopping leader {}", leader.peer_id());
        leader.leave().await?;
        tokio::time::sleep(settle).await;
        if let Some(survivor) = coordinators.first() {
            match survivor.leader().await {
                Some((id, term)) => println!("new leader: {} (term {})", id, term),
                None => println!("new leader: none yet"),
            }
        }
    }

    for c in &coordinators {
        c.leave().await?;
    }
    Ok(())
}
