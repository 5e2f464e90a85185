//! Runs an in-process cluster and reports where shards ended up

use anyhow::Context;
use clap::Parser;
use cluster_core::ShardId;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use coordinator::{Config, LocalCluster};

/// Coordinator - in-process shard coordination cluster
#[derive(Parser, Debug)]
#[command(name = "coordinator")]
#[command(about = "Run an in-process cluster through allocation and shard state rounds")]
struct Args {
    /// Cluster description (YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level, overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Number of reroute + shard started rounds
    #[arg(long, default_value = "5")]
    rounds: usize,

    /// Fail this shard after the first round, as `index:shard`
    #[arg(long)]
    fail_shard: Option<String>,
}

fn parse_shard_id(value: &str) -> anyhow::Result<ShardId> {
    let (index, id) = value
        .rsplit_once(':')
        .with_context(|| format!("invalid shard [{}], expected index:shard", value))?;
    let id = id.parse().with_context(|| format!("invalid shard number in [{}]", value))?;
    Ok(ShardId::new(index, id))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let fail_shard = args.fail_shard.as_deref().map(parse_shard_id).transpose()?;

    info!("Starting cluster [{}]", config.cluster.name);
    info!("  Nodes: {}", config.nodes.len());
    info!("  Indices: {}", config.indices.len());

    let cluster = LocalCluster::new(&config)?;
    cluster.start();
    cluster.reroute("initial allocation").await?;

    for round in 1..=args.rounds {
        let started = cluster.start_initializing_shards().await?;
        if round == 1 {
            if let Some(shard_id) = &fail_shard {
                let failed = cluster
                    .fail_shard(shard_id, "simulated failure", Some("failed from command line".to_string()))
                    .await?;
                info!("{} failure reported: {}", shard_id, failed);
            }
        }
        cluster.reroute("round").await?;

        let stats = cluster.stats();
        info!(
            "Round {}: {} started reports, version {}, {} started, {} initializing, {} unassigned",
            round, started, stats.version, stats.started_shards, stats.initializing_shards, stats.unassigned_shards
        );
    }

    println!("{}", serde_json::to_string_pretty(&cluster.stats())?);
    cluster.close().await;
    Ok(())
}
