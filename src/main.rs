//! `grain` server binary.
//!
//! Connects to Redis (or runs against the in-process broker with
//! `--in-memory`), starts one hub per shard and serves `/ws` until ctrl-c.

#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use grain_broker::{Broker, MemoryBroker, RedisBroker};
use grain_server::{HubConfig, ServerConfig};
use grain_telemetry::TelemetryConfig;
use tracing::Level;

#[derive(Debug, Parser)]
#[command(name = "grain", about = "Sharded WebSocket chat fan-out server")]
struct Args {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Bind address.
    #[arg(long, env = "GRAIN_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Redis connection URL used for pub/sub and history.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Number of hubs. Defaults to one per available CPU.
    #[arg(long, env = "GRAIN_SHARDS")]
    shards: Option<usize>,

    /// Run without Redis. Only useful for a single process.
    #[arg(long, default_value_t = false)]
    in_memory: bool,

    /// Emit JSON log lines.
    #[arg(long, env = "GRAIN_LOG_JSON", default_value_t = false)]
    log_json: bool,

    /// Default log level; `RUST_LOG` takes precedence.
    #[arg(long, env = "GRAIN_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Per-target level overrides, e.g. `grain_server::hub=debug`.
    #[arg(
        long = "log-module",
        env = "GRAIN_LOG_MODULES",
        value_delimiter = ',',
        value_parser = grain_telemetry::parse_module_level
    )]
    log_modules: Vec<(String, Level)>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let telemetry = grain_telemetry::init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        module_levels: args.log_modules,
        json: args.log_json,
    });

    let broker: Arc<dyn Broker> = if args.in_memory {
        tracing::warn!("running with the in-memory broker, processes will not share messages");
        Arc::new(MemoryBroker::new())
    } else {
        let redis = RedisBroker::connect(&args.redis_url)
            .await
            .with_context(|| format!("failed to connect to redis at {}", args.redis_url))?;
        Arc::new(redis)
    };

    let mut hub = HubConfig::default();
    if let Some(shards) = args.shards {
        anyhow::ensure!(shards > 0, "--shards must be at least 1");
        hub.shards = shards;
    }
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        hub,
    };

    let handle = grain_server::start(config, broker, telemetry.metrics())
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "grain ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}
