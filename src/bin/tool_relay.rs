//! tool-relay: 通过 stdio 提供 MCP 工具服务
//!
//! Usage:
//!   tool-relay [--config <file>] [--db <path>]
//!
//! Reads newline-delimited JSON-RPC from stdin and writes responses to
//! stdout. Logs go to stderr (`RUST_LOG`, default `tool_relay=info`).

use anyhow::{bail, Context};
use std::path::PathBuf;
use tokio::io::BufReader;
use tool_relay::config::CacheBackend;
use tool_relay::{Relay, RelayConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    db: Option<PathBuf>,
}

enum Command {
    Serve(Args),
    Help,
    Version,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Command> {
    let mut parsed = Args::default();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let v = iter.next().context("--config needs a file path")?;
                parsed.config = Some(PathBuf::from(v));
            }
            "--db" => {
                let v = iter.next().context("--db needs a path")?;
                parsed.db = Some(PathBuf::from(v));
            }
            "--help" | "-h" => return Ok(Command::Help),
            "--version" | "-V" => return Ok(Command::Version),
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(Command::Serve(parsed))
}

fn print_usage() {
    println!(
        r#"tool-relay: MCP tool server with a cached, rate-limited request layer

USAGE:
    tool-relay [OPTIONS]

OPTIONS:
    -c, --config <file>     YAML configuration file
        --db <path>         SQLite cache database (implies the sqlite backend)
    -h, --help              Show this help message
    -V, --version           Show version information

ENVIRONMENT:
    TOOL_RELAY_CONFIG                  Configuration file (when --config is absent)
    TOOL_RELAY_DB_PATH                 SQLite cache database
    TOOL_RELAY_CACHE_BACKEND           sqlite | memory | none
    TOOL_RELAY_MAX_CONCURRENT          Concurrent calls per target host
    TOOL_RELAY_RPS                     Calls per second per target host
    TOOL_RELAY_LIMITER_PRUNE_SECS      Interval for dropping idle host windows
    TOOL_RELAY_BACKOFF_BASE_MS         First retry delay
    TOOL_RELAY_BACKOFF_MAX_MS          Retry delay cap
    TOOL_RELAY_SINGLE_FLIGHT           Coalesce identical concurrent requests
    TOOL_RELAY_PROXY_URL               Outbound HTTP proxy
    RUST_LOG                           Log filter (logs go to stderr)"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = match parse_args(std::env::args().skip(1))? {
        Command::Help => {
            print_usage();
            return Ok(());
        }
        Command::Version => {
            println!("tool-relay {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Serve(args) => args,
    };

    // stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tool_relay=info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let mut config =
        RelayConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(db) = args.db {
        config.cache.backend = CacheBackend::Sqlite;
        config.cache.db_path = db;
        config.validate()?;
    }

    let relay = Relay::from_config(&config).context("failed to start relay")?;
    let sweeper = relay.spawn_sweeper();
    let pruner = relay.spawn_limiter_pruner();
    let server = std::sync::Arc::new(relay.server());

    let result = server
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    pruner.abort();
    result.context("stdio server failed")?;
    Ok(())
}
