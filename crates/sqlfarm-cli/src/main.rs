use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlfarm_core::{ConnectParams, Connection, ConnectionFactory, DriverError};
use sqlfarm_sql::{fingerprint, normalize, parse_statement};
use sqlfarm_store::{SqlStore, StoreConfig, Target};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sqlfarm", about = "Inspect sqlfarm configs and routing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a config file and list its farms.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Show which farm each statement would run on.
    Route {
        #[arg(long)]
        config: PathBuf,
        #[arg(required = true)]
        sql: Vec<String>,
    },
}

/// Routing never opens a connection; anything that tries is refused.
struct NoDriver;

impl ConnectionFactory for NoDriver {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, DriverError> {
        Err(DriverError::operational(
            2003,
            format!("no driver linked, cannot reach {}:{}", params.host, params.port),
        ))
    }
}

fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    match Cli::parse().command {
        Command::Check { config } => check(config),
        Command::Route { config, sql } => route(config, &sql),
    }
}

fn load(path: &Path) -> anyhow::Result<StoreConfig> {
    StoreConfig::from_path(path).with_context(|| format!("loading {}", path.display()))
}

fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = load(&path)?;
    info!(path = %path.display(), farms = config.farms.len(), "config is valid");
    for (name, farm) in &config.farms {
        let params = sqlfarm_store::config::parse_master(&farm.master)?;
        println!(
            "{name}\t{}:{}/{}\t{}",
            params.host,
            params.port,
            params.db,
            farm.tables.join(",")
        );
    }
    Ok(())
}

fn route(path: PathBuf, statements: &[String]) -> anyhow::Result<()> {
    let config = load(&path)?;
    let store = SqlStore::builder(Arc::new(NoDriver)).build(config)?;
    for raw in statements {
        let sql = normalize(raw);
        let parsed = parse_statement(sql).with_context(|| format!("parsing {sql:?}"))?;
        let farm = store.resolve_farm(Target::Table(&parsed.primary_table))?;
        let tables: Vec<&str> = parsed.tables.iter().map(String::as_str).collect();
        println!(
            "{}\t{}\t{}\tprimary={}\ttables={}\tmd5={}",
            farm.name(),
            farm.host(),
            parsed.command,
            parsed.primary_table,
            tables.join(","),
            fingerprint(sql)
        );
    }
    Ok(())
}
