mod config;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use vault_core::{DateRange, DividendEngine, Timestamp};
use vault_store::SqliteLedger;

use crate::config::Config;
use crate::server::AppState;

#[derive(Parser)]
#[command(name = "vault", about = "Personal data vault: dividends, contexts and the Vault API")]
struct Cli {
    /// Config file (default: $VAULT_CONFIG, then vault.toml in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding VAULT_DATA_DIR and [store] path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Listen address, overriding [server] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Print the dividend rate table
    Rates,

    /// Calculate and record one dividend
    Dividend {
        user: String,
        data_type: String,
        count: u64,

        /// Quality score in [0, 1]
        #[arg(long, default_value_t = 1.0)]
        quality: f64,
    },

    /// Sum a user's dividends by data type
    Earnings {
        user: String,

        /// Inclusive lower bound (YYYY-MM-DD or full timestamp)
        #[arg(long)]
        start: Option<Timestamp>,

        /// Inclusive upper bound
        #[arg(long)]
        end: Option<Timestamp>,
    },

    /// Export the ledger to a JSON file
    Export {
        /// Output file path
        path: PathBuf,
    },

    /// Import a ledger snapshot from a JSON file
    Import {
        /// Input file path
        path: PathBuf,
    },
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn load_config(cli: &Cli) -> Result<Config> {
    let data_dir = config::data_dir(env_path("VAULT_DATA_DIR"));
    let explicit = cli.config.clone().or_else(|| env_path("VAULT_CONFIG"));
    let path = config::resolve_config_path(explicit, &data_dir);
    Config::load_or_default(path.as_deref())
}

fn open_ledger(cli: &Cli, config: &Config) -> Result<Arc<SqliteLedger>> {
    let env_dir = env_path("VAULT_DATA_DIR");
    let path = config::resolve_db_path(cli.db.as_deref(), env_dir.as_deref(), config);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let ledger = SqliteLedger::open(&path)
        .with_context(|| format!("failed to open ledger at {}", path.display()))?;
    Ok(Arc::new(ledger))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Serve { bind } => cmd_serve(&cli, &config, bind.as_deref()).await,
        Commands::Rates => cmd_rates(&config),
        Commands::Dividend {
            user,
            data_type,
            count,
            quality,
        } => cmd_dividend(&cli, &config, user, data_type, *count, *quality),
        Commands::Earnings { user, start, end } => {
            cmd_earnings(&cli, &config, user, DateRange::new(*start, *end))
        }
        Commands::Export { path } => cmd_export(&cli, &config, path),
        Commands::Import { path } => cmd_import(&cli, &config, path),
    }
}

async fn cmd_serve(cli: &Cli, config: &Config, bind: Option<&str>) -> Result<()> {
    let ledger = open_ledger(cli, config)?;
    let state = AppState::new(ledger, config)?;
    let bind = bind.unwrap_or(&config.server.bind);
    server::serve(Arc::new(state), bind).await
}

fn cmd_rates(config: &Config) -> Result<()> {
    let rates = config.rate_table()?;
    for (data_type, rate) in rates.entries() {
        println!("{data_type:<10} {rate:.6}");
    }
    println!("{:<10} {:.6}", vault_core::DEFAULT_KEY, rates.default_rate());
    Ok(())
}

fn dividend_engine(cli: &Cli, config: &Config) -> Result<DividendEngine> {
    Ok(DividendEngine::new(
        open_ledger(cli, config)?,
        config.rate_table()?,
    ))
}

fn cmd_dividend(
    cli: &Cli,
    config: &Config,
    user: &str,
    data_type: &str,
    count: u64,
    quality: f64,
) -> Result<()> {
    let engine = dividend_engine(cli, config)?;
    let dividend = engine
        .calculate_dividend(user, data_type, count, quality)
        .context("failed to calculate dividend")?;
    println!("dividend: {dividend:.6}");
    Ok(())
}

fn cmd_earnings(cli: &Cli, config: &Config, user: &str, range: DateRange) -> Result<()> {
    let engine = dividend_engine(cli, config)?;
    let earnings = engine
        .calculate_total_earnings(user, &range)
        .context("failed to sum earnings")?;
    for (data_type, amount) in &earnings.by_type {
        println!("{data_type:<10} {amount:.6}");
    }
    println!("{:<10} {:.6}", "total", earnings.total);
    Ok(())
}

fn cmd_export(cli: &Cli, config: &Config, path: &Path) -> Result<()> {
    let ledger = open_ledger(cli, config)?;
    ledger
        .export_json_file(path)
        .context("failed to export ledger")?;
    println!("exported to {}", path.display());
    Ok(())
}

fn cmd_import(cli: &Cli, config: &Config, path: &Path) -> Result<()> {
    let ledger = open_ledger(cli, config)?;
    let records = ledger
        .import_json_file(path)
        .context("failed to import JSON")?;
    println!("imported {records} records from {}", path.display());
    Ok(())
}
