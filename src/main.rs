use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use price_sync::logging::init_tracing;
use price_sync::market::Market;
use price_sync::orchestrator::{partition_batches, SyncOptions, SyncOrchestrator, WorkingSet};
use price_sync::patcher::Patcher;
use price_sync::providers::{source_from_env, SourceKind, MAX_BATCH_SIZE};
use price_sync::registry::{normalize_asin, Registry};
use price_sync::util::env as env_util;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "price-sync",
    version,
    about = "Keep hardcoded Amazon prices in site templates in sync with live prices"
)]
struct Cli {
    /// Log skipped price fields and other per-line decisions
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Fetch current prices and rewrite template price fields that moved enough
    Sync(SyncArgs),
    /// Fetch and print current prices without touching any file
    Check {
        /// Upstream to query (default: env PRICE_SYNC_SOURCE, then keepa)
        #[arg(long, value_enum)]
        source: Option<SourceKind>,
        /// Storefront: us, uk, de, fr, it, es
        #[arg(long, default_value = "de")]
        market: Market,
        /// ASINs to look up
        #[arg(required = true)]
        asins: Vec<String>,
    },
    /// List the price fields currently recorded for every registry entry (offline)
    Scan {
        /// Path to the registry TOML
        #[arg(long, default_value = "prices.toml")]
        registry: PathBuf,
    },
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Path to the registry TOML
    #[arg(long, default_value = "prices.toml")]
    registry: PathBuf,
    /// Upstream to query (default: env PRICE_SYNC_SOURCE, then keepa)
    #[arg(long, value_enum)]
    source: Option<SourceKind>,
    /// Minimum change in percent before a field is rewritten (overrides registry)
    #[arg(long)]
    threshold: Option<f64>,
    /// Pause between upstream calls in milliseconds (overrides registry)
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Compute and log changes without writing any file
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Write the run summary as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

fn resolve_source(flag: Option<SourceKind>) -> Result<SourceKind> {
    if let Some(kind) = flag {
        return Ok(kind);
    }
    match env_util::env_opt("PRICE_SYNC_SOURCE") {
        Some(raw) => raw.parse().context("PRICE_SYNC_SOURCE"),
        None => Ok(SourceKind::Keepa),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_util::init_env();
    let cli = Cli::parse();
    init_tracing("info", cli.verbose)?;

    match cli.command {
        Commands::Sync(args) => run_sync(args).await,
        Commands::Check {
            source,
            market,
            asins,
        } => run_check(source, market, asins).await,
        Commands::Scan { registry } => run_scan(registry),
    }
}

async fn run_sync(args: SyncArgs) -> Result<()> {
    let registry = Registry::from_file(&args.registry)?;
    let set = WorkingSet::from_entries(&registry.entries);
    if set.is_empty() {
        warn!(registry = %args.registry.display(), "registry lists no products; nothing to do");
        return Ok(());
    }

    let threshold = args
        .threshold
        .unwrap_or(registry.settings.threshold_percent);
    if threshold.is_nan() || threshold < 0.0 {
        bail!("--threshold must be >= 0");
    }

    let kind = resolve_source(args.source)?;
    let source = source_from_env(kind, &set.markets())?;

    let patcher = Patcher::new(registry.scan.clone(), threshold).with_dry_run(args.dry_run);
    let options = SyncOptions {
        batch_size: registry.settings.batch_size,
        batch_delay: Duration::from_millis(
            args.delay_ms.unwrap_or(registry.settings.batch_delay_ms),
        ),
    };

    info!(
        source = %kind,
        identifiers = set.len(),
        markets = ?set.markets(),
        threshold_pct = threshold,
        dry_run = args.dry_run,
        "starting price sync"
    );

    let summary = SyncOrchestrator::new(source.as_ref(), patcher, options)
        .run(&set)
        .await;
    summary.log();

    if let Some(path) = args.report {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(&path, json)
            .with_context(|| format!("write report {}", path.display()))?;
        info!(path = %path.display(), "run report written");
    }
    Ok(())
}

async fn run_check(source: Option<SourceKind>, market: Market, asins: Vec<String>) -> Result<()> {
    let asins = asins
        .iter()
        .map(|a| normalize_asin(a))
        .collect::<Result<Vec<_>>>()?;
    let kind = resolve_source(source)?;
    let source = source_from_env(kind, &[market])?;
    let currency = market.currency();

    for (idx, batch) in partition_batches(&asins, MAX_BATCH_SIZE).iter().enumerate() {
        if idx > 0 {
            tokio::time::sleep(Duration::from_millis(
                price_sync::registry::DEFAULT_BATCH_DELAY_MS,
            ))
            .await;
        }
        let prices = source.fetch_prices(batch, market).await?;
        for asin in batch {
            match prices.get(asin) {
                Some(price) => println!(
                    "{asin}  {}  ({price:.2} {})",
                    currency.format(price.round() as i64),
                    market.currency_code()
                ),
                None => println!("{asin}  no offer"),
            }
        }
    }
    Ok(())
}

fn run_scan(registry_path: PathBuf) -> Result<()> {
    let registry = Registry::from_file(&registry_path)?;
    let patcher = Patcher::new(registry.scan.clone(), registry.settings.threshold_percent);

    for entry in &registry.entries {
        let asin = &entry.product.asin;
        let market = entry.product.market;
        for file in &entry.files {
            match patcher.recorded_prices(file, asin)? {
                None => println!("{asin}@{market}  {}  MISSING FILE", file.display()),
                Some(found) if found.is_empty() => {
                    println!("{asin}@{market}  {}  no price field", file.display())
                }
                Some(found) => {
                    for p in found {
                        let parsed = p
                            .value
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "unparsable".to_string());
                        println!(
                            "{asin}@{market}  {}:{}  '{}'  ({parsed})",
                            file.display(),
                            p.line,
                            p.raw
                        );
                    }
                }
            }
        }
    }
    Ok(())
}
