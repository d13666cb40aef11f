//! Intent firewall CLI.
//!
//! Runs the intake pipeline in dry-run mode, replays recorded intents, and
//! maintains the purchase ledger.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use intent_firewall::db::{Database, PurchaseLedger};
use intent_firewall::executor::DryRunExecutor;
use intent_firewall::ingest::{replay_lines, FileTailIngestor, HttpIngestor, IntentIngestor};
use intent_firewall::models::{CapitalState, PurchaseRecord};
use intent_firewall::trading::{CopierConfig, Firewall, RiskKernel};

/// Copy-trade intent firewall CLI.
#[derive(Parser)]
#[command(name = "intent-firewall")]
#[command(about = "Validate copy-trade intents and gate them through risk checks", long_about = None)]
struct Cli {
    /// Database URL (overrides COPIER_DATABASE_URL)
    #[arg(short, long)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept intents over HTTP and dry-run them until Ctrl+C
    Serve {
        /// Listen address (overrides COPIER_HTTP_BIND)
        #[arg(short, long)]
        bind: Option<String>,

        #[command(flatten)]
        capital: CapitalArgs,
    },

    /// Tail a JSONL intent file and dry-run it until Ctrl+C
    Tail {
        /// Intent file to follow
        #[arg(short, long)]
        file: PathBuf,

        /// Skip lines already in the file
        #[arg(long)]
        from_end: bool,

        #[command(flatten)]
        capital: CapitalArgs,
    },

    /// Replay recorded intents through a fresh firewall
    Replay {
        /// JSONL file of recorded payloads
        #[arg(short, long)]
        file: PathBuf,

        /// Print every rejection
        #[arg(short, long)]
        verbose: bool,
    },

    /// Inspect and maintain the purchase ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },

    /// Print the effective configuration
    Config,
}

/// Capital snapshot fed to the risk kernel during a dry run.
#[derive(Args)]
struct CapitalArgs {
    /// Current capital in USDC (defaults to starting capital)
    #[arg(long)]
    capital: Option<Decimal>,

    /// Today's P&L in USDC
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    daily_pnl: Decimal,
}

#[derive(Subcommand)]
enum LedgerCommands {
    /// List purchase lots for a market/asset in FIFO order
    List { market: String, asset: String },

    /// Show every market/asset with unsold tokens
    Holdings,

    /// Compute a sell size from tracked holdings
    SellAmount {
        market: String,
        asset: String,
        /// Fraction of holdings the copied trader sold (0-1)
        fraction: Decimal,
    },

    /// Record a BUY fill by hand
    Record {
        market: String,
        asset: String,
        tokens: Decimal,
        price: Decimal,

        /// Copied trader address
        #[arg(long, default_value = "manual")]
        trader: String,

        #[arg(long, default_value = "manual")]
        intent_id: String,

        #[arg(long)]
        order_id: Option<String>,
    },

    /// Allocate a sale FIFO against recorded lots
    Sell {
        market: String,
        asset: String,
        tokens: Decimal,
    },

    /// Delete all lots for a closed position
    Clear { market: String, asset: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = CopierConfig::from_env().context("Invalid configuration")?;
    if let Some(database) = cli.database {
        config.database_url = database;
    }

    match cli.command {
        Commands::Serve { bind, capital } => {
            if let Some(bind) = bind {
                config.ingest.http_bind = bind;
            }
            let firewall = Arc::new(Firewall::new(config.firewall.clone()));
            let ingestor = HttpIngestor::new(firewall, config.ingest.clone());
            run_dry(&config, &ingestor, &capital).await?;
        }

        Commands::Tail {
            file,
            from_end,
            capital,
        } => {
            config.ingest.start_at_end |= from_end;
            let firewall = Arc::new(Firewall::new(config.firewall.clone()));
            let ingestor = FileTailIngestor::new(file, firewall, config.ingest.clone());
            run_dry(&config, &ingestor, &capital).await?;
        }

        Commands::Replay { file, verbose } => {
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let firewall = Arc::new(Firewall::new(config.firewall.clone()));
            let report = replay_lines(content.split(|b| *b == b'\n'), firewall);

            println!("\n=== Replay: {} ===", file.display());
            println!("Accepted:      {}", report.accepted.len());
            println!("Rejected:      {}", report.stats.rejected);
            println!("Parse errors:  {}", report.stats.parse_errors);
            println!("\n--- Rejections by reason ---");
            let fw = &report.stats.firewall;
            println!("Trader not allowed:  {}", fw.trader_not_allowed);
            println!("Market not allowed:  {}", fw.market_not_allowed);
            println!("Stale:               {}", fw.stale);
            println!("Size out of bounds:  {}", fw.size_out_of_bounds);
            println!("Duplicate:           {}", fw.duplicate);

            if verbose && !report.rejections.is_empty() {
                println!("\n{:>6} {:<20} DETAIL", "LINE", "REASON");
                println!("{}", "-".repeat(80));
                for r in &report.rejections {
                    println!("{:>6} {:<20} {}", r.line, r.reason, r.detail);
                }
            }
        }

        Commands::Ledger { command } => {
            let db = Database::new(&config.database_url).await?;
            run_ledger(PurchaseLedger::new(db), command).await?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Run an ingestor into the dry-run executor until Ctrl+C or a kill.
async fn run_dry(config: &CopierConfig, ingestor: &dyn IntentIngestor, capital: &CapitalArgs) -> Result<()> {
    if config.firewall.allowed_traders.is_empty() {
        warn!("COPIER_ALLOWED_TRADERS is empty, every intent will be rejected");
    }

    let db = Database::new(&config.database_url).await?;
    let ledger = Arc::new(PurchaseLedger::new(db));
    let kernel = Arc::new(RiskKernel::new(config.risk.clone()));

    let starting = config.risk.starting_capital;
    let capital = CapitalState::new(starting, capital.capital.unwrap_or(starting), capital.daily_pnl);
    let executor = DryRunExecutor::new(kernel, ledger, capital);

    // Register shutdown handler
    let shutdown = executor.shutdown_signal();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        shutdown.store(true, Ordering::SeqCst);
    });

    let summary = executor.run(ingestor).await?;

    println!("\n=== Session Summary ===");
    println!("Processed:     {}", summary.processed);
    println!("Validated:     {}", summary.ingest.validated);
    println!("Rejected:      {}", summary.ingest.rejected);
    println!("Parse errors:  {}", summary.ingest.parse_errors);
    println!("Left queued:   {}", summary.ingest.queue_depth);
    if let Some(reason) = summary.kill_reason {
        println!("KILLED:        {}", reason);
    }
    Ok(())
}

async fn run_ledger(ledger: PurchaseLedger, command: LedgerCommands) -> Result<()> {
    match command {
        LedgerCommands::List { market, asset } => {
            let lots = ledger.list_purchases(&market, &asset).await?;
            if lots.is_empty() {
                println!("No purchases recorded for {}/{}", market, asset);
                return Ok(());
            }

            println!(
                "\n{:<36} {:>12} {:>12} {:>8} {:<20}",
                "ID", "BOUGHT", "REMAINING", "PRICE", "PURCHASED"
            );
            println!("{}", "-".repeat(92));
            for lot in lots {
                println!(
                    "{:<36} {:>12} {:>12} {:>8} {:<20}",
                    lot.id,
                    lot.tokens_bought,
                    lot.tokens_remaining,
                    lot.price,
                    lot.purchased_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        LedgerCommands::Holdings => {
            let holdings = ledger.open_holdings().await?;
            if holdings.is_empty() {
                println!("No open holdings.");
                return Ok(());
            }

            println!(
                "\n{:<44} {:<10} {:>12} {:>10} {:>6}",
                "MARKET", "ASSET", "TOKENS", "AVG PRICE", "LOTS"
            );
            println!("{}", "-".repeat(86));
            for h in holdings {
                println!(
                    "{:<44} {:<10} {:>12} {:>10} {:>6}",
                    h.market_id,
                    h.asset_id,
                    h.tokens_remaining,
                    h.average_price.round_dp(4),
                    h.lots
                );
            }
        }

        LedgerCommands::SellAmount {
            market,
            asset,
            fraction,
        } => {
            let sell = ledger.calculate_sell_amount(&market, &asset, fraction).await?;
            println!("Tracked:  {}", sell.tracked_total);
            println!("Fraction: {}", sell.fraction);
            println!("Sell:     {}", sell.amount);
            if let Some(warning) = sell.warning {
                println!("Warning:  {}", warning);
            }
        }

        LedgerCommands::Record {
            market,
            asset,
            tokens,
            price,
            trader,
            intent_id,
            order_id,
        } => {
            let mut record =
                PurchaseRecord::new(market, asset, tokens, price, Utc::now(), trader, intent_id);
            if let Some(order_id) = order_id {
                record = record.with_order_id(order_id);
            }
            ledger.record_purchase(&record).await?;
            println!("Recorded purchase {}", record.id);
        }

        LedgerCommands::Sell {
            market,
            asset,
            tokens,
        } => {
            let sale = ledger.record_sale(&market, &asset, tokens, Utc::now()).await?;
            println!("Allocated: {} of {}", sale.allocated, sale.requested);
            println!("Cost basis: {}", sale.cost_basis());
            if sale.is_oversold() {
                println!("Shortfall: {} (ledger holds fewer tokens than sold)", sale.shortfall);
            }
        }

        LedgerCommands::Clear { market, asset } => {
            let removed = ledger.clear_position(&market, &asset).await?;
            println!("Removed {} lots for {}/{}", removed, market, asset);
        }
    }

    Ok(())
}
