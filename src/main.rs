use clap::{Parser, Subcommand};
use pylon::config::{AppConfig, LoggingConfig};
use pylon::error::Result;
use pylon::exchange::PaperExchange;
use pylon::persistence::SnapshotStore;
use pylon::portfolio::LogPortfolio;
use pylon::runtime::Runtime;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pylon", about = "Order & position lifecycle engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine
    Run {
        /// Path to the TOML configuration file
        #[arg(long, env = "PYLON_CONFIG", default_value = "pylon.toml")]
        config: String,
        /// Trade against the in-memory paper exchange
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the snapshots in a snapshot directory
    Inspect {
        #[arg(long, default_value = "snapshots")]
        dir: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, dry_run } => {
            let config = AppConfig::load(&config)?;
            let _guard = init_logging(&config.logging);
            run_engine(config, dry_run).await
        }
        Commands::Inspect { dir } => {
            init_logging_simple();
            inspect_snapshots(&dir).await
        }
    }
}

fn init_logging(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pylon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if config.json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            }
            Some(guard)
        }
        None => {
            if config.json {
                tracing_subscriber::fmt().with_env_filter(filter).json().init();
            } else {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
            None
        }
    }
}

fn init_logging_simple() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_engine(config: AppConfig, dry_run: bool) -> Result<()> {
    if !dry_run {
        // The live exchange transport ships separately; everything in
        // this binary runs against the paper venue.
        warn!("live exchange client not configured; falling back to paper exchange");
    }

    let exchange = Arc::new(PaperExchange::new());
    seed_paper_market(&exchange, &config);
    spawn_paper_feed(exchange.clone(), config.symbols.clone());

    let mut runtime = Runtime::new(
        config.clone(),
        exchange.clone(),
        exchange.clone(),
        Arc::new(LogPortfolio),
    )
    .await?;
    runtime.start().await?;

    // Paper mode trades on a simple standing entry signal per symbol so
    // the whole lifecycle is exercised end to end
    for symbol in &config.symbols {
        let _ = runtime.on_entry_signal(symbol, "paper-entry");
    }

    info!("engine running; ctrl-c to stop");
    signal::ctrl_c().await?;
    runtime.shutdown(Duration::from_secs(30)).await
}

fn seed_paper_market(exchange: &PaperExchange, config: &AppConfig) {
    for symbol in &config.symbols {
        exchange.set_ticker(
            symbol,
            Decimal::from(100),
            Decimal::from_f64(100.05).unwrap_or(Decimal::from(100)),
        );
    }
}

/// Random-walk ticker feed for the paper venue.
fn spawn_paper_feed(exchange: Arc<PaperExchange>, symbols: Vec<String>) {
    tokio::spawn(async move {
        let mut mid = 100.0f64;
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            ticker.tick().await;
            let step: f64 = rand::thread_rng().gen_range(-0.2..0.2);
            mid = (mid + step).max(1.0);
            let bid = Decimal::from_f64(mid).unwrap_or(Decimal::from(100));
            let ask = Decimal::from_f64(mid + 0.05).unwrap_or(bid);
            for symbol in &symbols {
                exchange.set_ticker(symbol, bid, ask);
            }
        }
    });
}

async fn inspect_snapshots(dir: &str) -> Result<()> {
    let store = SnapshotStore::new(dir).await?;
    let states = store.load_all().await?;
    if states.is_empty() {
        println!("no snapshots in {}", dir);
        return Ok(());
    }
    for state in states {
        println!(
            "{:<12} phase={:<14} seq={:<6} position={} protection={}",
            state.symbol(),
            state.phase().to_string(),
            state.transition_seq,
            state
                .position
                .as_ref()
                .map(|p| format!("{}@{}", p.qty, p.avg_entry_price))
                .unwrap_or_else(|| "-".to_string()),
            state
                .protection
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}
