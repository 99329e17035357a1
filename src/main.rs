//! Command-line entry point for the backtesting engine.
//!
//! Two subcommands:
//! - `backtest`: replay a symbol/timeframe through the engine and persist results
//! - `fetch-gaps`: repair missing candle history against the exchange, without backtesting

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod demo_strategy;

#[derive(Parser, Debug)]
#[command(name = "perp-backtest-engine")]
#[command(about = "Event-driven backtesting engine for leveraged perpetual-futures strategies", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a strategy backtest
    Backtest {
        /// Path to configuration file
        #[arg(short, long)]
        config: String,

        /// Start date (YYYY-MM-DD), overrides default
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD), overrides default
        #[arg(long)]
        end: Option<String>,

        /// Initial capital override
        #[arg(long)]
        capital: Option<f64>,

        /// SQLite database to persist the run and its results into
        #[arg(long, default_value = "backtests.db")]
        results_db: String,

        /// SQLite database backing the candle cache
        #[arg(long, default_value = "candles.db")]
        candle_db: String,
    },

    /// Repair missing candle history for a symbol/interval
    FetchGaps {
        /// Trading symbol, e.g. BTCUSDT
        #[arg(short, long)]
        symbol: String,

        /// Candle interval, e.g. 1m, 1h, 1d
        #[arg(short, long, default_value = "1m")]
        interval: String,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: String,

        /// SQLite database backing the candle cache
        #[arg(long, default_value = "candles.db")]
        candle_db: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!("{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn", level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Backtest { .. } => "backtest",
        Commands::FetchGaps { .. } => "fetch-gaps",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Backtest {
            config,
            start,
            end,
            capital,
            results_db,
            candle_db,
        } => commands::backtest::run(config, start, end, capital, results_db, candle_db),

        Commands::FetchGaps {
            symbol,
            interval,
            start,
            end,
            candle_db,
        } => commands::download::run(symbol, interval, start, end, candle_db),
    }
}
