//! Backtest command implementation.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tracing::info;
use uuid::Uuid;

use perp_backtest_engine::{
    BacktestConfig, BacktestEngine, BacktestRepository, BinanceExchangeAdapter, FetchOptions,
    HistoricalDataService, SqliteBacktestRepository, SqliteCandleStore,
};
use perp_backtest_engine::monthly_pnl::MonthlyPnLMatrix;
use perp_backtest_engine::run::BacktestRun;

fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDate::parse_from_str(s, "%Y-%m-%d").context("expected date as YYYY-MM-DD")?;
    Ok(Utc.from_utc_datetime(&naive.and_hms_opt(0, 0, 0).unwrap()))
}

pub fn run(
    config_path: String,
    start_override: Option<String>,
    end_override: Option<String>,
    capital_override: Option<f64>,
    results_db: String,
    candle_db: String,
) -> Result<()> {
    info!("Starting backtest");

    let mut config = BacktestConfig::from_file(&config_path)?;
    info!(config_path, "loaded configuration");

    if let Some(capital) = capital_override {
        let capital = rust_decimal::Decimal::try_from(capital).context("invalid --capital value")?;
        info!(%capital, "overriding initial capital");
        config.initial_capital = capital;
    }

    let start = start_override
        .as_deref()
        .map(parse_date)
        .transpose()?
        .unwrap_or_else(|| Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    let end = end_override
        .as_deref()
        .map(parse_date)
        .transpose()?
        .unwrap_or_else(Utc::now);

    let tokio_rt = tokio::runtime::Runtime::new()?;
    let candles = tokio_rt.block_on(async {
        let adapter = Arc::new(BinanceExchangeAdapter::new());
        let store = Arc::new(SqliteCandleStore::new(&candle_db)?);
        let service = HistoricalDataService::new(store, adapter);
        service
            .get_historical_candles(
                &config.symbol,
                &config.timeframe,
                start,
                end,
                FetchOptions {
                    wait_for_data: true,
                    ..Default::default()
                },
                Some(&|pct, msg| info!(pct, msg, "fetching historical data")),
            )
            .await
    })?;
    info!(candles = candles.len(), "historical data ready");

    let run_id = Uuid::new_v4();
    let mut backtest_run = BacktestRun::new(Uuid::nil(), Uuid::nil(), config.clone(), start, end);
    backtest_run.id = run_id;
    backtest_run.start()?;

    let engine = BacktestEngine::new(config.clone());
    let mut strategy = crate::demo_strategy::EmaCrossoverStrategy::default();
    let results = engine.run(
        run_id,
        &candles,
        &mut strategy,
        |pct, msg| info!(pct, msg, "backtest progress"),
        || false,
    )?;

    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS");
    println!("{}", "=".repeat(60));
    println!("Symbol:             {}", config.symbol);
    println!("Start Date:         {}", start.format("%Y-%m-%d"));
    println!("End Date:           {}", end.format("%Y-%m-%d"));
    println!("Initial Capital:    {:.2}", config.initial_capital);
    println!("Final Equity:       {:.2}", results.final_equity);
    println!("Total Return:       {:.2}%", results.total_return(config.initial_capital));
    println!("Sharpe Ratio:       {:.2}", results.metrics.sharpe_ratio);
    println!("Calmar Ratio:       {:.2}", results.metrics.calmar_ratio);
    println!("Max Drawdown:       {:.2}%", results.metrics.max_drawdown);
    println!("Win Rate:           {:.2}%", results.win_rate());
    println!("Profit Factor:      {:.2}", results.metrics.profit_factor);
    println!("Total Trades:       {}", results.total_trades());
    println!("Winning Trades:     {}", results.winning_trades());
    println!("Losing Trades:      {}", results.losing_trades());
    println!("{}", "=".repeat(60));

    let monthly = MonthlyPnLMatrix::from_trades(&results.trades);
    print!("{}", monthly.render_colored());

    backtest_run.complete(results)?;
    let repo = SqliteBacktestRepository::new(&results_db)?;
    repo.save(&backtest_run)?;
    info!(run_id = %run_id, results_db, "backtest run persisted");

    Ok(())
}
