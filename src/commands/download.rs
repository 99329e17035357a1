//! Fetch-gaps command: repairs missing candle history for a symbol/interval
//! against the persistent candle store, without running a backtest.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use tracing::info;

use perp_backtest_engine::{BinanceExchangeAdapter, FetchOptions, HistoricalDataService, SqliteCandleStore};

pub fn run(symbol: String, interval: String, start: String, end: String, candle_db: String) -> Result<()> {
    let start = NaiveDate::parse_from_str(&start, "%Y-%m-%d")
        .context("expected --start as YYYY-MM-DD")?;
    let end = NaiveDate::parse_from_str(&end, "%Y-%m-%d").context("expected --end as YYYY-MM-DD")?;
    let start = Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0).unwrap());
    let end = Utc.from_utc_datetime(&end.and_hms_opt(0, 0, 0).unwrap());

    println!("\n{}", "=".repeat(60));
    println!("FETCHING HISTORICAL DATA GAPS");
    println!("{}", "=".repeat(60));
    println!("  Symbol:   {}", symbol);
    println!("  Interval: {}", interval);
    println!("  Range:    {} .. {}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"));
    println!("{}\n", "=".repeat(60));

    let rt = tokio::runtime::Runtime::new()?;
    let candles = rt.block_on(async {
        let adapter = Arc::new(BinanceExchangeAdapter::new());
        let store = Arc::new(SqliteCandleStore::new(&candle_db)?);
        let service = HistoricalDataService::new(store, adapter);
        service
            .get_historical_candles(
                &symbol,
                &interval,
                start,
                end,
                FetchOptions {
                    wait_for_data: true,
                    ..Default::default()
                },
                Some(&|pct, msg| info!(pct, msg, "repairing gaps")),
            )
            .await
    })?;

    println!("Fetched {} candles covering the requested range.", candles.len());
    Ok(())
}
