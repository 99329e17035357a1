//! Historical data service: fronts the candle store with gap detection and
//! repair, optionally blocking the caller until the repair completes.
//!
//! Grounded on `historical_data_service.py`'s `get_historical_candles`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::info;

use crate::candle_store::{CandleStore, SeriesMetadata};
use crate::error::{BacktestError, Result};
use crate::exchange_adapter::ExchangeAdapter;
use crate::fetch_job::FetchMissingCandlesJob;
use crate::gap_detector::detect_gaps;
use crate::types::Candle;

/// Nothing before this date is considered real market data; a request
/// asking for history older than this is clamped forward rather than
/// treated as an error.
fn global_earliest() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap()
}

const DEFAULT_MAX_WAIT_SECONDS: u64 = 600;
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 2;
const DEFAULT_FETCH_CONCURRENCY: usize = 48;

pub type ProgressCallback<'a> = dyn Fn(u8, &str) + Send + Sync + 'a;

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub repair: bool,
    pub wait_for_data: bool,
    pub max_wait_seconds: u64,
    pub poll_interval_seconds: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            repair: true,
            wait_for_data: false,
            max_wait_seconds: DEFAULT_MAX_WAIT_SECONDS,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
        }
    }
}

pub struct HistoricalDataService {
    store: Arc<dyn CandleStore>,
    adapter: Arc<dyn ExchangeAdapter>,
    fetch_concurrency: usize,
}

impl HistoricalDataService {
    pub fn new(store: Arc<dyn CandleStore>, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        HistoricalDataService {
            store,
            adapter,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }

    pub fn with_fetch_concurrency(mut self, concurrency: usize) -> Self {
        self.fetch_concurrency = concurrency;
        self
    }

    pub async fn get_historical_candles(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: FetchOptions,
        progress_cb: Option<&ProgressCallback<'_>>,
    ) -> Result<Vec<Candle>> {
        let symbol = symbol.replace('/', "");
        let start = start.max(global_earliest());
        if start >= end {
            return Ok(Vec::new());
        }

        if self.store.get_metadata(&symbol, interval).await?.is_none() {
            let earliest_ms = self.adapter.get_earliest_valid_timestamp(&symbol, interval).await?;
            let earliest = if earliest_ms > 0 {
                Utc.timestamp_millis_opt(earliest_ms).single().unwrap_or(start)
            } else {
                start
            };
            self.store
                .set_metadata(&symbol, interval, SeriesMetadata { earliest_available: earliest })
                .await?;
        }

        let mut candles = self.store.load_range(&symbol, interval, start, end).await?;
        let gaps = detect_gaps(&candles, start, end, interval)?;

        if gaps.is_empty() || !options.repair {
            return Ok(candles);
        }

        let job = FetchMissingCandlesJob::new(Arc::clone(&self.adapter), Arc::clone(&self.store));
        let initial_gap_seconds: i64 = gaps.iter().map(|g| (g.end - g.start).num_seconds()).sum();

        for gap in &gaps {
            job.run_parallel(&symbol, interval, gap.start, gap.end, self.fetch_concurrency)
                .await?;
        }

        if !options.wait_for_data {
            return self.store.load_range(&symbol, interval, start, end).await;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(options.max_wait_seconds);
        loop {
            candles = self.store.load_range(&symbol, interval, start, end).await?;
            let remaining = detect_gaps(&candles, start, end, interval)?;
            let remaining_seconds: i64 = remaining.iter().map(|g| (g.end - g.start).num_seconds()).sum();

            if let Some(cb) = progress_cb {
                let percent = if initial_gap_seconds > 0 {
                    (((initial_gap_seconds - remaining_seconds) as f64 / initial_gap_seconds as f64) * 100.0)
                        .clamp(0.0, 100.0) as u8
                } else {
                    100
                };
                cb(percent, "repairing historical data gaps");
            }

            if remaining.is_empty() {
                info!(symbol, interval, "historical data fully repaired");
                return Ok(candles);
            }
            if tokio::time::Instant::now() >= deadline {
                if candles.is_empty() {
                    return Err(BacktestError::DataGap {
                        covered_seconds: 0,
                        needed_seconds: (end - start).num_seconds(),
                    });
                }
                info!(symbol, interval, "returning partial data after max_wait_seconds");
                return Ok(candles);
            }
            tokio::time::sleep(Duration::from_secs(options.poll_interval_seconds)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_store::InMemoryCandleStore;
    use crate::exchange_adapter::RawKline;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct StubAdapter;

    #[async_trait]
    impl ExchangeAdapter for StubAdapter {
        async fn get_klines(
            &self,
            _symbol: &str,
            _interval: &str,
            start_ms: i64,
            end_ms: i64,
            _limit: u32,
        ) -> Result<Vec<RawKline>> {
            Ok(vec![RawKline {
                open_time_ms: start_ms,
                open: dec!(100),
                high: dec!(101),
                low: dec!(99),
                close: dec!(100.5),
                volume: dec!(1),
                close_time_ms: end_ms.min(start_ms + 59_000),
                quote_volume: dec!(100),
                trade_count: 1,
                taker_buy_volume: dec!(1),
                taker_buy_quote_volume: dec!(100),
            }])
        }

        async fn get_earliest_valid_timestamp(&self, _symbol: &str, _interval: &str) -> Result<i64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn repairs_gap_and_returns_candles() {
        let store = Arc::new(InMemoryCandleStore::default());
        let adapter = Arc::new(StubAdapter);
        let service = HistoricalDataService::new(store, adapter);

        let start = Utc.timestamp_opt(0, 0).unwrap();
        let end = start + chrono::Duration::minutes(2);
        let candles = service
            .get_historical_candles("BTC/USDT", "1m", start, end, FetchOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(candles.len(), 2);
    }
}
