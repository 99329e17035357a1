//! Storage abstraction for raw candle history, shared by the fetch job and
//! the historical data service.
//!
//! Grounded on `market_data_repository.py`'s `CandleRepository`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::{BacktestError, Result};
use crate::types::Candle;

/// Per-(symbol, timeframe) bookkeeping the data service consults before
/// hitting the exchange, mirroring the source's lazily-populated metadata
/// row (`earliest_available_time`).
#[derive(Debug, Clone, Copy)]
pub struct SeriesMetadata {
    pub earliest_available: DateTime<Utc>,
}

#[async_trait]
pub trait CandleStore: Send + Sync {
    async fn save_batch(&self, symbol: &str, interval: &str, candles: &[Candle]) -> Result<usize>;

    async fn load_range(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    async fn get_metadata(&self, symbol: &str, interval: &str) -> Result<Option<SeriesMetadata>>;

    async fn set_metadata(&self, symbol: &str, interval: &str, metadata: SeriesMetadata) -> Result<()>;
}

/// In-memory store; convenient for a one-shot CLI invocation and for tests,
/// but does not survive process exit. `SqliteCandleStore` below is the
/// persistent backend for long-lived gap repair.
#[derive(Debug, Default)]
pub struct InMemoryCandleStore {
    inner: tokio::sync::Mutex<std::collections::HashMap<(String, String), Vec<Candle>>>,
    metadata: tokio::sync::Mutex<std::collections::HashMap<(String, String), SeriesMetadata>>,
}

#[async_trait]
impl CandleStore for InMemoryCandleStore {
    async fn save_batch(&self, symbol: &str, interval: &str, candles: &[Candle]) -> Result<usize> {
        let key = (symbol.to_string(), interval.to_string());
        let mut guard = self.inner.lock().await;
        let entry = guard.entry(key).or_default();
        let mut inserted = 0;
        for candle in candles {
            if !entry.iter().any(|c| c.open_time == candle.open_time) {
                entry.push(candle.clone());
                inserted += 1;
            }
        }
        entry.sort_by_key(|c| c.open_time);
        Ok(inserted)
    }

    async fn load_range(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let key = (symbol.to_string(), interval.to_string());
        let guard = self.inner.lock().await;
        Ok(guard
            .get(&key)
            .map(|candles| {
                candles
                    .iter()
                    .filter(|c| c.open_time >= start && c.open_time < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_metadata(&self, symbol: &str, interval: &str) -> Result<Option<SeriesMetadata>> {
        let key = (symbol.to_string(), interval.to_string());
        Ok(self.metadata.lock().await.get(&key).copied())
    }

    async fn set_metadata(&self, symbol: &str, interval: &str, metadata: SeriesMetadata) -> Result<()> {
        let key = (symbol.to_string(), interval.to_string());
        self.metadata.lock().await.insert(key, metadata);
        Ok(())
    }
}

/// Persistent candle store, connection/schema conventions grounded on
/// `repository.rs`'s `SqliteBacktestRepository` (`Arc<Mutex<Connection>>`,
/// WAL + foreign_keys pragmas, idempotent `CREATE TABLE IF NOT EXISTS`).
/// Candle rows upsert on `(symbol, interval, open_time)` so repeated gap
/// repair runs are safe to retry.
pub struct SqliteCandleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCandleStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = SqliteCandleStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!("sqlite candle store initialized");
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                open_time_ms INTEGER NOT NULL,
                close_time_ms INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                quote_volume TEXT NOT NULL,
                trade_count INTEGER NOT NULL,
                taker_buy_volume TEXT NOT NULL,
                taker_buy_quote_volume TEXT NOT NULL,
                PRIMARY KEY (symbol, interval, open_time_ms)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS candle_series_metadata (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                earliest_available_ms INTEGER NOT NULL,
                PRIMARY KEY (symbol, interval)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_candles_symbol_interval_time
             ON candles(symbol, interval, open_time_ms)",
            [],
        )?;
        debug!("candle store schema created/verified");
        Ok(())
    }
}

fn decimal_to_str(d: Decimal) -> String {
    d.to_string()
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    s.parse().map_err(|e| BacktestError::validation(format!("corrupt stored decimal: {e}")))
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn save_batch(&self, symbol: &str, interval: &str, candles: &[Candle]) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut inserted = 0;
        for candle in candles {
            let changed = conn.execute(
                "INSERT INTO candles (
                    symbol, interval, open_time_ms, close_time_ms, open, high, low, close,
                    volume, quote_volume, trade_count, taker_buy_volume, taker_buy_quote_volume
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
                ON CONFLICT(symbol, interval, open_time_ms) DO NOTHING",
                params![
                    symbol,
                    interval,
                    candle.open_time.timestamp_millis(),
                    candle.close_time.timestamp_millis(),
                    decimal_to_str(candle.open),
                    decimal_to_str(candle.high),
                    decimal_to_str(candle.low),
                    decimal_to_str(candle.close),
                    decimal_to_str(candle.volume),
                    decimal_to_str(candle.quote_volume),
                    candle.trade_count as i64,
                    decimal_to_str(candle.taker_buy_volume),
                    decimal_to_str(candle.taker_buy_quote_volume),
                ],
            )?;
            inserted += changed;
        }
        Ok(inserted)
    }

    async fn load_range(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT open_time_ms, close_time_ms, open, high, low, close, volume,
                    quote_volume, trade_count, taker_buy_volume, taker_buy_quote_volume
             FROM candles
             WHERE symbol = ?1 AND interval = ?2 AND open_time_ms >= ?3 AND open_time_ms < ?4
             ORDER BY open_time_ms ASC",
        )?;
        let rows = stmt
            .query_map(
                params![symbol, interval, start.timestamp_millis(), end.timestamp_millis()],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, String>(6)?,
                        r.get::<_, String>(7)?,
                        r.get::<_, i64>(8)?,
                        r.get::<_, String>(9)?,
                        r.get::<_, String>(10)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(open_ms, close_ms, open, high, low, close, volume, quote_volume, trade_count, taker_buy_volume, taker_buy_quote_volume)| {
                    Ok(Candle {
                        open_time: Utc.timestamp_millis_opt(open_ms).single().ok_or_else(|| {
                            BacktestError::validation(format!("invalid stored timestamp: {open_ms}"))
                        })?,
                        close_time: Utc.timestamp_millis_opt(close_ms).single().ok_or_else(|| {
                            BacktestError::validation(format!("invalid stored timestamp: {close_ms}"))
                        })?,
                        open: parse_decimal(&open)?,
                        high: parse_decimal(&high)?,
                        low: parse_decimal(&low)?,
                        close: parse_decimal(&close)?,
                        volume: parse_decimal(&volume)?,
                        quote_volume: parse_decimal(&quote_volume)?,
                        trade_count: trade_count as u64,
                        taker_buy_volume: parse_decimal(&taker_buy_volume)?,
                        taker_buy_quote_volume: parse_decimal(&taker_buy_quote_volume)?,
                    })
                },
            )
            .collect()
    }

    async fn get_metadata(&self, symbol: &str, interval: &str) -> Result<Option<SeriesMetadata>> {
        let conn = self.conn.lock().unwrap();
        let earliest_ms: Option<i64> = conn
            .query_row(
                "SELECT earliest_available_ms FROM candle_series_metadata WHERE symbol = ?1 AND interval = ?2",
                params![symbol, interval],
                |r| r.get(0),
            )
            .optional()?;
        Ok(earliest_ms.and_then(|ms| {
            Utc.timestamp_millis_opt(ms).single().map(|earliest_available| SeriesMetadata { earliest_available })
        }))
    }

    async fn set_metadata(&self, symbol: &str, interval: &str, metadata: SeriesMetadata) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO candle_series_metadata (symbol, interval, earliest_available_ms)
             VALUES (?1,?2,?3)
             ON CONFLICT(symbol, interval) DO UPDATE SET earliest_available_ms=excluded.earliest_available_ms",
            params![symbol, interval, metadata.earliest_available.timestamp_millis()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle_at(minute: i64) -> Candle {
        let t = Utc.timestamp_opt(minute * 60, 0).unwrap();
        Candle {
            open_time: t,
            close_time: t + chrono::Duration::seconds(59),
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100.5),
            volume: dec!(10),
            quote_volume: dec!(1000),
            trade_count: 5,
            taker_buy_volume: dec!(5),
            taker_buy_quote_volume: dec!(500),
        }
    }

    #[tokio::test]
    async fn save_batch_dedupes_by_open_time() {
        let store = InMemoryCandleStore::default();
        let candles = vec![candle_at(0), candle_at(1)];
        assert_eq!(store.save_batch("BTCUSDT", "1m", &candles).await.unwrap(), 2);
        assert_eq!(store.save_batch("BTCUSDT", "1m", &candles).await.unwrap(), 0);

        let loaded = store
            .load_range("BTCUSDT", "1m", Utc.timestamp_opt(0, 0).unwrap(), Utc.timestamp_opt(600, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn sqlite_store_persists_and_dedupes_across_saves() {
        let store = SqliteCandleStore::new(":memory:").unwrap();
        let candles = vec![candle_at(0), candle_at(1)];
        assert_eq!(store.save_batch("BTCUSDT", "1m", &candles).await.unwrap(), 2);
        assert_eq!(store.save_batch("BTCUSDT", "1m", &candles).await.unwrap(), 0);

        let loaded = store
            .load_range("BTCUSDT", "1m", Utc.timestamp_opt(0, 0).unwrap(), Utc.timestamp_opt(600, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].close, candles[0].close);
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_metadata() {
        let store = SqliteCandleStore::new(":memory:").unwrap();
        assert!(store.get_metadata("BTCUSDT", "1m").await.unwrap().is_none());

        let earliest = Utc.timestamp_opt(1000, 0).unwrap();
        store
            .set_metadata("BTCUSDT", "1m", SeriesMetadata { earliest_available: earliest })
            .await
            .unwrap();
        let fetched = store.get_metadata("BTCUSDT", "1m").await.unwrap().unwrap();
        assert_eq!(fetched.earliest_available, earliest);
    }
}
