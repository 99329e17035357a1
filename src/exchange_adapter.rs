//! Exchange-adapter trait consumed by the fetch job and data service, plus
//! a concrete Binance implementation.
//!
//! Grounded on `binance_adapter.py`'s `BinanceAdapter` interface and the
//! host codebase's own `binance::BinanceClient`.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::common::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{BacktestError, Result};
use crate::types::Candle;

/// One exchange kline as the eleven documented fields, before domain conversion.
#[derive(Debug, Clone)]
pub struct RawKline {
    pub open_time_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time_ms: i64,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub taker_buy_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
}

impl RawKline {
    pub fn into_candle(self) -> Result<Candle> {
        let open_time = ms_to_datetime(self.open_time_ms)?;
        let close_time = ms_to_datetime(self.close_time_ms)?;
        let candle = Candle {
            open_time,
            close_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quote_volume: self.quote_volume,
            trade_count: self.trade_count,
            taker_buy_volume: self.taker_buy_volume,
            taker_buy_quote_volume: self.taker_buy_quote_volume,
        };
        candle.validate()?;
        Ok(candle)
    }
}

fn ms_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| BacktestError::validation(format!("invalid exchange timestamp: {ms}")))
}

/// Consumed by the fetch job and historical data service. Implementations
/// must be cheap to clone (an `Arc`-wrapped HTTP client is typical) so a
/// worker pool can share one instance.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<RawKline>>;

    /// Returns the earliest timestamp (ms) the exchange has data for, or 0
    /// if the exchange does not support the probe and the caller should
    /// fall back to a configured floor.
    async fn get_earliest_valid_timestamp(&self, symbol: &str, interval: &str) -> Result<i64>;
}

const BINANCE_API_BASE: &str = "https://api.binance.com/api/v3";

/// Default adapter, backed by `reqwest` against Binance's public REST API.
/// No signing is required for kline/market-data endpoints.
pub struct BinanceExchangeAdapter {
    client: reqwest::Client,
    breaker: Mutex<CircuitBreaker>,
}

impl Default for BinanceExchangeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceExchangeAdapter {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build exchange HTTP client");
        BinanceExchangeAdapter {
            client,
            breaker: Mutex::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        }
    }

    fn parse_kline(raw: &serde_json::Value) -> Option<RawKline> {
        let arr = raw.as_array()?;
        if arr.len() < 11 {
            return None;
        }
        let dec = |i: usize| -> Option<Decimal> { arr[i].as_str()?.parse().ok() };
        Some(RawKline {
            open_time_ms: arr[0].as_i64()?,
            open: dec(1)?,
            high: dec(2)?,
            low: dec(3)?,
            close: dec(4)?,
            volume: dec(5)?,
            close_time_ms: arr[6].as_i64()?,
            quote_volume: dec(7)?,
            trade_count: arr[8].as_u64()?,
            taker_buy_volume: dec(9)?,
            taker_buy_quote_volume: dec(10)?,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceExchangeAdapter {
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<RawKline>> {
        if !self.breaker.lock().unwrap().can_attempt() {
            return Err(BacktestError::precondition("exchange circuit breaker is open"));
        }

        let url = format!("{BINANCE_API_BASE}/klines");
        let result = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(BacktestError::from);

        let resp = match result {
            Ok(r) => r,
            Err(e) => {
                self.breaker.lock().unwrap().record_failure();
                return Err(e);
            }
        };

        let body: serde_json::Value = match resp.json().await.map_err(BacktestError::from) {
            Ok(b) => b,
            Err(e) => {
                self.breaker.lock().unwrap().record_failure();
                return Err(e);
            }
        };
        let raw_array = body.as_array().ok_or_else(|| {
            BacktestError::validation("unexpected exchange response shape for klines")
        })?;

        let mut klines = Vec::with_capacity(raw_array.len());
        for entry in raw_array {
            match Self::parse_kline(entry) {
                Some(k) => klines.push(k),
                None => warn!(symbol, interval, "dropped malformed kline from exchange"),
            }
        }
        self.breaker.lock().unwrap().record_success();
        Ok(klines)
    }

    async fn get_earliest_valid_timestamp(&self, symbol: &str, interval: &str) -> Result<i64> {
        let klines = self
            .get_klines(symbol, interval, 0, Utc::now().timestamp_millis(), 1)
            .await?;
        Ok(klines.first().map(|k| k.open_time_ms).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn raw_kline_converts_to_valid_candle() {
        let raw = RawKline {
            open_time_ms: 0,
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            volume: dec!(10),
            close_time_ms: 59_999,
            quote_volume: dec!(1000),
            trade_count: 5,
            taker_buy_volume: dec!(4),
            taker_buy_quote_volume: dec!(400),
        };
        let candle = raw.into_candle().unwrap();
        assert_eq!(candle.close, dec!(105));
    }
}
