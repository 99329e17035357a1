//! Core data types shared across the backtesting engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, Result};

/// OHLCV candlestick data for a single interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub taker_buy_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
}

impl Candle {
    /// Checks the OHLC ordering invariant; called on ingest, not on every read.
    pub fn validate(&self) -> Result<()> {
        if self.open_time >= self.close_time {
            return Err(BacktestError::validation(
                "candle open_time must precede close_time",
            ));
        }
        let lower = self.open.min(self.close);
        let upper = self.open.max(self.close);
        if self.low > lower || self.high < upper {
            return Err(BacktestError::validation(format!(
                "candle OHLC ordering violated at {}: low={} high={} open={} close={}",
                self.open_time, self.low, self.high, self.open, self.close
            )));
        }
        if self.open <= Decimal::ZERO || self.close <= Decimal::ZERO {
            return Err(BacktestError::validation("candle prices must be positive"));
        }
        if self.volume < Decimal::ZERO {
            return Err(BacktestError::validation("candle volume cannot be negative"));
        }
        Ok(())
    }

    /// Unix-minute bucket this candle's open_time falls in.
    pub fn open_unix_minutes(&self) -> i64 {
        self.open_time.timestamp() / 60
    }
}

/// Trading pair symbol, e.g. "BTCUSDT".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into().replace('/', ""))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position / trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn sign(self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

/// Why a trade was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    TrailingStop,
    Liquidation,
    EndOfData,
    Manual,
}

impl ExitReason {
    /// Matches the event-type derivation rule of engine.rs: case-insensitive
    /// substring match on the reason's display text.
    pub fn event_type(self) -> crate::events::EventType {
        use crate::events::EventType;
        match self {
            ExitReason::StopLoss => EventType::SlHit,
            ExitReason::TakeProfit => EventType::TpHit,
            ExitReason::TrailingStop => EventType::TrailingStopHit,
            ExitReason::Liquidation => EventType::Liquidation,
            _ => EventType::TradeClosed,
        }
    }
}

/// Lifecycle status of a backtest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BacktestStatus {
    /// Valid per the PENDING -> RUNNING -> {COMPLETED, FAILED, CANCELLED} machine.
    pub fn can_transition_to(self, next: BacktestStatus) -> bool {
        use BacktestStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}
