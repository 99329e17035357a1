//! Append-only event log emitted by the engine during a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TradeOpened,
    TradeClosed,
    SlHit,
    TpHit,
    TrailingStopHit,
    Liquidation,
    ScaleIn,
    PartialClose,
    LevelsUpdated,
    MarginUpdated,
    HtfCandleClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestEvent {
    pub backtest_id: Uuid,
    pub trade_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub details: Value,
}

impl BacktestEvent {
    pub fn new(backtest_id: Uuid, timestamp: DateTime<Utc>, event_type: EventType, details: Value) -> Self {
        BacktestEvent {
            backtest_id,
            trade_id: None,
            timestamp,
            event_type,
            details,
        }
    }

    pub fn with_trade(mut self, trade_id: Uuid) -> Self {
        self.trade_id = Some(trade_id);
        self
    }
}
