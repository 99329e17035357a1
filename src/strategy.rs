//! Strategy interface consumed by the engine.
//!
//! A `Strategy` is pure with respect to engine state: it only reads the
//! current position and candle data, returning an optional [`Signal`] for
//! the engine to dispatch. Modeled as a trait rather than the source's
//! dynamic string-keyed callable, per the design notes on strategy dispatch.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    OpenLong,
    OpenShort,
    AddLong,
    AddShort,
    PartialClose,
    ReduceLong,
    ReduceShort,
    ClosePosition,
    FlipLong,
    FlipShort,
    UpdateLevels,
    UpdateMargin,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: Option<SignalType>,
    pub quantity: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub stop_loss_percent: Option<Decimal>,
    pub take_profit_percent: Option<Decimal>,
    pub trailing_stop_percent: Option<Decimal>,
    pub margin_delta: Option<Decimal>,
    pub reason: Option<String>,
    pub metadata: Option<Value>,
}

impl Signal {
    pub fn new(signal_type: SignalType) -> Self {
        Signal {
            signal_type: Some(signal_type),
            ..Default::default()
        }
    }

    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn with_levels(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }
}

/// Snapshot of closed candles per timeframe, passed to strategies running in
/// the multi-timeframe loop. `current_candles` holds the most recently
/// closed candle per timeframe; `history` the full append-only series.
#[derive(Debug, Clone, Default)]
pub struct MultiTimeframeContext {
    pub current_candles: HashMap<String, Candle>,
    pub history: HashMap<String, Vec<Candle>>,
}

/// Implemented by user strategies. `Send + Sync` so runs can execute inside
/// the cross-run worker pool.
pub trait Strategy: Send + Sync {
    /// Optional vectorized precompute hook, called once before the replay loop.
    fn pre_calculate(&mut self, _candles: &[Candle]) {}

    /// Called once per trigger bar (every 1-minute candle in single-timeframe
    /// mode; only on signal-timeframe closes, plus every bar while a position
    /// is open, in multi-timeframe mode).
    fn on_bar(
        &mut self,
        candle: &Candle,
        idx: usize,
        position: Option<&crate::position::Position>,
        ctx: Option<&MultiTimeframeContext>,
    ) -> Option<Signal>;

    /// Lifecycle hook: informed when an order actually fills.
    fn notify_order(&mut self, _fill_price: Decimal, _quantity: Decimal) {}

    /// Lifecycle hook: informed when a trade closes.
    fn notify_trade(&mut self, _trade: &crate::position::Trade) {}

    fn init(&mut self) {}
}
