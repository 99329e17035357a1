//! Minimal fast/slow EMA crossover strategy, included as a worked example
//! of the [`Strategy`] trait for the `backtest` subcommand to run directly.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use ta::indicators::ExponentialMovingAverage;
use ta::Next;

use perp_backtest_engine::position::Position;
use perp_backtest_engine::strategy::{MultiTimeframeContext, Signal, SignalType, Strategy};
use perp_backtest_engine::types::{Candle, Direction};

pub struct EmaCrossoverStrategy {
    ema_fast: ExponentialMovingAverage,
    ema_slow: ExponentialMovingAverage,
    prev_fast_above: Option<bool>,
}

impl Default for EmaCrossoverStrategy {
    fn default() -> Self {
        EmaCrossoverStrategy {
            ema_fast: ExponentialMovingAverage::new(12).unwrap(),
            ema_slow: ExponentialMovingAverage::new(26).unwrap(),
            prev_fast_above: None,
        }
    }
}

impl Strategy for EmaCrossoverStrategy {
    fn on_bar(
        &mut self,
        candle: &Candle,
        _idx: usize,
        position: Option<&Position>,
        _ctx: Option<&MultiTimeframeContext>,
    ) -> Option<Signal> {
        let close = candle.close.to_f64()?;
        let fast = self.ema_fast.next(close);
        let slow = self.ema_slow.next(close);
        let fast_above = fast > slow;
        let crossed = self.prev_fast_above.replace(fast_above);

        match (crossed, fast_above, position) {
            (Some(false), true, None) => Some(
                Signal::new(SignalType::OpenLong).with_quantity(dec!(1)),
            ),
            (Some(true), false, Some(p)) if p.direction == Direction::Long => {
                Some(Signal::new(SignalType::ClosePosition))
            }
            _ => None,
        }
    }

    fn init(&mut self) {
        tracing::info!("EMA crossover demo strategy initialized");
    }
}
