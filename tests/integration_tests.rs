//! Integration tests for the backtesting engine.
//!
//! These tests verify that candle replay, signal dispatch, position
//! accounting, and metrics calculation work together end to end.

use chrono::{Duration, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use uuid::Uuid;

use perp_backtest_engine::position::Position;
use perp_backtest_engine::strategy::{MultiTimeframeContext, Signal, SignalType, Strategy};
use perp_backtest_engine::types::{Candle, Direction, ExitReason};
use perp_backtest_engine::{BacktestConfig, BacktestEngine};

/// Generates a 1-minute candle series following a simple deterministic walk.
fn generate_mock_candles(count: usize, base_price: f64, volatility: f64) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(count);
    let mut price = base_price;
    let start_time = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();

    for i in 0..count {
        let change = if i % 3 == 0 {
            volatility
        } else if i % 3 == 1 {
            -volatility * 0.5
        } else {
            volatility * 0.3
        };
        price += change;
        let high = price + volatility * 0.5;
        let low = price - volatility * 0.5;
        let open = price - change * 0.3;
        let close = price;
        let open_time = start_time + Duration::minutes(i as i64);

        candles.push(Candle {
            open_time,
            close_time: open_time + Duration::seconds(59),
            open: rust_decimal::Decimal::try_from(open).unwrap(),
            high: rust_decimal::Decimal::try_from(high).unwrap(),
            low: rust_decimal::Decimal::try_from(low).unwrap(),
            close: rust_decimal::Decimal::try_from(close).unwrap(),
            volume: dec!(100),
            quote_volume: dec!(1000000),
            trade_count: 50,
            taker_buy_volume: dec!(50),
            taker_buy_quote_volume: dec!(500000),
        });
    }
    candles
}

/// Opens long on the first bar and never exits; exercises the
/// end-of-data close path.
struct OpenOnceStrategy {
    opened: bool,
}

impl Strategy for OpenOnceStrategy {
    fn on_bar(
        &mut self,
        _candle: &Candle,
        _idx: usize,
        position: Option<&Position>,
        _ctx: Option<&MultiTimeframeContext>,
    ) -> Option<Signal> {
        if position.is_none() && !self.opened {
            self.opened = true;
            return Some(Signal::new(SignalType::OpenLong).with_quantity(dec!(0.1)));
        }
        None
    }
}

/// Flips direction every N bars, exercising add/reduce/flip dispatch and
/// closing a position other than at end-of-data.
struct FlipFlopStrategy {
    period: usize,
}

impl Strategy for FlipFlopStrategy {
    fn on_bar(
        &mut self,
        _candle: &Candle,
        idx: usize,
        position: Option<&Position>,
        _ctx: Option<&MultiTimeframeContext>,
    ) -> Option<Signal> {
        if idx % self.period != 0 || idx == 0 {
            return None;
        }
        match position {
            None => Some(Signal::new(SignalType::OpenLong).with_quantity(dec!(0.1))),
            Some(p) if p.direction == Direction::Long => Some(Signal::new(SignalType::FlipShort).with_quantity(dec!(0.1))),
            Some(_) => Some(Signal::new(SignalType::FlipLong).with_quantity(dec!(0.1))),
        }
    }
}

fn base_config(symbol: &str) -> BacktestConfig {
    BacktestConfig {
        symbol: symbol.to_string(),
        leverage: 3,
        ..Default::default()
    }
}

#[test]
fn engine_runs_full_candle_series_and_closes_at_end_of_data() {
    let candles = generate_mock_candles(200, 50_000.0, 25.0);
    let config = base_config("BTCUSDT");
    let engine = BacktestEngine::new(config.clone());
    let mut strategy = OpenOnceStrategy { opened: false };

    let results = engine
        .run(Uuid::new_v4(), &candles, &mut strategy, |_, _| {}, || false)
        .unwrap();

    assert_eq!(results.trades.len(), 1);
    assert_eq!(results.trades[0].exit_reason, ExitReason::EndOfData);
    assert!(results.final_equity > rust_decimal::Decimal::ZERO);
}

#[test]
fn engine_rejects_empty_candle_series() {
    let config = base_config("BTCUSDT");
    let engine = BacktestEngine::new(config);
    let mut strategy = OpenOnceStrategy { opened: false };
    let result = engine.run(Uuid::new_v4(), &[], &mut strategy, |_, _| {}, || false);
    assert!(result.is_err());
}

#[test]
fn flip_flop_strategy_produces_multiple_round_trip_trades() {
    let candles = generate_mock_candles(100, 50_000.0, 25.0);
    let config = base_config("BTCUSDT");
    let engine = BacktestEngine::new(config);
    let mut strategy = FlipFlopStrategy { period: 20 };

    let results = engine
        .run(Uuid::new_v4(), &candles, &mut strategy, |_, _| {}, || false)
        .unwrap();

    assert!(results.trades.len() >= 2, "expected multiple flips to close several trades");
    assert_eq!(results.metrics.total_trades, results.trades.len());
}

#[test]
fn cancellation_aborts_the_run_with_an_error() {
    let candles = generate_mock_candles(500, 50_000.0, 25.0);
    let config = base_config("BTCUSDT");
    let engine = BacktestEngine::new(config);
    let mut strategy = OpenOnceStrategy { opened: false };

    let result = engine.run(Uuid::new_v4(), &candles, &mut strategy, |_, _| {}, || true);
    assert!(result.is_err());
}

#[test]
fn equity_curve_points_are_monotonic_in_time() {
    let candles = generate_mock_candles(150, 50_000.0, 10.0);
    let config = base_config("ETHUSDT");
    let engine = BacktestEngine::new(config);
    let mut strategy = FlipFlopStrategy { period: 30 };

    let results = engine
        .run(Uuid::new_v4(), &candles, &mut strategy, |_, _| {}, || false)
        .unwrap();

    for pair in results.equity_curve.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[test]
fn decimal_roundtrips_through_f64_conversion_used_by_strategies() {
    let price = dec!(50123.456789);
    let as_f64 = price.to_f64().unwrap();
    approx::assert_relative_eq!(as_f64, 50123.456789, epsilon = 1e-6);
}
