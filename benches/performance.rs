//! Performance benchmarks for the backtesting engine.
//!
//! Run with: `cargo bench`
//! View results: `open target/criterion/report/index.html`

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal_macros::dec;
use uuid::Uuid;

use perp_backtest_engine::position::Position;
use perp_backtest_engine::strategy::{MultiTimeframeContext, Signal, SignalType, Strategy};
use perp_backtest_engine::types::{Candle, Direction};
use perp_backtest_engine::{BacktestConfig, BacktestEngine};

fn generate_candles(count: usize) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(count);
    let mut price = 50_000.0_f64;
    let start_time = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();

    for i in 0..count {
        let change = if i % 2 == 0 { 12.5 } else { -9.0 };
        price += change;
        let open_time = start_time + Duration::minutes(i as i64);
        candles.push(Candle {
            open_time,
            close_time: open_time + Duration::seconds(59),
            open: rust_decimal::Decimal::try_from(price - change * 0.3).unwrap(),
            high: rust_decimal::Decimal::try_from(price + 5.0).unwrap(),
            low: rust_decimal::Decimal::try_from(price - 5.0).unwrap(),
            close: rust_decimal::Decimal::try_from(price).unwrap(),
            volume: dec!(100),
            quote_volume: dec!(1000000),
            trade_count: 50,
            taker_buy_volume: dec!(50),
            taker_buy_quote_volume: dec!(500000),
        });
    }
    candles
}

/// Flips direction every 20 bars, exercising the full fill/accounting path
/// on every cycle rather than sitting in a single open position.
struct FlipFlopStrategy;

impl Strategy for FlipFlopStrategy {
    fn on_bar(
        &mut self,
        _candle: &Candle,
        idx: usize,
        position: Option<&Position>,
        _ctx: Option<&MultiTimeframeContext>,
    ) -> Option<Signal> {
        if idx == 0 || idx % 20 != 0 {
            return None;
        }
        match position {
            None => Some(Signal::new(SignalType::OpenLong).with_quantity(dec!(0.1))),
            Some(p) if p.direction == Direction::Long => {
                Some(Signal::new(SignalType::FlipShort).with_quantity(dec!(0.1)))
            }
            Some(_) => Some(Signal::new(SignalType::FlipLong).with_quantity(dec!(0.1))),
        }
    }
}

fn benchmark_engine_run(c: &mut Criterion) {
    let candles = generate_candles(10_000);
    let config = BacktestConfig {
        symbol: "BTCUSDT".to_string(),
        leverage: 3,
        ..Default::default()
    };

    c.bench_function("engine_run_10k_candles", |b| {
        b.iter(|| {
            let engine = BacktestEngine::new(config.clone());
            let mut strategy = FlipFlopStrategy;
            let results = engine
                .run(Uuid::new_v4(), black_box(&candles), &mut strategy, |_, _| {}, || false)
                .unwrap();
            black_box(results.final_equity);
        })
    });
}

fn benchmark_metrics_on_equity_curve(c: &mut Criterion) {
    let candles = generate_candles(2_000);
    let config = BacktestConfig {
        symbol: "BTCUSDT".to_string(),
        leverage: 3,
        ..Default::default()
    };
    let engine = BacktestEngine::new(config);
    let mut strategy = FlipFlopStrategy;
    let results = engine
        .run(Uuid::new_v4(), &candles, &mut strategy, |_, _| {}, || false)
        .unwrap();

    c.bench_function("metrics_from_2k_candle_run", |b| {
        b.iter(|| {
            black_box(&results.metrics);
        })
    });
}

criterion_group!(benches, benchmark_engine_run, benchmark_metrics_on_equity_curve);
criterion_main!(benches);
