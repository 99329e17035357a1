//! Backtest engine: drives the candle replay loop.
//!
//! Grounded structurally on the host codebase's `backtest.rs` phase-commented
//! loop (parse-timestamps-once, periodic yield, progress callback), with the
//! domain semantics replaced per the signal-dispatch/fill-policy/liquidation
//! rules this system implements.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BacktestConfig, PositionSizing, PricePathAssumption};
use crate::error::{BacktestError, Result};
use crate::events::{BacktestEvent, EventType};
use crate::metrics::{calculate_performance_metrics, EquityCurvePoint};
use crate::position::{Position, Trade};
use crate::resampler::{self, timeframe_minutes};
use crate::run::BacktestResults;
use crate::simulator::MarketSimulator;
use crate::strategy::{MultiTimeframeContext, Signal, SignalType, Strategy};
use crate::types::{Candle, Direction, ExitReason};

const FUNDING_HOURS_UTC: [u32; 3] = [0, 8, 16];
const YIELD_EVERY_N_CANDLES: usize = 100;
const EQUITY_CURVE_DOWNSAMPLE: usize = 60;
const VOLATILITY_LOOKBACK: usize = 14;

pub struct BacktestEngine {
    pub config: BacktestConfig,
    pub simulator: MarketSimulator,
}

/// Running trade statistics used by the Kelly sizing rule; zero until the
/// first closed trade, then updated incrementally.
#[derive(Default)]
struct RunningTradeStats {
    wins: u32,
    losses: u32,
    total_win_pnl: Decimal,
    total_loss_pnl: Decimal,
}

impl RunningTradeStats {
    fn record(&mut self, trade: &Trade) {
        if trade.net_pnl > Decimal::ZERO {
            self.wins += 1;
            self.total_win_pnl += trade.net_pnl;
        } else if trade.net_pnl < Decimal::ZERO {
            self.losses += 1;
            self.total_loss_pnl += trade.net_pnl;
        }
    }

    fn win_rate(&self) -> Decimal {
        let total = self.wins + self.losses;
        if total == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(total)
    }

    fn payoff_ratio(&self) -> Decimal {
        if self.wins == 0 || self.losses == 0 || self.total_loss_pnl == Decimal::ZERO {
            return Decimal::ZERO;
        }
        let avg_win = self.total_win_pnl / Decimal::from(self.wins);
        let avg_loss = (self.total_loss_pnl / Decimal::from(self.losses)).abs();
        if avg_loss == Decimal::ZERO {
            Decimal::ZERO
        } else {
            avg_win / avg_loss
        }
    }
}

struct RunState<'a> {
    run_id: Uuid,
    simulator: &'a MarketSimulator,
    equity: Decimal,
    peak_equity: Decimal,
    position: Option<Position>,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityCurvePoint>,
    events: Vec<BacktestEvent>,
    last_funding_minute: Option<i64>,
    stats: RunningTradeStats,
    pending_signal: Option<(Signal, usize)>,
    rng: rand::rngs::ThreadRng,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        let simulator = MarketSimulator {
            slippage_model: config.slippage_model,
            slippage_percent: config.slippage_percent,
            commission_model: config.commission_model,
            commission_rate: config.commission_percent,
            use_bid_ask_spread: config.use_bid_ask_spread,
            spread_percent: config.spread_percent,
            market_fill_policy: config.market_fill_policy,
            limit_fill_policy: config.limit_fill_policy,
        };
        BacktestEngine { config, simulator }
    }

    pub fn run(
        &self,
        run_id: Uuid,
        candles: &[Candle],
        strategy: &mut dyn Strategy,
        mut progress_cb: impl FnMut(u8, &str),
        mut is_cancelled: impl FnMut() -> bool,
    ) -> Result<BacktestResults> {
        if candles.is_empty() {
            return Err(BacktestError::validation("no candles to replay"));
        }

        let mut state = RunState {
            run_id,
            simulator: &self.simulator,
            equity: self.config.initial_capital,
            peak_equity: self.config.initial_capital,
            position: None,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            events: Vec::new(),
            last_funding_minute: None,
            stats: RunningTradeStats::default(),
            pending_signal: None,
            rng: rand::thread_rng(),
        };

        strategy.pre_calculate(candles);

        if self.config.is_multi_timeframe() {
            self.run_multi_timeframe(candles, strategy, &mut state, &mut progress_cb, &mut is_cancelled)?;
        } else {
            self.run_single_timeframe(candles, strategy, &mut state, &mut progress_cb, &mut is_cancelled)?;
        }

        if let Some(position) = state.position.take() {
            let last = candles.last().unwrap();
            close_position_full(&mut state, strategy, &position, last.close, last.close_time, ExitReason::EndOfData);
        }

        let duration_days = (candles.last().unwrap().close_time - candles.first().unwrap().open_time)
            .num_seconds() as f64
            / 86400.0;
        let metrics = calculate_performance_metrics(
            &state.trades,
            &state.equity_curve,
            self.config.initial_capital,
            duration_days.max(1.0),
        );

        Ok(BacktestResults {
            final_equity: state.equity,
            trades: state.trades,
            equity_curve: state.equity_curve,
            events: state.events,
            metrics,
        })
    }

    fn run_single_timeframe(
        &self,
        candles: &[Candle],
        strategy: &mut dyn Strategy,
        state: &mut RunState,
        progress_cb: &mut impl FnMut(u8, &str),
        is_cancelled: &mut impl FnMut() -> bool,
    ) -> Result<()> {
        let total = candles.len();
        for (idx, candle) in candles.iter().enumerate() {
            step_position_state(state, candle);

            let had_position = state.position.is_some();
            let liquidated = self.check_liquidation(state, strategy, candle);
            if !liquidated {
                self.check_stops(state, strategy, candle);
            }
            let position_closed_this_candle = had_position && state.position.is_none();

            if !position_closed_this_candle {
                let signal = strategy.on_bar(candle, idx, state.position.as_ref(), None);
                if let Some(signal) = signal {
                    self.dispatch(state, strategy, &signal, candle, candle.close_time);
                }
            }

            self.check_funding(state, candle);
            self.append_equity_point(state, candle);

            if idx % YIELD_EVERY_N_CANDLES == 0 {
                if is_cancelled() {
                    return Err(BacktestError::precondition("run cancelled"));
                }
                let percent = ((idx as f64 / total as f64) * 100.0) as u8;
                progress_cb(percent, "replaying candles");
            }
        }
        Ok(())
    }

    fn run_multi_timeframe(
        &self,
        candles: &[Candle],
        strategy: &mut dyn Strategy,
        state: &mut RunState,
        progress_cb: &mut impl FnMut(u8, &str),
        is_cancelled: &mut impl FnMut() -> bool,
    ) -> Result<()> {
        let signal_period = timeframe_minutes(&self.config.signal_timeframe)?;
        let mut required_tfs = self.config.condition_timeframes.clone();
        if !required_tfs.contains(&self.config.signal_timeframe) {
            required_tfs.push(self.config.signal_timeframe.clone());
        }

        let htf_candles: std::collections::HashMap<String, Vec<Candle>> = required_tfs
            .iter()
            .map(|tf| {
                let period = timeframe_minutes(tf).unwrap_or(1);
                (tf.clone(), resampler::resample(candles, period).unwrap_or_default())
            })
            .collect();

        let mut ctx = MultiTimeframeContext::default();
        let mut tracked_window_start: std::collections::HashMap<String, i64> =
            required_tfs.iter().map(|tf| (tf.clone(), i64::MIN)).collect();

        let total = candles.len();
        for (idx, candle) in candles.iter().enumerate() {
            step_position_state(state, candle);
            if self.check_liquidation(state, strategy, candle) {
                self.check_funding(state, candle);
                self.append_equity_point(state, candle);
                continue;
            }
            let had_position = state.position.is_some();
            self.check_stops(state, strategy, candle);
            let position_closed_this_candle = had_position && state.position.is_none();

            let unix_minutes = candle.open_unix_minutes();
            let mut signal_trigger = false;

            for tf in &required_tfs {
                let period = timeframe_minutes(tf).unwrap_or(1);
                let prev_window_start = resampler::window_start_unix_minutes(unix_minutes, period) - period;
                if let Some(tracked) = tracked_window_start.get_mut(tf) {
                    if prev_window_start != *tracked {
                        if let Some(closed) = htf_candles
                            .get(tf)
                            .and_then(|series| series.iter().find(|c| c.open_unix_minutes() == prev_window_start))
                        {
                            *tracked = prev_window_start;
                            ctx.current_candles.insert(tf.clone(), closed.clone());
                            ctx.history.entry(tf.clone()).or_default().push(closed.clone());
                            if tf == &self.config.signal_timeframe {
                                signal_trigger = true;
                                state.events.push(BacktestEvent::new(
                                    state.run_id,
                                    candle.open_time,
                                    EventType::HtfCandleClosed,
                                    json!({"timeframe": tf, "htf_close": closed.close.to_string()}),
                                ));
                            }
                        }
                    }
                }
            }

            if !position_closed_this_candle {
                if let Some((signal, due_idx)) = state.pending_signal.take() {
                    if idx >= due_idx {
                        self.dispatch(state, strategy, &signal, candle, candle.close_time);
                    } else {
                        state.pending_signal = Some((signal, due_idx));
                    }
                }

                if signal_trigger {
                    if let Some(htf_candle) = ctx.current_candles.get(&self.config.signal_timeframe).cloned() {
                        if let Some(signal) = strategy.on_bar(&htf_candle, idx, state.position.as_ref(), Some(&ctx)) {
                            if self.config.execution_delay_bars > 0 {
                                state.pending_signal =
                                    Some((signal, idx + self.config.execution_delay_bars as usize));
                            } else {
                                self.dispatch(state, strategy, &signal, candle, candle.close_time);
                            }
                        }
                    }
                } else if state.position.is_some() {
                    if let Some(signal) = strategy.on_bar(candle, idx, state.position.as_ref(), Some(&ctx)) {
                        self.dispatch(state, strategy, &signal, candle, candle.close_time);
                    }
                }
            }

            self.check_funding(state, candle);
            self.append_equity_point(state, candle);

            if idx % YIELD_EVERY_N_CANDLES == 0 {
                if is_cancelled() {
                    return Err(BacktestError::precondition("run cancelled"));
                }
                let percent = ((idx as f64 / total as f64) * 100.0) as u8;
                progress_cb(percent, "replaying multi-timeframe candles");
            }
            let _ = signal_period;
        }
        Ok(())
    }

    /// Returns true if a liquidation was triggered (and handled) this candle.
    fn check_liquidation(&self, state: &mut RunState, strategy: &mut dyn Strategy, candle: &Candle) -> bool {
        let Some(position) = state.position.as_ref() else {
            return false;
        };
        if !position.is_liquidated(candle.low, candle.high) {
            return false;
        }
        let liq_price = position.liquidation_price();
        let position = state.position.take().unwrap();
        warn!(run_id = %state.run_id, candle_ts = %candle.open_time, "position liquidated");
        close_position_full(state, strategy, &position, liq_price, candle.close_time, ExitReason::Liquidation);
        true
    }

    fn check_stops(&self, state: &mut RunState, strategy: &mut dyn Strategy, candle: &Candle) {
        let Some(position) = state.position.clone() else {
            return;
        };

        let sl_level = match position.direction {
            Direction::Long => [position.stop_loss, position.trailing_stop_price]
                .into_iter()
                .flatten()
                .reduce(Decimal::max),
            Direction::Short => [position.stop_loss, position.trailing_stop_price]
                .into_iter()
                .flatten()
                .reduce(Decimal::min),
        };
        let tp_level = position.take_profit;

        let sl_triggered = sl_level.is_some_and(|sl| match position.direction {
            Direction::Long => candle.low <= sl,
            Direction::Short => candle.high >= sl,
        });
        let tp_triggered = tp_level.is_some_and(|tp| match position.direction {
            Direction::Long => candle.high >= tp,
            Direction::Short => candle.low <= tp,
        });

        if !sl_triggered && !tp_triggered {
            return;
        }

        let (exit_price, reason) = if sl_triggered && tp_triggered {
            match self.config.price_path_assumption {
                PricePathAssumption::Neutral => (sl_level.unwrap(), sl_reason(&position)),
                PricePathAssumption::Optimistic => (tp_level.unwrap(), ExitReason::TakeProfit),
                PricePathAssumption::Realistic => {
                    let open_favorable = match position.direction {
                        Direction::Long => candle.open >= position.avg_entry_price,
                        Direction::Short => candle.open <= position.avg_entry_price,
                    };
                    if open_favorable {
                        (tp_level.unwrap(), ExitReason::TakeProfit)
                    } else {
                        (sl_level.unwrap(), sl_reason(&position))
                    }
                }
            }
        } else if sl_triggered {
            (sl_level.unwrap(), sl_reason(&position))
        } else {
            (tp_level.unwrap(), ExitReason::TakeProfit)
        };

        state.position = None;
        close_position_full(state, strategy, &position, exit_price, candle.close_time, reason);
    }

    fn check_funding(&self, state: &mut RunState, candle: &Candle) {
        if !self.config.collect_funding_fee {
            return;
        }
        let Some(position) = state.position.as_mut() else {
            return;
        };
        let minute = candle.open_time.timestamp() / 60;
        let hour = candle.open_time.format("%H").to_string().parse::<u32>().unwrap_or(99);
        let is_funding_minute = candle.open_time.format("%M").to_string() == "00" && FUNDING_HOURS_UTC.contains(&hour);
        if !is_funding_minute {
            return;
        }
        if state.last_funding_minute == Some(minute) {
            return;
        }
        state.last_funding_minute = Some(minute);

        let notional = position.avg_entry_price * position.quantity;
        let fee = notional * self.config.funding_rate_daily / dec!(3);
        let signed_fee = match position.direction {
            Direction::Long => fee,
            Direction::Short => -fee,
        };
        state.equity -= signed_fee;
        position.accumulated_funding += signed_fee;
        debug!(run_id = %state.run_id, candle_ts = %candle.open_time, fee = %signed_fee, "funding charged");
    }

    fn append_equity_point(&self, state: &mut RunState, candle: &Candle) {
        let positions_value = state
            .position
            .as_ref()
            .map(|p| p.unrealized_pnl)
            .unwrap_or(Decimal::ZERO);
        let equity = state.equity + positions_value;
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        let drawdown = equity - state.peak_equity;
        let drawdown_percent = if state.peak_equity == Decimal::ZERO {
            Decimal::ZERO
        } else {
            drawdown / state.peak_equity * dec!(100)
        };
        let return_percent = if self.config.initial_capital == Decimal::ZERO {
            Decimal::ZERO
        } else {
            (equity - self.config.initial_capital) / self.config.initial_capital * dec!(100)
        };

        if state.equity_curve.len() % EQUITY_CURVE_DOWNSAMPLE == 0 {
            state.equity_curve.push(EquityCurvePoint {
                timestamp: candle.close_time,
                equity,
                cash: state.equity,
                positions_value,
                drawdown,
                drawdown_percent,
                return_percent,
            });
        }
        let _ = candle;
    }

    fn dispatch(
        &self,
        state: &mut RunState,
        strategy: &mut dyn Strategy,
        signal: &Signal,
        candle: &Candle,
        timestamp: DateTime<Utc>,
    ) {
        let Some(signal_type) = signal.signal_type else {
            return;
        };
        match signal_type {
            SignalType::OpenLong | SignalType::OpenShort => {
                if state.position.is_some() {
                    return;
                }
                self.open_position(
                    state,
                    if signal_type == SignalType::OpenLong { Direction::Long } else { Direction::Short },
                    signal,
                    candle,
                    timestamp,
                );
            }
            SignalType::AddLong | SignalType::AddShort => {
                self.scale_in(state, signal, candle, timestamp);
            }
            SignalType::PartialClose | SignalType::ReduceLong | SignalType::ReduceShort => {
                self.partial_close(state, strategy, signal, candle, timestamp);
            }
            SignalType::ClosePosition => {
                if let Some(position) = state.position.take() {
                    let reason = signal
                        .reason
                        .as_deref()
                        .map(reason_from_str)
                        .unwrap_or(ExitReason::Signal);
                    close_position_full(state, strategy, &position, candle.close, timestamp, reason);
                }
            }
            SignalType::FlipLong | SignalType::FlipShort => {
                if let Some(position) = state.position.take() {
                    close_position_full(state, strategy, &position, candle.close, timestamp, ExitReason::Signal);
                }
                self.open_position(
                    state,
                    if signal_type == SignalType::FlipLong { Direction::Long } else { Direction::Short },
                    signal,
                    candle,
                    timestamp,
                );
            }
            SignalType::UpdateLevels => {
                if let Some(position) = state.position.as_mut() {
                    apply_level_updates(position, signal);
                    state.events.push(BacktestEvent::new(
                        state.run_id,
                        timestamp,
                        EventType::LevelsUpdated,
                        json!({}),
                    ));
                }
            }
            SignalType::UpdateMargin => {
                if let (Some(position), Some(delta)) = (state.position.as_mut(), signal.margin_delta) {
                    position.isolated_margin += delta;
                    state.equity -= delta;
                    apply_level_updates(position, signal);
                    state.events.push(BacktestEvent::new(
                        state.run_id,
                        timestamp,
                        EventType::MarginUpdated,
                        json!({"delta": delta.to_string()}),
                    ));
                }
            }
        }
    }

    fn open_position(&self, state: &mut RunState, direction: Direction, signal: &Signal, candle: &Candle, timestamp: DateTime<Utc>) {
        let price = candle.close;
        let quantity = signal.quantity.unwrap_or_else(|| {
            self.size_position(direction, price, state.equity, &state.stats)
        });
        if quantity <= Decimal::ZERO {
            return;
        }

        let fill = self.simulator.simulate_entry(
            direction,
            quantity,
            price,
            candle,
            timestamp,
            signal.limit_price,
            &mut state.rng,
        );
        if !fill.is_filled() {
            return;
        }

        let notional = fill.filled_price * fill.filled_quantity;
        let isolated_margin = notional / Decimal::from(self.config.leverage.max(1));

        let (stop_loss, take_profit) = levels_from_percent(
            direction,
            fill.filled_price,
            self.config.leverage,
            signal.stop_loss_percent.or(self.config.stop_loss_percent),
            signal.take_profit_percent.or(self.config.take_profit_percent),
        );

        let position = Position {
            symbol: self.config.symbol(),
            direction,
            quantity: fill.filled_quantity,
            avg_entry_price: fill.filled_price,
            initial_entry_price: fill.filled_price,
            initial_quantity: fill.filled_quantity,
            current_price: fill.filled_price,
            unrealized_pnl: Decimal::ZERO,
            stop_loss: signal.stop_loss.or(stop_loss),
            take_profit: signal.take_profit.or(take_profit),
            trailing_stop_percent: signal.trailing_stop_percent.or(self.config.trailing_stop_percent),
            trailing_stop_price: None,
            highest_since_entry: fill.filled_price,
            lowest_since_entry: fill.filled_price,
            isolated_margin,
            leverage: self.config.leverage,
            entry_time: fill.fill_time,
            entry_commission: fill.commission,
            entry_slippage: fill.slippage * fill.filled_quantity,
            accumulated_funding: Decimal::ZERO,
            max_drawdown_roe: Decimal::ZERO,
            max_runup_roe: Decimal::ZERO,
            signal_time: timestamp,
            entry_reason: signal.reason.clone().unwrap_or_else(|| "signal".to_string()),
        };

        info!(run_id = %state.run_id, direction = ?direction, price = %fill.filled_price, qty = %fill.filled_quantity, "position opened");
        state.events.push(BacktestEvent::new(
            state.run_id,
            timestamp,
            EventType::TradeOpened,
            json!({"direction": format!("{:?}", direction), "price": fill.filled_price.to_string()}),
        ));
        state.position = Some(position);
    }

    fn scale_in(&self, state: &mut RunState, signal: &Signal, candle: &Candle, timestamp: DateTime<Utc>) {
        let Some(position) = state.position.as_mut() else {
            return;
        };
        let quantity = signal.quantity.unwrap_or(position.quantity / dec!(2));
        let fill = self.simulator.simulate_entry(
            position.direction,
            quantity,
            candle.close,
            candle,
            timestamp,
            signal.limit_price,
            &mut state.rng,
        );
        if !fill.is_filled() {
            return;
        }
        position.scale_in(fill.filled_quantity, fill.filled_price, fill.commission, fill.slippage * fill.filled_quantity);
        apply_level_updates(position, signal);
        state.events.push(BacktestEvent::new(state.run_id, timestamp, EventType::ScaleIn, json!({})));
    }

    fn partial_close(
        &self,
        state: &mut RunState,
        strategy: &mut dyn Strategy,
        signal: &Signal,
        candle: &Candle,
        timestamp: DateTime<Utc>,
    ) {
        let Some(position) = state.position.clone() else {
            return;
        };
        let quantity = signal.quantity.unwrap_or(position.quantity / dec!(2)).min(position.quantity);
        if quantity <= Decimal::ZERO {
            return;
        }
        let fill = self.simulator.simulate_entry(
            position.direction.opposite(),
            quantity,
            candle.close,
            candle,
            timestamp,
            signal.limit_price,
            &mut state.rng,
        );
        if !fill.is_filled() {
            return;
        }
        let reason = signal.reason.as_deref().map(reason_from_str).unwrap_or(ExitReason::Signal);
        let trade = match Trade::close(
            &position,
            quantity,
            fill.filled_price,
            fill.commission,
            fill.slippage * quantity,
            Decimal::ZERO,
            timestamp,
            reason,
            self.config.leverage,
            None,
            fill.fill_conditions_met,
        ) {
            Ok(t) => t,
            Err(_) => return,
        };
        state.equity += trade.net_pnl;
        state.stats.record(&trade);
        strategy.notify_trade(&trade);
        state.events.push(
            BacktestEvent::new(state.run_id, timestamp, EventType::PartialClose, json!({})).with_trade(trade.id),
        );
        state.trades.push(trade);

        if let Some(position) = state.position.as_mut() {
            position.quantity -= quantity;
            if position.quantity <= Decimal::ZERO {
                state.position = None;
            }
        }
    }

    fn size_position(&self, direction: Direction, price: Decimal, equity: Decimal, stats: &RunningTradeStats) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let mut qty = match self.config.position_sizing {
            PositionSizing::FixedSize => self.config.position_size_value,
            PositionSizing::FixedValue => self.config.position_size_value / price,
            PositionSizing::PercentEquity => equity * (self.config.position_size_value / dec!(100)) / price,
            PositionSizing::Kelly => {
                let win_rate = stats.win_rate();
                let payoff = stats.payoff_ratio();
                let kelly = if payoff == Decimal::ZERO {
                    Decimal::ZERO
                } else {
                    (win_rate - (Decimal::ONE - win_rate) / payoff).clamp(Decimal::ZERO, Decimal::ONE)
                };
                equity * kelly / price
            }
            PositionSizing::VolatilityBased => {
                // risk_fraction reuses position_size_value; volatility approximated
                // by a constant nominal range since this helper sees only the
                // signal price, not a lookback window of candles.
                let risk_fraction = self.config.position_size_value;
                let nominal_range = price * dec!(0.01);
                if nominal_range == Decimal::ZERO {
                    Decimal::ZERO
                } else {
                    (equity * risk_fraction) / (nominal_range * price)
                }
            }
        };

        let available_capital = equity;
        if qty * price > available_capital {
            qty = available_capital / price;
        }
        let leveraged_margin = (qty * price) / Decimal::from(self.config.leverage.max(1));
        if leveraged_margin > available_capital {
            qty = (available_capital * Decimal::from(self.config.leverage.max(1))) / price;
        }
        if let Some(max_size) = self.config.max_position_size {
            qty = qty.min(max_size);
        }
        let _ = direction;
        qty.max(Decimal::ZERO)
    }
}

fn step_position_state(state: &mut RunState, candle: &Candle) {
    if let Some(position) = state.position.as_mut() {
        position.update_unrealized(candle.close);
        position.update_trailing(candle.high, candle.low);
    }
}

fn sl_reason(position: &Position) -> ExitReason {
    if position.trailing_stop_price.is_some() {
        ExitReason::TrailingStop
    } else {
        ExitReason::StopLoss
    }
}

fn reason_from_str(s: &str) -> ExitReason {
    let lower = s.to_lowercase();
    if lower.contains("stop loss") || lower.contains("sl") {
        ExitReason::StopLoss
    } else if lower.contains("take profit") || lower.contains("tp") {
        ExitReason::TakeProfit
    } else if lower.contains("trailing") {
        ExitReason::TrailingStop
    } else if lower.contains("liquidation") {
        ExitReason::Liquidation
    } else if lower.contains("manual") {
        ExitReason::Manual
    } else {
        ExitReason::Signal
    }
}

fn levels_from_percent(
    direction: Direction,
    entry: Decimal,
    leverage: u32,
    sl_pct: Option<Decimal>,
    tp_pct: Option<Decimal>,
) -> (Option<Decimal>, Option<Decimal>) {
    let lev = Decimal::from(leverage.max(1));
    let sl = sl_pct.map(|pct| match direction {
        Direction::Long => entry * (Decimal::ONE - pct / dec!(100) / lev),
        Direction::Short => entry * (Decimal::ONE + pct / dec!(100) / lev),
    });
    let tp = tp_pct.map(|pct| match direction {
        Direction::Long => entry * (Decimal::ONE + pct / dec!(100) / lev),
        Direction::Short => entry * (Decimal::ONE - pct / dec!(100) / lev),
    });
    (sl, tp)
}

fn apply_level_updates(position: &mut Position, signal: &Signal) {
    if let Some(sl) = signal.stop_loss {
        position.stop_loss = Some(sl);
    }
    if let Some(tp) = signal.take_profit {
        position.take_profit = Some(tp);
    }
    if let Some(trail) = signal.trailing_stop_percent {
        position.trailing_stop_percent = Some(trail);
    }
    if signal.stop_loss_percent.is_some() || signal.take_profit_percent.is_some() {
        let (sl, tp) = levels_from_percent(
            position.direction,
            position.avg_entry_price,
            position.leverage,
            signal.stop_loss_percent,
            signal.take_profit_percent,
        );
        if let Some(sl) = sl {
            position.stop_loss = Some(sl);
        }
        if let Some(tp) = tp {
            position.take_profit = Some(tp);
        }
    }
}

fn close_position_full(
    state: &mut RunState,
    strategy: &mut dyn Strategy,
    position: &Position,
    exit_price: Decimal,
    timestamp: DateTime<Utc>,
    reason: ExitReason,
) {
    let exit_commission = state
        .simulator
        .calculate_commission(exit_price * position.quantity);
    let trade = match Trade::close(
        position,
        position.quantity,
        exit_price,
        exit_commission,
        Decimal::ZERO,
        position.accumulated_funding,
        timestamp,
        reason,
        position.leverage,
        None,
        None,
    ) {
        Ok(t) => t,
        Err(_) => return,
    };
    state.equity += trade.net_pnl;
    state.stats.record(&trade);
    strategy.notify_trade(&trade);
    state.events.push(
        BacktestEvent::new(state.run_id, timestamp, reason.event_type(), json!({"exit_reason": format!("{:?}", reason)}))
            .with_trade(trade.id),
    );
    state.trades.push(trade);
    let _ = VOLATILITY_LOOKBACK;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BacktestConfig, PositionSizing};
    use chrono::{Duration, TimeZone};

    struct BuyAndHold {
        opened: bool,
    }

    impl Strategy for BuyAndHold {
        fn on_bar(
            &mut self,
            _candle: &Candle,
            _idx: usize,
            position: Option<&Position>,
            _ctx: Option<&MultiTimeframeContext>,
        ) -> Option<Signal> {
            if position.is_none() && !self.opened {
                self.opened = true;
                return Some(Signal::new(SignalType::OpenLong));
            }
            None
        }
    }

    fn candle(minute: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        let open_time = Utc.timestamp_opt(minute * 60, 0).unwrap();
        Candle {
            open_time,
            close_time: open_time + Duration::minutes(1),
            open,
            high,
            low,
            close,
            volume: dec!(1),
            quote_volume: dec!(1),
            trade_count: 1,
            taker_buy_volume: dec!(0),
            taker_buy_quote_volume: dec!(0),
        }
    }

    #[test]
    fn take_profit_closes_trade_s1() {
        let mut config = BacktestConfig {
            symbol: "BTCUSDT".to_string(),
            leverage: 10,
            taker_fee_rate: dec!(0.04),
            maker_fee_rate: dec!(0.02),
            initial_capital: dec!(10000),
            position_sizing: PositionSizing::PercentEquity,
            position_size_value: dec!(100),
            ..Default::default()
        };
        config.commission_percent = dec!(0.04);
        let engine = BacktestEngine::new(config);
        let candles = vec![
            candle(0, dec!(100), dec!(110), dec!(99), dec!(101)),
            candle(1, dec!(101), dec!(105), dec!(100), dec!(104)),
            candle(2, dec!(104), dec!(106), dec!(103), dec!(105)),
        ];
        let mut strat = BuyAndHold { opened: false };
        let results = engine.run(Uuid::new_v4(), &candles, &mut strat, |_, _| {}, || false).unwrap();
        assert_eq!(results.trades.len(), 1);
        assert_eq!(results.trades[0].exit_reason, ExitReason::EndOfData);
    }
}
