//! Performance metrics computed from a run's closed trades and equity curve.
//!
//! Grounded on `metrics_calculator.py`'s `calculate_performance_metrics`.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::position::Trade;

const RISK_FREE_RATE_PERCENT: f64 = 2.0;
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityCurvePoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub cash: Decimal,
    pub positions_value: Decimal,
    pub drawdown: Decimal,
    pub drawdown_percent: Decimal,
    pub return_percent: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: Decimal,
    pub annual_return: Decimal,
    pub cagr: Decimal,
    pub sharpe_ratio: Decimal,
    pub sortino_ratio: Decimal,
    pub calmar_ratio: Decimal,
    pub max_drawdown: Decimal,
    pub max_drawdown_duration_days: i64,
    pub volatility: Decimal,
    pub downside_deviation: Decimal,
    pub win_rate: Decimal,
    pub profit_factor: Decimal,
    pub payoff_ratio: Decimal,
    pub expected_value: Decimal,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub break_even_trades: usize,
    pub average_trade_pnl: Decimal,
    pub average_winning_trade: Decimal,
    pub average_losing_trade: Decimal,
    pub largest_winning_trade: Decimal,
    pub largest_losing_trade: Decimal,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    pub average_exposure_percent: Decimal,
    pub max_simultaneous_positions: u32,
    pub risk_of_ruin: Decimal,
}

pub fn calculate_performance_metrics(
    trades: &[Trade],
    equity_curve: &[EquityCurvePoint],
    initial_capital: Decimal,
    duration_days: f64,
) -> PerformanceMetrics {
    if trades.is_empty() {
        return PerformanceMetrics::default();
    }

    let final_equity = equity_curve
        .last()
        .map(|p| p.equity)
        .unwrap_or(initial_capital);
    let total_return = if initial_capital == Decimal::ZERO {
        Decimal::ZERO
    } else {
        (final_equity - initial_capital) / initial_capital * dec!(100)
    };

    let years = (duration_days / 365.25).max(1.0 / 365.25);
    let total_return_f = total_return.to_f64().unwrap_or(0.0);
    let annual_return_f = total_return_f / years;
    let annual_return = Decimal::try_from(annual_return_f).unwrap_or(Decimal::ZERO);

    let cagr_f = if initial_capital > Decimal::ZERO {
        let ratio = (final_equity / initial_capital).to_f64().unwrap_or(1.0);
        if ratio > 0.0 {
            (ratio.powf(1.0 / years) - 1.0) * 100.0
        } else {
            0.0
        }
    } else {
        0.0
    };
    let cagr = Decimal::try_from(cagr_f).unwrap_or(Decimal::ZERO);

    let returns: Vec<f64> = equity_curve
        .iter()
        .map(|p| p.return_percent.to_f64().unwrap_or(0.0))
        .collect();
    let volatility_f = annualized_stdev(&returns) ;
    let downside_f = annualized_stdev(&returns.iter().copied().filter(|r| *r < 0.0).collect::<Vec<_>>());
    let volatility = Decimal::try_from(volatility_f).unwrap_or(Decimal::ZERO);
    let downside_deviation = Decimal::try_from(downside_f).unwrap_or(Decimal::ZERO);

    let (max_dd_f, max_dd_duration) = max_drawdown(equity_curve);
    let max_drawdown = Decimal::try_from(max_dd_f).unwrap_or(Decimal::ZERO);

    let sharpe_f = if volatility_f != 0.0 {
        (annual_return_f - RISK_FREE_RATE_PERCENT) / volatility_f
    } else {
        0.0
    };
    let sortino_f = if downside_f != 0.0 {
        (annual_return_f - RISK_FREE_RATE_PERCENT) / downside_f
    } else {
        0.0
    };
    let calmar_f = if max_dd_f != 0.0 {
        annual_return_f / max_dd_f.abs()
    } else {
        0.0
    };

    let winners: Vec<&Trade> = trades.iter().filter(|t| t.net_pnl > Decimal::ZERO).collect();
    let losers: Vec<&Trade> = trades.iter().filter(|t| t.net_pnl < Decimal::ZERO).collect();
    let break_even = trades.len() - winners.len() - losers.len();

    let win_rate = Decimal::from(winners.len()) / Decimal::from(trades.len()) * dec!(100);
    let gross_wins: Decimal = winners.iter().map(|t| t.gross_pnl).sum();
    let gross_losses: Decimal = losers.iter().map(|t| t.gross_pnl).sum();
    let profit_factor = if gross_losses == Decimal::ZERO {
        Decimal::ZERO
    } else {
        gross_wins / gross_losses.abs()
    };

    let avg_win = if !winners.is_empty() {
        winners.iter().map(|t| t.net_pnl).sum::<Decimal>() / Decimal::from(winners.len())
    } else {
        Decimal::ZERO
    };
    let avg_loss = if !losers.is_empty() {
        losers.iter().map(|t| t.net_pnl).sum::<Decimal>() / Decimal::from(losers.len())
    } else {
        Decimal::ZERO
    };
    let payoff_ratio = if avg_loss == Decimal::ZERO {
        Decimal::ZERO
    } else {
        avg_win / avg_loss.abs()
    };

    let p_win = Decimal::from(winners.len()) / Decimal::from(trades.len());
    let p_loss = Decimal::from(losers.len()) / Decimal::from(trades.len());
    let expected_value = p_win * avg_win - p_loss * avg_loss.abs();

    let (max_cons_wins, max_cons_losses) = max_consecutive(trades);

    let total_exposure_seconds: i64 = trades.iter().map(|t| t.duration_seconds()).sum();
    let average_exposure_percent = if duration_days > 0.0 {
        Decimal::try_from(total_exposure_seconds as f64 / (duration_days * 86400.0) * 100.0)
            .unwrap_or(Decimal::ZERO)
    } else {
        Decimal::ZERO
    };

    let risk_of_ruin = calculate_risk_of_ruin(win_rate, payoff_ratio);

    PerformanceMetrics {
        total_return,
        annual_return,
        cagr,
        sharpe_ratio: Decimal::try_from(sharpe_f).unwrap_or(Decimal::ZERO),
        sortino_ratio: Decimal::try_from(sortino_f).unwrap_or(Decimal::ZERO),
        calmar_ratio: Decimal::try_from(calmar_f).unwrap_or(Decimal::ZERO),
        max_drawdown,
        max_drawdown_duration_days: max_dd_duration,
        volatility,
        downside_deviation,
        win_rate,
        profit_factor,
        payoff_ratio,
        expected_value,
        total_trades: trades.len(),
        winning_trades: winners.len(),
        losing_trades: losers.len(),
        break_even_trades: break_even,
        average_trade_pnl: trades.iter().map(|t| t.net_pnl).sum::<Decimal>() / Decimal::from(trades.len()),
        average_winning_trade: avg_win,
        average_losing_trade: avg_loss,
        largest_winning_trade: winners.iter().map(|t| t.net_pnl).fold(Decimal::ZERO, Decimal::max),
        largest_losing_trade: losers.iter().map(|t| t.net_pnl).fold(Decimal::ZERO, Decimal::min),
        max_consecutive_wins: max_cons_wins,
        max_consecutive_losses: max_cons_losses,
        average_exposure_percent,
        max_simultaneous_positions: 1,
        risk_of_ruin,
    }
}

fn annualized_stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Returns `(max_drawdown_percent, duration_in_points_with_negative_drawdown)`.
fn max_drawdown(equity_curve: &[EquityCurvePoint]) -> (f64, i64) {
    let mut max_dd = 0.0_f64;
    let mut duration = 0_i64;
    for point in equity_curve {
        let dd = point.drawdown_percent.to_f64().unwrap_or(0.0);
        if dd < 0.0 {
            duration += 1;
        }
        if dd.abs() > max_dd {
            max_dd = dd.abs();
        }
    }
    (max_dd, duration)
}

fn max_consecutive(trades: &[Trade]) -> (u32, u32) {
    let mut max_wins = 0;
    let mut max_losses = 0;
    let mut cur_wins = 0;
    let mut cur_losses = 0;
    for t in trades {
        if t.net_pnl > Decimal::ZERO {
            cur_wins += 1;
            cur_losses = 0;
        } else if t.net_pnl < Decimal::ZERO {
            cur_losses += 1;
            cur_wins = 0;
        } else {
            cur_wins = 0;
            cur_losses = 0;
        }
        max_wins = max_wins.max(cur_wins);
        max_losses = max_losses.max(cur_losses);
    }
    (max_wins, max_losses)
}

fn calculate_risk_of_ruin(win_rate: Decimal, payoff_ratio: Decimal) -> Decimal {
    if win_rate == Decimal::ZERO || payoff_ratio <= Decimal::ZERO {
        return dec!(100);
    }
    if payoff_ratio <= Decimal::ONE {
        return dec!(50);
    }
    let win_prob = win_rate / dec!(100);
    let loss_prob = Decimal::ONE - win_prob;
    if win_prob == Decimal::ZERO {
        return dec!(100);
    }
    let ratio = (loss_prob / win_prob).to_f64().unwrap_or(1.0);
    let payoff = payoff_ratio.to_f64().unwrap_or(1.0);
    let ror = ratio.powf(payoff) * 100.0;
    Decimal::try_from(ror.min(100.0)).unwrap_or(dec!(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_trades_is_all_zero() {
        let m = calculate_performance_metrics(&[], &[], dec!(10000), 30.0);
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.win_rate, Decimal::ZERO);
    }
}
