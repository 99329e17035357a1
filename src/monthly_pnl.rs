//! Monthly P&L breakdown and matrix rendering for a completed run's trades.

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeMap;

use crate::position::Trade;

#[derive(Debug, Clone, Default)]
pub struct MonthlyPnL {
    pub net_pnl: f64,
    pub trade_count: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
}

impl MonthlyPnL {
    fn new() -> Self {
        Self::default()
    }

    fn add_trade(&mut self, trade: &Trade) {
        let net_pnl = trade.net_pnl.to_f64().unwrap_or(0.0);
        self.net_pnl += net_pnl;
        self.trade_count += 1;

        if net_pnl > 0.0 {
            self.winning_trades += 1;
        } else {
            self.losing_trades += 1;
        }

        self.win_rate = if self.trade_count > 0 {
            (self.winning_trades as f64 / self.trade_count as f64) * 100.0
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            year: dt.year(),
            month: dt.month(),
        }
    }
}

/// Monthly P&L matrix organized by year and month.
pub struct MonthlyPnLMatrix {
    data: BTreeMap<YearMonth, MonthlyPnL>,
}

impl MonthlyPnLMatrix {
    pub fn from_trades(trades: &[Trade]) -> Self {
        let mut data = BTreeMap::new();
        for trade in trades {
            let ym = YearMonth::from_datetime(trade.exit_time);
            data.entry(ym).or_insert_with(MonthlyPnL::new).add_trade(trade);
        }
        Self { data }
    }

    fn years(&self) -> Vec<i32> {
        let mut years: Vec<i32> = self.data.keys().map(|ym| ym.year).collect();
        years.sort();
        years.dedup();
        years
    }

    fn get(&self, year: i32, month: u32) -> Option<&MonthlyPnL> {
        self.data.get(&YearMonth::new(year, month))
    }

    fn yearly_total(&self, year: i32) -> f64 {
        self.data
            .iter()
            .filter(|(ym, _)| ym.year == year)
            .map(|(_, pnl)| pnl.net_pnl)
            .sum()
    }

    pub fn total_pnl(&self) -> f64 {
        self.data.values().map(|pnl| pnl.net_pnl).sum()
    }

    pub fn render(&self) -> String {
        if self.data.is_empty() {
            return "No trades to display monthly P&L matrix.".to_string();
        }

        let years = self.years();
        let mut output = String::new();
        output.push_str(&format!("\n{}\n", "=".repeat(120)));
        output.push_str("MONTHLY P&L MATRIX\n");
        output.push_str(&format!("{}\n", "=".repeat(120)));
        output.push_str(&format!(
            "{:>6} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>12}\n",
            "Year", "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec", "Total"
        ));
        output.push_str(&format!("{}\n", "-".repeat(120)));

        for year in years {
            output.push_str(&format!("{:>6} │", year));
            for month in 1..=12 {
                let cell = match self.get(year, month) {
                    Some(pnl) => format!("{:>10.2}", pnl.net_pnl),
                    None => "          ".to_string(),
                };
                output.push_str(&format!(" {} │", cell));
            }
            output.push_str(&format!(" {:>12.2}\n", self.yearly_total(year)));
        }

        output.push_str(&format!("{}\n", "=".repeat(120)));
        output.push_str(&format!("Total P&L: {:.2}\n", self.total_pnl()));

        let profitable_months = self.data.values().filter(|pnl| pnl.net_pnl > 0.0).count();
        let total_months = self.data.len();
        let monthly_win_rate = if total_months > 0 {
            (profitable_months as f64 / total_months as f64) * 100.0
        } else {
            0.0
        };
        output.push_str(&format!(
            "Monthly Win Rate: {:.1}% ({} profitable months / {} total months)\n",
            monthly_win_rate, profitable_months, total_months
        ));
        output.push_str(&format!("{}\n", "=".repeat(120)));
        output
    }

    pub fn render_colored(&self) -> String {
        if self.data.is_empty() {
            return "No trades to display monthly P&L matrix.".to_string();
        }

        const GREEN: &str = "\x1b[32m";
        const RED: &str = "\x1b[31m";
        const RESET: &str = "\x1b[0m";
        const BOLD: &str = "\x1b[1m";

        let years = self.years();
        let mut output = String::new();
        output.push_str(&format!("\n{}{}{}\n", BOLD, "=".repeat(120), RESET));
        output.push_str(&format!("{}MONTHLY P&L MATRIX{}\n", BOLD, RESET));
        output.push_str(&format!("{}{}{}\n", BOLD, "=".repeat(120), RESET));
        output.push_str(&format!(
            "{}{:>6} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>10} │ {:>12}{}\n",
            BOLD, "Year", "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec", "Total", RESET
        ));
        output.push_str(&format!("{}\n", "-".repeat(120)));

        for year in years {
            output.push_str(&format!("{:>6} │", year));
            for month in 1..=12 {
                let cell = match self.get(year, month) {
                    Some(pnl) => {
                        let color = if pnl.net_pnl > 0.0 { GREEN } else { RED };
                        format!("{}{:>10.2}{}", color, pnl.net_pnl, RESET)
                    }
                    None => "          ".to_string(),
                };
                output.push_str(&format!(" {} │", cell));
            }
            let year_total = self.yearly_total(year);
            let color = if year_total > 0.0 { GREEN } else { RED };
            output.push_str(&format!(" {}{:>12.2}{}\n", color, year_total, RESET));
        }

        output.push_str(&format!("{}\n", "=".repeat(120)));
        let total = self.total_pnl();
        let color = if total > 0.0 { GREEN } else { RED };
        output.push_str(&format!("{}Total P&L: {}{:.2}{}{}\n", BOLD, color, total, RESET, RESET));

        let profitable_months = self.data.values().filter(|pnl| pnl.net_pnl > 0.0).count();
        let losing_months = self.data.values().filter(|pnl| pnl.net_pnl <= 0.0).count();
        let total_months = self.data.len();
        let monthly_win_rate = if total_months > 0 {
            (profitable_months as f64 / total_months as f64) * 100.0
        } else {
            0.0
        };
        output.push_str(&format!(
            "{}Monthly Win Rate: {:.1}% ({} profitable / {} losing / {} total months){}\n",
            BOLD, monthly_win_rate, profitable_months, losing_months, total_months, RESET
        ));
        output.push_str(&format!("{}\n", "=".repeat(120)));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, ExitReason, Symbol};
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn trade(year: i32, month: u32, day: u32, net_pnl: Decimal) -> Trade {
        let dt = Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap();
        Trade {
            id: Uuid::new_v4(),
            symbol: Symbol::new("BTCUSDT"),
            direction: Direction::Long,
            signal_time: dt,
            entry_time: dt,
            execution_delay_seconds: 0,
            entry_price: dec!(100),
            entry_quantity: dec!(1),
            entry_commission: Decimal::ZERO,
            entry_slippage: Decimal::ZERO,
            initial_entry_price: dec!(100),
            initial_entry_quantity: dec!(1),
            exit_time: dt,
            exit_price: dec!(100) + net_pnl,
            exit_quantity: dec!(1),
            exit_commission: Decimal::ZERO,
            exit_slippage: Decimal::ZERO,
            gross_pnl: net_pnl,
            net_pnl,
            pnl_percent: Decimal::ZERO,
            mae: Decimal::ZERO,
            mfe: Decimal::ZERO,
            maker_fee: Decimal::ZERO,
            taker_fee: Decimal::ZERO,
            funding_fee: Decimal::ZERO,
            entry_reason: "signal".to_string(),
            exit_reason: ExitReason::Signal,
            fill_policy_used: None,
            fill_conditions_met: None,
        }
    }

    #[test]
    fn aggregates_by_month() {
        let trades = vec![
            trade(2024, 1, 15, dec!(1000)),
            trade(2024, 1, 20, dec!(-500)),
            trade(2024, 2, 10, dec!(2000)),
        ];
        let matrix = MonthlyPnLMatrix::from_trades(&trades);

        let jan = matrix.get(2024, 1).unwrap();
        assert_eq!(jan.net_pnl, 500.0);
        assert_eq!(jan.trade_count, 2);
        assert_eq!(jan.winning_trades, 1);
        assert_eq!(jan.losing_trades, 1);

        assert_eq!(matrix.get(2024, 2).unwrap().net_pnl, 2000.0);
    }

    #[test]
    fn yearly_total_sums_every_month() {
        let trades = vec![
            trade(2024, 1, 15, dec!(1000)),
            trade(2024, 6, 20, dec!(2000)),
            trade(2024, 12, 10, dec!(-500)),
        ];
        let matrix = MonthlyPnLMatrix::from_trades(&trades);
        assert_eq!(matrix.yearly_total(2024), 2500.0);
    }

    #[test]
    fn empty_trades_render_placeholder() {
        let matrix = MonthlyPnLMatrix::from_trades(&[]);
        assert_eq!(matrix.total_pnl(), 0.0);
        assert!(matrix.render().contains("No trades"));
    }
}
