//! Position ledger: holds at most one open position and turns it into
//! [`Trade`] records on close.
//!
//! Grounded on `entities.py`'s `BacktestPosition`/`BacktestTrade`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MAINTENANCE_MARGIN_RATE;
use crate::error::{BacktestError, Result};
use crate::types::{Direction, ExitReason, Symbol};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub direction: Direction,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub initial_entry_price: Decimal,
    pub initial_quantity: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub trailing_stop_percent: Option<Decimal>,
    pub trailing_stop_price: Option<Decimal>,
    pub highest_since_entry: Decimal,
    pub lowest_since_entry: Decimal,
    pub isolated_margin: Decimal,
    pub leverage: u32,
    pub entry_time: DateTime<Utc>,
    pub entry_commission: Decimal,
    pub entry_slippage: Decimal,
    pub accumulated_funding: Decimal,
    pub max_drawdown_roe: Decimal,
    pub max_runup_roe: Decimal,
    pub signal_time: DateTime<Utc>,
    pub entry_reason: String,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.quantity <= Decimal::ZERO
    }

    pub fn notional(&self) -> Decimal {
        self.avg_entry_price * self.quantity
    }

    pub fn liquidation_price(&self) -> Decimal {
        if self.quantity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let margin_per_unit = self.isolated_margin / self.quantity;
        match self.direction {
            Direction::Long => self.avg_entry_price * (Decimal::ONE + MAINTENANCE_MARGIN_RATE) - margin_per_unit,
            Direction::Short => self.avg_entry_price * (Decimal::ONE - MAINTENANCE_MARGIN_RATE) + margin_per_unit,
        }
    }

    pub fn is_liquidated(&self, candle_low: Decimal, candle_high: Decimal) -> bool {
        if self.is_flat() {
            return false;
        }
        let p_liq = self.liquidation_price();
        match self.direction {
            Direction::Long => candle_low <= p_liq,
            Direction::Short => candle_high >= p_liq,
        }
    }

    pub fn update_unrealized(&mut self, price: Decimal) {
        self.current_price = price;
        let delta = (price - self.avg_entry_price) * self.direction.sign();
        self.unrealized_pnl = delta * self.quantity;

        if self.quantity > Decimal::ZERO {
            let roe = self.roe_at(price);
            if roe < self.max_drawdown_roe {
                self.max_drawdown_roe = roe;
            }
            if roe > self.max_runup_roe {
                self.max_runup_roe = roe;
            }
        }
    }

    fn roe_at(&self, price: Decimal) -> Decimal {
        let initial_margin = self.notional() / Decimal::from(self.leverage.max(1));
        if initial_margin == Decimal::ZERO {
            return Decimal::ZERO;
        }
        let pnl = (price - self.avg_entry_price) * self.direction.sign() * self.quantity;
        pnl / initial_margin * dec!(100)
    }

    /// Updates MAE/MFE against a candle's adverse/favorable extremes, then
    /// ratchets the trailing-stop price. Trailing only ever tightens toward
    /// the market, per `entities.py`'s `update_trailing_stop`.
    pub fn update_trailing(&mut self, candle_high: Decimal, candle_low: Decimal) {
        let (adverse, favorable) = match self.direction {
            Direction::Long => (candle_low, candle_high),
            Direction::Short => (candle_high, candle_low),
        };
        let adverse_roe = self.roe_at(adverse);
        let favorable_roe = self.roe_at(favorable);
        if adverse_roe < self.max_drawdown_roe {
            self.max_drawdown_roe = adverse_roe;
        }
        if favorable_roe > self.max_runup_roe {
            self.max_runup_roe = favorable_roe;
        }

        let Some(pct) = self.trailing_stop_percent else {
            return;
        };
        match self.direction {
            Direction::Long => {
                if candle_high > self.highest_since_entry {
                    self.highest_since_entry = candle_high;
                }
                let candidate = self.highest_since_entry * (Decimal::ONE - pct / dec!(100));
                self.trailing_stop_price = Some(match self.trailing_stop_price {
                    Some(existing) => existing.max(candidate),
                    None => candidate,
                });
            }
            Direction::Short => {
                if candle_low < self.lowest_since_entry || self.lowest_since_entry == Decimal::ZERO {
                    self.lowest_since_entry = candle_low;
                }
                let candidate = self.lowest_since_entry * (Decimal::ONE + pct / dec!(100));
                self.trailing_stop_price = Some(match self.trailing_stop_price {
                    Some(existing) => existing.min(candidate),
                    None => candidate,
                });
            }
        }
    }

    pub fn scale_in(&mut self, quantity: Decimal, fill_price: Decimal, commission: Decimal, slippage: Decimal) {
        let total_qty = self.quantity + quantity;
        self.avg_entry_price =
            (self.avg_entry_price * self.quantity + fill_price * quantity) / total_qty;
        self.quantity = total_qty;
        self.entry_commission += commission;
        self.entry_slippage += slippage;
        self.isolated_margin = self.notional() / Decimal::from(self.leverage.max(1));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub symbol: Symbol,
    pub direction: Direction,
    pub signal_time: DateTime<Utc>,
    pub entry_time: DateTime<Utc>,
    pub execution_delay_seconds: i64,
    pub entry_price: Decimal,
    pub entry_quantity: Decimal,
    pub entry_commission: Decimal,
    pub entry_slippage: Decimal,
    pub initial_entry_price: Decimal,
    pub initial_entry_quantity: Decimal,
    pub exit_time: DateTime<Utc>,
    pub exit_price: Decimal,
    pub exit_quantity: Decimal,
    pub exit_commission: Decimal,
    pub exit_slippage: Decimal,
    pub gross_pnl: Decimal,
    pub net_pnl: Decimal,
    pub pnl_percent: Decimal,
    pub mae: Decimal,
    pub mfe: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    pub funding_fee: Decimal,
    pub entry_reason: String,
    pub exit_reason: ExitReason,
    pub fill_policy_used: Option<&'static str>,
    pub fill_conditions_met: Option<&'static str>,
}

impl Trade {
    pub fn is_winner(&self) -> bool {
        self.net_pnl > Decimal::ZERO
    }

    pub fn duration_seconds(&self) -> i64 {
        (self.exit_time - self.entry_time).num_seconds()
    }

    /// Closes `quantity` of `position` at `exit_price`, realizing a
    /// proportional share of entry commission/slippage, and returns the
    /// resulting trade. Caller is responsible for decrementing/zeroing the
    /// position's own quantity.
    #[allow(clippy::too_many_arguments)]
    pub fn close(
        position: &Position,
        quantity: Decimal,
        exit_price: Decimal,
        exit_commission: Decimal,
        exit_slippage: Decimal,
        funding_fee: Decimal,
        timestamp: DateTime<Utc>,
        reason: ExitReason,
        leverage: u32,
        fill_policy_used: Option<&'static str>,
        fill_conditions_met: Option<&'static str>,
    ) -> Result<Trade> {
        if quantity <= Decimal::ZERO || quantity > position.quantity {
            return Err(BacktestError::precondition(
                "close quantity must be in (0, position.quantity]",
            ));
        }
        let proportion = quantity / position.quantity;
        let entry_commission = position.entry_commission * proportion;
        let entry_slippage = position.entry_slippage * proportion;

        let gross_pnl = (exit_price - position.avg_entry_price) * position.direction.sign() * quantity;
        let net_pnl = gross_pnl - entry_commission - exit_commission - entry_slippage - exit_slippage - funding_fee;

        let initial_margin = (position.avg_entry_price * quantity) / Decimal::from(leverage.max(1));
        let pnl_percent = if initial_margin == Decimal::ZERO {
            Decimal::ZERO
        } else {
            net_pnl / initial_margin * dec!(100)
        };

        let (maker_fee, taker_fee) = if matches!(reason, ExitReason::TakeProfit) {
            (exit_commission, Decimal::ZERO)
        } else {
            (Decimal::ZERO, exit_commission)
        };

        Ok(Trade {
            id: Uuid::new_v4(),
            symbol: position.symbol.clone(),
            direction: position.direction,
            signal_time: position.signal_time,
            entry_time: position.entry_time,
            execution_delay_seconds: (position.entry_time - position.signal_time).num_seconds(),
            entry_price: position.avg_entry_price,
            entry_quantity: quantity,
            entry_commission,
            entry_slippage,
            initial_entry_price: position.initial_entry_price,
            initial_entry_quantity: position.initial_quantity,
            exit_time: timestamp,
            exit_price,
            exit_quantity: quantity,
            exit_commission,
            exit_slippage,
            gross_pnl,
            net_pnl,
            pnl_percent,
            mae: position.max_drawdown_roe,
            mfe: position.max_runup_roe,
            maker_fee,
            taker_fee,
            funding_fee,
            entry_reason: position.entry_reason.clone(),
            exit_reason: reason,
            fill_policy_used,
            fill_conditions_met,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_position() -> Position {
        let t = Utc.timestamp_opt(0, 0).unwrap();
        Position {
            symbol: Symbol::new("BTCUSDT"),
            direction: Direction::Long,
            quantity: dec!(1),
            avg_entry_price: dec!(100),
            initial_entry_price: dec!(100),
            initial_quantity: dec!(1),
            current_price: dec!(100),
            unrealized_pnl: dec!(0),
            stop_loss: None,
            take_profit: None,
            trailing_stop_percent: None,
            trailing_stop_price: None,
            highest_since_entry: dec!(100),
            lowest_since_entry: dec!(100),
            isolated_margin: dec!(10),
            leverage: 10,
            entry_time: t,
            entry_commission: dec!(0.4),
            entry_slippage: dec!(0),
            accumulated_funding: dec!(0),
            max_drawdown_roe: dec!(0),
            max_runup_roe: dec!(0),
            signal_time: t,
            entry_reason: "signal".to_string(),
        }
    }

    #[test]
    fn trailing_stop_only_ratchets_up_for_long() {
        let mut pos = test_position();
        pos.trailing_stop_percent = Some(dec!(5));
        pos.update_trailing(dec!(110), dec!(105));
        let first = pos.trailing_stop_price.unwrap();
        pos.update_trailing(dec!(108), dec!(104));
        assert_eq!(pos.trailing_stop_price.unwrap(), first);
    }

    #[test]
    fn close_reconciles_pnl_equation() {
        let pos = test_position();
        let trade = Trade::close(
            &pos,
            dec!(1),
            dec!(105),
            dec!(0.42),
            dec!(0),
            dec!(0.1),
            Utc.timestamp_opt(60, 0).unwrap(),
            ExitReason::Signal,
            10,
            None,
            None,
        )
        .unwrap();
        let reconciled = trade.gross_pnl
            - trade.entry_commission
            - trade.exit_commission
            - trade.entry_slippage
            - trade.exit_slippage
            - trade.funding_fee;
        assert_eq!(reconciled, trade.net_pnl);
    }

    #[test]
    fn liquidation_price_long() {
        let pos = test_position();
        // entry=100, margin_per_unit=10, MMR=0.005 => 100*1.005 - 10 = 90.5
        assert_eq!(pos.liquidation_price(), dec!(90.5));
    }
}
