//! Market simulator: turns a proposed order plus a candle's OHLC into a fill
//! or a rejection.
//!
//! Grounded on `market_simulator.py`'s `simulate_long_entry` /
//! `simulate_short_entry` / `_calculate_slippage` / `_calculate_commission`.

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::{CommissionModel, LimitFillPolicy, MarketFillPolicy, SlippageModel};
use crate::types::{Candle, Direction};

#[derive(Debug, Clone)]
pub struct OrderFill {
    pub filled_price: Decimal,
    pub filled_quantity: Decimal,
    pub commission: Decimal,
    pub slippage: Decimal,
    pub fill_time: DateTime<Utc>,
    pub fill_conditions_met: Option<&'static str>,
}

impl OrderFill {
    pub fn rejected(fill_time: DateTime<Utc>) -> Self {
        OrderFill {
            filled_price: Decimal::ZERO,
            filled_quantity: Decimal::ZERO,
            commission: Decimal::ZERO,
            slippage: Decimal::ZERO,
            fill_time,
            fill_conditions_met: None,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.filled_quantity > Decimal::ZERO
    }
}

#[derive(Debug, Clone)]
pub struct MarketSimulator {
    pub slippage_model: SlippageModel,
    pub slippage_percent: Decimal,
    pub commission_model: CommissionModel,
    pub commission_rate: Decimal,
    pub use_bid_ask_spread: bool,
    pub spread_percent: Decimal,
    pub market_fill_policy: MarketFillPolicy,
    pub limit_fill_policy: LimitFillPolicy,
}

impl MarketSimulator {
    pub fn simulate_entry(
        &self,
        direction: Direction,
        quantity: Decimal,
        current_price: Decimal,
        candle: &Candle,
        timestamp: DateTime<Utc>,
        limit_price: Option<Decimal>,
        rng: &mut impl Rng,
    ) -> OrderFill {
        match limit_price {
            Some(limit) => self.simulate_limit(direction, quantity, candle, timestamp, limit),
            None => self.simulate_market(direction, quantity, current_price, candle, timestamp, rng),
        }
    }

    fn simulate_market(
        &self,
        direction: Direction,
        quantity: Decimal,
        current_price: Decimal,
        candle: &Candle,
        timestamp: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> OrderFill {
        let mut base = match self.market_fill_policy {
            MarketFillPolicy::Close => current_price,
            MarketFillPolicy::Low => candle.low,
            MarketFillPolicy::High => candle.high,
        };

        if self.use_bid_ask_spread {
            let shift = base * self.spread_percent / dec!(100);
            base = match direction {
                Direction::Long => base + shift,
                Direction::Short => base - shift,
            };
        }

        let slippage = self.calculate_slippage(base, rng);
        let filled_price = match direction {
            Direction::Long => base + slippage,
            Direction::Short => base - slippage,
        };
        let commission = self.calculate_commission(filled_price * quantity);

        OrderFill {
            filled_price,
            filled_quantity: quantity,
            commission,
            slippage,
            fill_time: timestamp,
            fill_conditions_met: Some("market"),
        }
    }

    fn simulate_limit(
        &self,
        direction: Direction,
        quantity: Decimal,
        candle: &Candle,
        timestamp: DateTime<Utc>,
        limit: Decimal,
    ) -> OrderFill {
        let (gapped_unfavorably, touched, favorable_open) = match direction {
            Direction::Long => (
                candle.open > limit && candle.low > limit,
                candle.low <= limit,
                candle.open <= limit,
            ),
            Direction::Short => (
                candle.open < limit && candle.high < limit,
                candle.high >= limit,
                candle.open >= limit,
            ),
        };

        if gapped_unfavorably {
            return OrderFill::rejected(timestamp);
        }
        if !touched {
            return OrderFill::rejected(timestamp);
        }

        let crossed = match self.limit_fill_policy {
            LimitFillPolicy::Touch => true,
            LimitFillPolicy::Cross | LimitFillPolicy::CrossVolume => favorable_open || touched,
        };
        if !crossed {
            return OrderFill::rejected(timestamp);
        }

        let filled_price = if favorable_open
            && matches!(
                self.limit_fill_policy,
                LimitFillPolicy::Cross | LimitFillPolicy::CrossVolume
            ) {
            candle.open
        } else {
            limit
        };

        let commission = self.calculate_commission(filled_price * quantity);
        let condition = if favorable_open {
            "gap"
        } else if matches!(self.limit_fill_policy, LimitFillPolicy::Touch) {
            "touch"
        } else {
            "cross"
        };

        OrderFill {
            filled_price,
            filled_quantity: quantity,
            commission,
            slippage: Decimal::ZERO,
            fill_time: timestamp,
            fill_conditions_met: Some(condition),
        }
    }

    fn calculate_slippage(&self, base_price: Decimal, rng: &mut impl Rng) -> Decimal {
        match self.slippage_model {
            SlippageModel::None => Decimal::ZERO,
            SlippageModel::Fixed => self.slippage_percent.abs(),
            SlippageModel::Percentage => (base_price * self.slippage_percent / dec!(100)).abs(),
            SlippageModel::VolumeBased => {
                let factor = Decimal::try_from(rng.gen_range(0.5..1.5_f64)).unwrap_or(dec!(1));
                (base_price * self.slippage_percent / dec!(100) * factor).abs()
            }
            SlippageModel::Random => {
                if self.slippage_percent <= Decimal::ZERO {
                    return Decimal::ZERO;
                }
                let upper = self.slippage_percent.to_string().parse::<f64>().unwrap_or(0.0);
                if upper <= 0.0 {
                    return Decimal::ZERO;
                }
                let factor = Decimal::try_from(rng.gen_range(0.0..upper)).unwrap_or(dec!(0));
                (base_price * factor / dec!(100)).abs()
            }
        }
    }

    pub fn calculate_commission(&self, notional: Decimal) -> Decimal {
        match self.commission_model {
            CommissionModel::None => Decimal::ZERO,
            CommissionModel::Fixed => self.commission_rate,
            CommissionModel::FixedRate => notional * self.commission_rate / dec!(100),
            CommissionModel::Tiered => {
                let multiplier = if notional < dec!(1000) {
                    dec!(1.5)
                } else if notional < dec!(10000) {
                    dec!(1)
                } else {
                    dec!(0.75)
                };
                notional * self.commission_rate * multiplier / dec!(100)
            }
        }
    }

    pub fn can_fill_order(&self, order_price: Decimal, current_price: Decimal, is_long: bool, is_limit: bool) -> bool {
        if !is_limit {
            return true;
        }
        if is_long {
            current_price <= order_price
        } else {
            current_price >= order_price
        }
    }

    pub fn estimate_fill_price(&self, current_price: Decimal, is_long: bool) -> Decimal {
        let slip = current_price * self.slippage_percent / dec!(100);
        if is_long {
            current_price + slip
        } else {
            current_price - slip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        let t = Utc.timestamp_opt(0, 0).unwrap();
        Candle {
            open_time: t,
            close_time: t + chrono::Duration::minutes(1),
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

    fn sim() -> MarketSimulator {
        MarketSimulator {
            slippage_model: SlippageModel::None,
            slippage_percent: dec!(0),
            commission_model: CommissionModel::None,
            commission_rate: dec!(0),
            use_bid_ask_spread: false,
            spread_percent: dec!(0),
            market_fill_policy: MarketFillPolicy::Close,
            limit_fill_policy: LimitFillPolicy::Cross,
        }
    }

    #[test]
    fn limit_long_gap_above_rejects() {
        let s = sim();
        let c = candle(dec!(110), dec!(115), dec!(111), dec!(112));
        let mut rng = rand::thread_rng();
        let fill = s.simulate_entry(
            Direction::Long,
            dec!(1),
            dec!(112),
            &c,
            c.open_time,
            Some(dec!(100)),
            &mut rng,
        );
        assert!(!fill.is_filled());
    }

    #[test]
    fn limit_long_favorable_open_fills_at_open() {
        let s = sim();
        let c = candle(dec!(95), dec!(100), dec!(94), dec!(98));
        let mut rng = rand::thread_rng();
        let fill = s.simulate_entry(
            Direction::Long,
            dec!(1),
            dec!(98),
            &c,
            c.open_time,
            Some(dec!(100)),
            &mut rng,
        );
        assert!(fill.is_filled());
        assert_eq!(fill.filled_price, dec!(95));
    }

    #[test]
    fn tiered_commission_by_notional() {
        let mut s = sim();
        s.commission_model = CommissionModel::Tiered;
        s.commission_rate = dec!(1);
        assert_eq!(s.calculate_commission(dec!(500)), dec!(7.5));
        assert_eq!(s.calculate_commission(dec!(5000)), dec!(50));
        assert_eq!(s.calculate_commission(dec!(20000)), dec!(150));
    }
}
