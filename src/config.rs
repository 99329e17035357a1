//! Backtest configuration: the frozen parameter set a run executes under.
//!
//! Loaded from JSON via `serde_json` with environment variables overriding
//! exchange credentials after parse, matching the CLI's existing
//! `Config::from_file` convention.

use std::fs;
use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, Result};
use crate::types::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageModel {
    None,
    Fixed,
    Percentage,
    VolumeBased,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionModel {
    None,
    Fixed,
    FixedRate,
    Tiered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizing {
    FixedSize,
    FixedValue,
    PercentEquity,
    Kelly,
    VolatilityBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketFillPolicy {
    Close,
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitFillPolicy {
    Touch,
    Cross,
    CrossVolume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricePathAssumption {
    Neutral,
    Optimistic,
    Realistic,
}

/// Maintenance margin rate used for liquidation pricing (0.5%).
pub const MAINTENANCE_MARGIN_RATE: Decimal = dec!(0.005);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbol: String,
    pub timeframe: String,

    pub initial_capital: Decimal,
    pub allow_short_selling: bool,
    pub margin_requirement: Decimal,

    pub slippage_model: SlippageModel,
    pub slippage_percent: Decimal,
    pub commission_model: CommissionModel,
    pub commission_percent: Decimal,

    pub taker_fee_rate: Decimal,
    pub maker_fee_rate: Decimal,
    pub funding_rate_daily: Decimal,
    pub collect_funding_fee: bool,

    pub position_sizing: PositionSizing,
    pub position_size_value: Decimal,
    pub max_position_size: Option<Decimal>,

    pub leverage: u32,
    pub stop_loss_percent: Option<Decimal>,
    pub take_profit_percent: Option<Decimal>,
    pub trailing_stop_percent: Option<Decimal>,
    pub max_positions: u32,

    pub use_market_open_prices: bool,
    pub execution_delay_bars: u32,

    pub market_fill_policy: MarketFillPolicy,
    pub limit_fill_policy: LimitFillPolicy,
    pub price_path_assumption: PricePathAssumption,
    pub use_bid_ask_spread: bool,
    pub spread_percent: Decimal,

    pub signal_timeframe: String,
    #[serde(default)]
    pub condition_timeframes: Vec<String>,

    pub compound_returns: bool,
    pub reinvest_profits: bool,

    #[serde(skip)]
    pub exchange_api_key: Option<String>,
    #[serde(skip)]
    pub exchange_api_secret: Option<String>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            symbol: String::new(),
            timeframe: "1m".to_string(),
            initial_capital: dec!(100000),
            allow_short_selling: true,
            margin_requirement: dec!(1.0),
            slippage_model: SlippageModel::Fixed,
            slippage_percent: dec!(0.001),
            commission_model: CommissionModel::FixedRate,
            commission_percent: dec!(0.001),
            taker_fee_rate: dec!(0.0004),
            maker_fee_rate: dec!(0.0002),
            funding_rate_daily: dec!(0.0003),
            collect_funding_fee: true,
            position_sizing: PositionSizing::PercentEquity,
            position_size_value: dec!(0.1),
            max_position_size: None,
            leverage: 1,
            stop_loss_percent: None,
            take_profit_percent: None,
            trailing_stop_percent: None,
            max_positions: 1,
            use_market_open_prices: false,
            execution_delay_bars: 0,
            market_fill_policy: MarketFillPolicy::Close,
            limit_fill_policy: LimitFillPolicy::Cross,
            price_path_assumption: PricePathAssumption::Neutral,
            use_bid_ask_spread: false,
            spread_percent: dec!(0.05),
            signal_timeframe: "1m".to_string(),
            condition_timeframes: Vec::new(),
            compound_returns: true,
            reinvest_profits: true,
            exchange_api_key: None,
            exchange_api_secret: None,
        }
    }
}

impl BacktestConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .map_err(|e| BacktestError::validation(format!("failed to read config file: {e}")))?;
        let mut config: BacktestConfig = serde_json::from_str(&contents)
            .map_err(|e| BacktestError::validation(format!("failed to parse config JSON: {e}")))?;

        if let Ok(key) = std::env::var("EXCHANGE_API_KEY") {
            config.exchange_api_key = Some(key);
        }
        if let Ok(secret) = std::env::var("EXCHANGE_API_SECRET") {
            config.exchange_api_secret = Some(secret);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(BacktestError::validation("symbol must not be empty"));
        }
        if self.leverage == 0 || self.leverage > 125 {
            return Err(BacktestError::validation("leverage must be in 1..=125"));
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err(BacktestError::validation("initial_capital must be positive"));
        }
        if self.max_positions != 1 {
            return Err(BacktestError::validation(
                "only a single open position per run is supported",
            ));
        }
        Ok(())
    }

    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.symbol)
    }

    /// True when the engine must run the multi-timeframe loop.
    pub fn is_multi_timeframe(&self) -> bool {
        self.signal_timeframe != "1m" || !self.condition_timeframes.is_empty()
    }
}
