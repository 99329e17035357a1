//! `BacktestRun` aggregate root: the persisted run record and its results.
//!
//! Grounded on `entities.py`'s `BacktestRun`/`BacktestResults` state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BacktestConfig;
use crate::error::{BacktestError, Result};
use crate::events::BacktestEvent;
use crate::metrics::{EquityCurvePoint, PerformanceMetrics};
use crate::position::Trade;
use crate::types::BacktestStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResults {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityCurvePoint>,
    pub events: Vec<BacktestEvent>,
    pub metrics: PerformanceMetrics,
    pub final_equity: Decimal,
}

impl BacktestResults {
    pub fn total_return(&self, initial_capital: Decimal) -> Decimal {
        if initial_capital == Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.final_equity - initial_capital) / initial_capital * Decimal::from(100)
    }

    pub fn total_trades(&self) -> usize {
        self.trades.len()
    }

    pub fn winning_trades(&self) -> usize {
        self.trades.iter().filter(|t| t.is_winner()).count()
    }

    pub fn losing_trades(&self) -> usize {
        self.trades.iter().filter(|t| !t.is_winner()).count()
    }

    pub fn win_rate(&self) -> Decimal {
        if self.trades.is_empty() {
            return Decimal::ZERO;
        }
        Decimal::from(self.winning_trades()) / Decimal::from(self.trades.len()) * Decimal::from(100)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRun {
    pub id: Uuid,
    pub user_id: Uuid,
    pub strategy_id: Uuid,
    pub exchange_connection_id: Option<Uuid>,
    pub symbol: String,
    pub timeframe: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub config: BacktestConfig,
    pub status: BacktestStatus,
    pub progress_percent: u8,
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_equity: Option<Decimal>,
    pub total_trades: Option<u32>,
    pub win_rate: Option<Decimal>,
    pub total_return: Option<Decimal>,
    pub profit_factor: Option<Decimal>,
    pub max_drawdown: Option<Decimal>,
    pub sharpe_ratio: Option<Decimal>,
    pub error_message: Option<String>,
    pub results: Option<BacktestResults>,
}

impl BacktestRun {
    pub fn new(user_id: Uuid, strategy_id: Uuid, config: BacktestConfig, start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> Self {
        BacktestRun {
            id: Uuid::new_v4(),
            user_id,
            strategy_id,
            exchange_connection_id: None,
            symbol: config.symbol.clone(),
            timeframe: config.timeframe.clone(),
            start_date,
            end_date,
            config,
            status: BacktestStatus::Pending,
            progress_percent: 0,
            status_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            final_equity: None,
            total_trades: None,
            win_rate: None,
            total_return: None,
            profit_factor: None,
            max_drawdown: None,
            sharpe_ratio: None,
            error_message: None,
            results: None,
        }
    }

    fn transition(&mut self, next: BacktestStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BacktestError::precondition(format!(
                "cannot transition backtest run from {:?} to {:?}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(BacktestStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, results: BacktestResults) -> Result<()> {
        self.transition(BacktestStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.progress_percent = 100;
        self.final_equity = Some(results.final_equity);
        self.total_trades = Some(results.total_trades() as u32);
        self.win_rate = Some(results.win_rate());
        self.total_return = Some(results.total_return(self.config.initial_capital));
        self.profit_factor = Some(results.metrics.profit_factor);
        self.max_drawdown = Some(results.metrics.max_drawdown);
        self.sharpe_ratio = Some(results.metrics.sharpe_ratio);
        self.results = Some(results);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(BacktestStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        let message: String = error.into();
        self.error_message = Some(message.chars().take(100).collect());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(BacktestStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn update_progress(&mut self, percent: u8, message: impl Into<String>) -> Result<()> {
        if self.status != BacktestStatus::Running {
            return Err(BacktestError::precondition(
                "progress can only be updated on a running backtest",
            ));
        }
        self.progress_percent = percent.min(100);
        self.status_message = Some(message.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BacktestConfig;

    fn run() -> BacktestRun {
        BacktestRun::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            BacktestConfig {
                symbol: "BTCUSDT".to_string(),
                ..Default::default()
            },
            Utc::now(),
            Utc::now(),
        )
    }

    #[test]
    fn pending_can_cancel_but_not_complete_directly() {
        let mut r = run();
        assert!(r.cancel().is_ok());
        let mut r2 = run();
        let results = BacktestResults {
            trades: vec![],
            equity_curve: vec![],
            events: vec![],
            metrics: Default::default(),
            final_equity: Decimal::ZERO,
        };
        assert!(r2.complete(results).is_err());
    }
}
