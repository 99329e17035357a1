//! Event-driven backtesting engine for leveraged perpetual-futures
//! strategies: candle replay, multi-timeframe resampling without
//! look-ahead, order-fill simulation, position and funding accounting,
//! and trade/metrics persistence.

pub mod candle_store;
pub mod common;
pub mod config;
pub mod data_service;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange_adapter;
pub mod fetch_job;
pub mod gap_detector;
pub mod metrics;
pub mod monthly_pnl;
pub mod position;
pub mod repository;
pub mod resampler;
pub mod run;
pub mod simulator;
pub mod strategy;
pub mod types;

pub use candle_store::{CandleStore, InMemoryCandleStore, SeriesMetadata, SqliteCandleStore};
pub use config::BacktestConfig;
pub use data_service::{FetchOptions, HistoricalDataService};
pub use engine::BacktestEngine;
pub use error::{BacktestError, Result};
pub use exchange_adapter::{BinanceExchangeAdapter, ExchangeAdapter, RawKline};
pub use fetch_job::FetchMissingCandlesJob;
pub use repository::{BacktestRepository, SqliteBacktestRepository};
pub use run::{BacktestResults, BacktestRun};
pub use strategy::{Signal, SignalType, Strategy};
pub use types::{Candle, Direction, ExitReason, Symbol};
