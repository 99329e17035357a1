//! Higher-timeframe resampling of 1-minute candles.
//!
//! Grounded on `timeframe_utils.py`'s `resample_candles_to_htf` /
//! `get_candles_in_htf_window` / `get_next_htf_window_candles`.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;

use crate::error::{BacktestError, Result};
use crate::types::Candle;

/// Interval -> minutes, spanning the supported timeframe list.
pub fn timeframe_minutes(tf: &str) -> Result<i64> {
    let minutes = match tf {
        "1m" => 1,
        "3m" => 3,
        "5m" => 5,
        "15m" => 15,
        "30m" => 30,
        "1h" => 60,
        "2h" => 120,
        "4h" => 240,
        "6h" => 360,
        "8h" => 480,
        "12h" => 720,
        "1d" => 1440,
        "3d" => 4320,
        "1w" => 10080,
        other => {
            return Err(BacktestError::validation(format!(
                "unsupported timeframe: {other}"
            )))
        }
    };
    Ok(minutes)
}

/// Window-start unix-minute for a 1-minute candle under a period of `period_minutes`.
pub fn window_start_unix_minutes(candle_unix_minutes: i64, period_minutes: i64) -> i64 {
    (candle_unix_minutes / period_minutes) * period_minutes
}

/// Aggregates a chronologically ordered slice of 1-minute candles into HTF
/// candles of `period_minutes`. Resampling to 1-minute is the identity.
pub fn resample(candles: &[Candle], period_minutes: i64) -> Result<Vec<Candle>> {
    if period_minutes <= 0 {
        return Err(BacktestError::validation("period_minutes must be positive"));
    }
    if period_minutes == 1 {
        return Ok(candles.to_vec());
    }

    let mut windows: BTreeMap<i64, Vec<&Candle>> = BTreeMap::new();
    for c in candles {
        let start = window_start_unix_minutes(c.open_unix_minutes(), period_minutes);
        windows.entry(start).or_default().push(c);
    }

    let mut out = Vec::with_capacity(windows.len());
    for (window_start, members) in windows {
        out.push(aggregate(window_start, period_minutes, &members));
    }
    Ok(out)
}

fn aggregate(window_start_unix_minutes: i64, period_minutes: i64, members: &[&Candle]) -> Candle {
    let open_time = Utc.timestamp_opt(window_start_unix_minutes * 60, 0).unwrap();
    let close_time = Utc
        .timestamp_opt((window_start_unix_minutes + period_minutes) * 60, 0)
        .unwrap();

    let high = members.iter().map(|c| c.high).fold(Decimal::MIN, Decimal::max);
    let low = members.iter().map(|c| c.low).fold(Decimal::MAX, Decimal::min);
    let volume = members.iter().map(|c| c.volume).sum();
    let quote_volume = members.iter().map(|c| c.quote_volume).sum();
    let taker_buy_volume = members.iter().map(|c| c.taker_buy_volume).sum();
    let taker_buy_quote_volume = members.iter().map(|c| c.taker_buy_quote_volume).sum();
    let trade_count = members.iter().map(|c| c.trade_count).sum();

    Candle {
        open_time,
        close_time,
        open: members.first().unwrap().open,
        high,
        low,
        close: members.last().unwrap().close,
        volume,
        quote_volume,
        trade_count,
        taker_buy_volume,
        taker_buy_quote_volume,
    }
}

/// 1-minute candles belonging to the HTF window starting at `htf_start_unix_minutes`.
pub fn candles_in_window<'a>(
    candles: &'a [Candle],
    htf_start_unix_minutes: i64,
    period_minutes: i64,
) -> Vec<&'a Candle> {
    let end = htf_start_unix_minutes + period_minutes;
    candles
        .iter()
        .filter(|c| {
            let m = c.open_unix_minutes();
            m >= htf_start_unix_minutes && m < end
        })
        .collect()
}

/// 1-minute candles of the window *following* `htf_start_unix_minutes`.
///
/// Used to avoid look-ahead: a signal produced by the bar that just closed
/// must execute against the next window's candles, never its own.
pub fn next_window_candles<'a>(
    candles: &'a [Candle],
    htf_start_unix_minutes: i64,
    period_minutes: i64,
) -> Vec<&'a Candle> {
    candles_in_window(candles, htf_start_unix_minutes + period_minutes, period_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn candle_at(minute: i64, close: Decimal) -> Candle {
        let open_time = Utc.timestamp_opt(minute * 60, 0).unwrap();
        Candle {
            open_time,
            close_time: open_time + Duration::minutes(1),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            quote_volume: dec!(1),
            trade_count: 1,
            taker_buy_volume: dec!(0),
            taker_buy_quote_volume: dec!(0),
        }
    }

    #[test]
    fn resample_to_1m_is_identity() {
        let candles = vec![candle_at(0, dec!(100)), candle_at(1, dec!(101))];
        let out = resample(&candles, 1).unwrap();
        assert_eq!(out, candles);
    }

    #[test]
    fn aggregates_htf_window() {
        let candles: Vec<Candle> = (0..60)
            .map(|m| candle_at(m, Decimal::from(100 + m)))
            .collect();
        let out = resample(&candles, 60).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open, dec!(100));
        assert_eq!(out[0].close, Decimal::from(159));
        assert_eq!(out[0].high, Decimal::from(159));
        assert_eq!(out[0].low, dec!(100));
    }

    #[test]
    fn htf_window_boundary_starts_new_window() {
        assert_eq!(window_start_unix_minutes(60, 60), 60);
        assert_eq!(window_start_unix_minutes(59, 60), 0);
    }
}
