//! Detects missing candle ranges in a chronologically ordered series.
//!
//! Grounded on `gap_detector.py`'s `detect_gaps`.

use chrono::{DateTime, Duration, Utc};

use crate::resampler::timeframe_minutes;
use crate::types::Candle;

/// A half-open time range `[start, end)` with no candle data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub fn detect_gaps(
    candles: &[Candle],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    timeframe: &str,
) -> crate::error::Result<Vec<Gap>> {
    let period = Duration::minutes(timeframe_minutes(timeframe)?);
    let mut gaps = Vec::new();

    if candles.is_empty() {
        if start < end {
            gaps.push(Gap { start, end });
        }
        return Ok(gaps);
    }

    let mut expected = start;
    for candle in candles {
        if candle.open_time > expected {
            gaps.push(Gap {
                start: expected,
                end: candle.open_time,
            });
        }
        expected = candle.open_time + period;
    }
    if expected < end {
        gaps.push(Gap {
            start: expected,
            end,
        });
    }
    Ok(gaps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle_at(minute: i64) -> Candle {
        let open_time = Utc.timestamp_opt(minute * 60, 0).unwrap();
        Candle {
            open_time,
            close_time: open_time + Duration::minutes(1),
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(0),
            quote_volume: dec!(0),
            trade_count: 0,
            taker_buy_volume: dec!(0),
            taker_buy_quote_volume: dec!(0),
        }
    }

    #[test]
    fn finds_interior_and_trailing_gaps() {
        let candles = vec![candle_at(10), candle_at(11), candle_at(13)];
        let start = Utc.timestamp_opt(600, 0).unwrap();
        let end = Utc.timestamp_opt(900, 0).unwrap();
        let gaps = detect_gaps(&candles, start, end, "1m").unwrap();
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].start, Utc.timestamp_opt(720, 0).unwrap());
        assert_eq!(gaps[0].end, Utc.timestamp_opt(780, 0).unwrap());
        assert_eq!(gaps[1].start, Utc.timestamp_opt(840, 0).unwrap());
        assert_eq!(gaps[1].end, end);
    }

    #[test]
    fn empty_input_is_one_gap() {
        let start = Utc.timestamp_opt(0, 0).unwrap();
        let end = Utc.timestamp_opt(600, 0).unwrap();
        let gaps = detect_gaps(&[], start, end, "1m").unwrap();
        assert_eq!(gaps, vec![Gap { start, end }]);
    }
}
