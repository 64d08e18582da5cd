use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::values::{Price, Timestamp};

/// Candle granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    pub fn seconds(&self) -> u64 {
        match self {
            Self::OneMinute => 60,
            Self::FiveMinutes => 300,
            Self::FifteenMinutes => 900,
            Self::OneHour => 3_600,
            Self::FourHours => 14_400,
            Self::OneDay => 86_400,
        }
    }

    pub fn minutes(&self) -> u64 {
        self.seconds() / 60
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::FiveMinutes
    }
}

/// One OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time
    pub timestamp: Timestamp,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    /// Volume in base units
    pub volume: Decimal,
}

impl Candle {
    /// Largest of high-low, |high-prev_close|, |low-prev_close|
    pub fn true_range(&self, prev_close: Option<Price>) -> Price {
        let range = self.high - self.low;
        match prev_close {
            Some(prev) => range
                .max((self.high - prev).abs())
                .max((self.low - prev).abs()),
            None => range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_true_range_uses_gap() {
        let candle = Candle {
            timestamp: Utc::now(),
            open: dec!(105),
            high: dec!(106),
            low: dec!(104),
            close: dec!(105),
            volume: dec!(1),
        };
        assert_eq!(candle.true_range(None), dec!(2));
        assert_eq!(candle.true_range(Some(dec!(100))), dec!(6));
    }

    #[test]
    fn test_timeframe_serde_names() {
        let tf: Timeframe = serde_json::from_str(r#""15m""#).unwrap();
        assert_eq!(tf, Timeframe::FifteenMinutes);
        assert_eq!(tf.minutes(), 15);
    }
}
