//! Market data: intervals, kline storage, and CSV loading
//!
//! The engine replays klines held in memory. Series are loaded from CSV
//! files or inserted directly, keyed by (pair, interval), and kept sorted by
//! open time so replay order is deterministic.

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{ExchangeError, Result};
use crate::types::{Kline, TradingPair};

// ============================================================================
// Intervals
// ============================================================================

/// Supported kline intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "3m")]
    Min3,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "6h")]
    Hour6,
    #[serde(rename = "8h")]
    Hour8,
    #[serde(rename = "12h")]
    Hour12,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "3d")]
    Day3,
    #[serde(rename = "1w")]
    Week1,
    #[serde(rename = "1M")]
    Month1,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Min1 => "1m",
            Interval::Min3 => "3m",
            Interval::Min5 => "5m",
            Interval::Min15 => "15m",
            Interval::Min30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour2 => "2h",
            Interval::Hour4 => "4h",
            Interval::Hour6 => "6h",
            Interval::Hour8 => "8h",
            Interval::Hour12 => "12h",
            Interval::Day1 => "1d",
            Interval::Day3 => "3d",
            Interval::Week1 => "1w",
            Interval::Month1 => "1M",
        }
    }

    /// Nominal bar span. A month is treated as 30 days.
    pub fn duration(self) -> Duration {
        match self {
            Interval::Min1 => Duration::minutes(1),
            Interval::Min3 => Duration::minutes(3),
            Interval::Min5 => Duration::minutes(5),
            Interval::Min15 => Duration::minutes(15),
            Interval::Min30 => Duration::minutes(30),
            Interval::Hour1 => Duration::hours(1),
            Interval::Hour2 => Duration::hours(2),
            Interval::Hour4 => Duration::hours(4),
            Interval::Hour6 => Duration::hours(6),
            Interval::Hour8 => Duration::hours(8),
            Interval::Hour12 => Duration::hours(12),
            Interval::Day1 => Duration::days(1),
            Interval::Day3 => Duration::days(3),
            Interval::Week1 => Duration::weeks(1),
            Interval::Month1 => Duration::days(30),
        }
    }

    pub fn all() -> &'static [Interval] {
        &[
            Interval::Min1,
            Interval::Min3,
            Interval::Min5,
            Interval::Min15,
            Interval::Min30,
            Interval::Hour1,
            Interval::Hour2,
            Interval::Hour4,
            Interval::Hour6,
            Interval::Hour8,
            Interval::Hour12,
            Interval::Day1,
            Interval::Day3,
            Interval::Week1,
            Interval::Month1,
        ]
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Interval::all()
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| format!("unknown interval: {s}"))
    }
}

// ============================================================================
// Kline storage
// ============================================================================

/// In-memory kline series per (pair, interval).
#[derive(Debug, Default)]
pub struct KlineStore {
    series: HashMap<(TradingPair, Interval), Vec<Kline>>,
}

impl KlineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a series, replacing any existing one for the key. The series
    /// is sorted by open time.
    pub fn insert(&mut self, pair: TradingPair, interval: Interval, mut klines: Vec<Kline>) {
        klines.sort_by_key(|k| k.open_time);
        self.series.insert((pair, interval), klines);
    }

    pub fn contains(&self, pair: &TradingPair, interval: Interval) -> bool {
        self.series.contains_key(&(pair.clone(), interval))
    }

    /// Klines whose open time falls within `[start, end]`. `None` bounds are
    /// unbounded.
    pub fn get_klines(
        &self,
        pair: &TradingPair,
        interval: Interval,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Kline>> {
        let series = self
            .series
            .get(&(pair.clone(), interval))
            .ok_or_else(|| ExchangeError::NoKlineData {
                pair: pair.clone(),
                interval,
            })?;

        Ok(series
            .iter()
            .filter(|k| start.map_or(true, |s| k.open_time >= s))
            .filter(|k| end.map_or(true, |e| k.open_time <= e))
            .cloned()
            .collect())
    }
}

// ============================================================================
// CSV loading
// ============================================================================

/// Load klines from a CSV file with columns:
/// `open_time, close_time, open, high, low, close, volume, quote_volume`.
///
/// Timestamps parse as RFC 3339 or as naive `%Y-%m-%d %H:%M:%S` assumed UTC.
/// Rows failing validation are rejected with their row number.
pub fn load_klines_csv(path: impl AsRef<Path>) -> AnyResult<Vec<Kline>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut klines = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let open_time = parse_datetime(record.get(0).context("Missing open_time column")?)?;
        let close_time = parse_datetime(record.get(1).context("Missing close_time column")?)?;
        let open = parse_decimal(&record, 2, "open")?;
        let high = parse_decimal(&record, 3, "high")?;
        let low = parse_decimal(&record, 4, "low")?;
        let close = parse_decimal(&record, 5, "close")?;
        let volume = parse_decimal(&record, 6, "volume")?;
        let quote_volume = parse_decimal(&record, 7, "quote_volume")?;

        let kline = Kline::new(
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume,
        )
        .context(format!("Invalid kline at row {}", row_idx + 1))?;

        klines.push(kline);
    }

    Ok(klines)
}

fn parse_datetime(s: &str) -> AnyResult<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .context(format!("Failed to parse datetime: {s}"))
}

fn parse_decimal(record: &csv::StringRecord, idx: usize, name: &str) -> AnyResult<Decimal> {
    record
        .get(idx)
        .context(format!("Missing {name} column"))?
        .parse::<Decimal>()
        .context(format!("Failed to parse {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn kline_at(open_secs: i64, price: Decimal) -> Kline {
        Kline {
            open_time: ts(open_secs),
            close_time: ts(open_secs + 299),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: dec!(1),
            quote_volume: price,
        }
    }

    #[test]
    fn interval_round_trips_through_str() {
        for interval in Interval::all() {
            assert_eq!(interval.as_str().parse::<Interval>().unwrap(), *interval);
        }
    }

    #[test]
    fn interval_serde_uses_short_names() {
        let json = serde_json::to_string(&Interval::Min5).unwrap();
        assert_eq!(json, "\"5m\"");
        let parsed: Interval = serde_json::from_str("\"1M\"").unwrap();
        assert_eq!(parsed, Interval::Month1);
    }

    #[test]
    fn store_filters_by_window() {
        let pair = TradingPair::new("BTC", "USDT");
        let mut store = KlineStore::new();
        store.insert(
            pair.clone(),
            Interval::Min5,
            vec![
                kline_at(0, dec!(100)),
                kline_at(300, dec!(101)),
                kline_at(600, dec!(102)),
            ],
        );

        let all = store.get_klines(&pair, Interval::Min5, None, None).unwrap();
        assert_eq!(all.len(), 3);

        let windowed = store
            .get_klines(&pair, Interval::Min5, Some(ts(300)), Some(ts(300)))
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].close, dec!(101));
    }

    #[test]
    fn store_rejects_unknown_series() {
        let store = KlineStore::new();
        let pair = TradingPair::new("ETH", "USDT");
        let err = store
            .get_klines(&pair, Interval::Hour1, None, None)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NoKlineData { .. }));
    }

    #[test]
    fn store_sorts_series_on_insert() {
        let pair = TradingPair::new("BTC", "USDT");
        let mut store = KlineStore::new();
        store.insert(
            pair.clone(),
            Interval::Min5,
            vec![kline_at(600, dec!(102)), kline_at(0, dec!(100))],
        );

        let all = store.get_klines(&pair, Interval::Min5, None, None).unwrap();
        assert_eq!(all[0].open_time, ts(0));
        assert_eq!(all[1].open_time, ts(600));
    }
}
