/// In-memory bar series keyed by contract and request parameters
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{Result, TwsError};
use crate::types::{Bar, BarSize, Contract, SecurityType, TimeRange, WhatToShow};
use crate::utils::generate_fingerprint;

/// Identity of one cached series
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BarSeriesKey {
    pub symbol: String,
    pub exchange: String,
    pub currency: String,
    pub sec_type: SecurityType,
    pub bar_size: BarSize,
    pub what_to_show: WhatToShow,
}

impl BarSeriesKey {
    pub fn new(contract: &Contract, bar_size: BarSize, what_to_show: WhatToShow) -> Self {
        BarSeriesKey {
            symbol: contract.symbol.trim().to_uppercase(),
            exchange: contract.exchange.trim().to_uppercase(),
            currency: contract.currency.trim().to_uppercase(),
            sec_type: contract.sec_type,
            bar_size,
            what_to_show,
        }
    }

    /// `{SYMBOL}_{EXCHANGE}_{SECTYPE}_{CURRENCY}_{WHAT}`
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            sanitize(&self.symbol),
            sanitize(&self.exchange),
            self.sec_type.as_str(),
            sanitize(&self.currency),
            self.what_to_show.as_str()
        )
    }

    /// Path of the parquet file relative to the cache root
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.bar_size.dir_name()).join(format!("{}.parquet", self.file_stem()))
    }

    pub fn fingerprint(&self) -> String {
        generate_fingerprint(&[
            &self.symbol,
            &self.exchange,
            &self.currency,
            self.sec_type.as_str(),
            self.bar_size.as_str(),
            self.what_to_show.as_str(),
        ])
    }
}

impl fmt::Display for BarSeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.file_stem(), self.bar_size)
    }
}

// Symbols like "BRK B" or "BF/B" must not escape the bar size directory
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
        .collect()
}

/// Outcome of merging one fetch into a series
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
    pub discarded: usize,
}

/// Ordered bars plus the range of time they satisfy
#[derive(Debug, Clone)]
pub struct BarSeries {
    key: BarSeriesKey,
    bars: BTreeMap<DateTime<Utc>, Bar>,
    coverage: Option<TimeRange>,
}

impl BarSeries {
    pub fn new(key: BarSeriesKey) -> Self {
        BarSeries {
            key,
            bars: BTreeMap::new(),
            coverage: None,
        }
    }

    /// Rebuild a series from persisted parts; every bar must lie inside `coverage`
    pub fn from_parts(key: BarSeriesKey, bars: Vec<Bar>, coverage: Option<TimeRange>) -> Result<Self> {
        let mut series = BarSeries::new(key);

        match coverage {
            Some(range) => {
                if let Some(outside) = bars.iter().find(|b| !range.contains(b.timestamp)) {
                    return Err(TwsError::InvalidBarData(format!(
                        "bar at {} lies outside covered range {}",
                        outside.timestamp, range
                    )));
                }
            }
            None if !bars.is_empty() => {
                return Err(TwsError::InvalidBarData(
                    "bars present without a covered range".to_string(),
                ));
            }
            None => {}
        }

        for bar in bars {
            series.bars.insert(bar.timestamp, bar);
        }
        series.coverage = coverage;
        Ok(series)
    }

    pub fn key(&self) -> &BarSeriesKey {
        &self.key
    }

    pub fn coverage(&self) -> Option<TimeRange> {
        self.coverage
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// All bars in timestamp order
    pub fn bars(&self) -> impl Iterator<Item = &Bar> {
        self.bars.values()
    }

    /// Merge bars fetched for `fetched`.
    ///
    /// Bars outside `fetched` are dropped, bars at an existing timestamp replace
    /// the stored one, and coverage grows to the hull of old and new ranges.
    /// Callers plan fetches so that hull is never wider than the union.
    pub fn merge(&mut self, bars: Vec<Bar>, fetched: TimeRange) -> MergeStats {
        let mut stats = MergeStats::default();

        for bar in bars {
            if !fetched.contains(bar.timestamp) {
                stats.discarded += 1;
                continue;
            }
            match self.bars.insert(bar.timestamp, bar) {
                Some(_) => stats.replaced += 1,
                None => stats.inserted += 1,
            }
        }

        self.coverage = Some(match self.coverage {
            Some(existing) => existing.hull(&fetched),
            None => fetched,
        });

        debug!(
            "Merged into {}: {} new, {} replaced, {} discarded, coverage {:?}",
            self.key, stats.inserted, stats.replaced, stats.discarded, self.coverage
        );

        stats
    }

    /// Stored bars with timestamps inside `range`
    pub fn slice(&self, range: &TimeRange) -> Vec<Bar> {
        self.bars
            .range(range.start..=range.end)
            .map(|(_, bar)| bar.clone())
            .collect()
    }
}
