/// Historical data cache: per-key series with lazy disk load and write-through
use chrono::Duration;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error};

use super::coverage::{plan_fetch, FetchPlan};
use super::parquet_store::ParquetStore;
use super::series::{BarSeries, BarSeriesKey, MergeStats};
use crate::error::TwsError;
use crate::types::{Bar, TimeRange};

struct SeriesSlot {
    series: BarSeries,
    loaded: bool,
}

pub struct HistoricalDataCache {
    store: ParquetStore,
    series: RwLock<HashMap<BarSeriesKey, Arc<Mutex<SeriesSlot>>>>,
}

/// Exclusive access to one series; same-key callers queue behind it
pub struct LockedSeries<'a> {
    guard: OwnedMutexGuard<SeriesSlot>,
    store: &'a ParquetStore,
}

impl HistoricalDataCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        HistoricalDataCache {
            store: ParquetStore::new(cache_dir),
            series: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, key: &BarSeriesKey) -> Arc<Mutex<SeriesSlot>> {
        if let Some(slot) = self.series.read().await.get(key) {
            return Arc::clone(slot);
        }

        let mut series = self.series.write().await;
        let slot = series.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(SeriesSlot {
                series: BarSeries::new(key.clone()),
                loaded: false,
            }))
        });
        Arc::clone(slot)
    }

    /// Lock a series, loading it from disk on first use
    pub async fn lock(&self, key: &BarSeriesKey) -> LockedSeries<'_> {
        let mut guard = self.slot(key).await.lock_owned().await;

        if !guard.loaded {
            if let Some(series) = self.store.load(key) {
                guard.series = series;
            }
            guard.loaded = true;
        }

        LockedSeries {
            guard,
            store: &self.store,
        }
    }

    pub async fn coverage(&self, key: &BarSeriesKey) -> Option<TimeRange> {
        self.lock(key).await.coverage()
    }

    pub async fn read(&self, key: &BarSeriesKey, requested: &TimeRange) -> Vec<Bar> {
        self.lock(key).await.read(requested)
    }

    pub async fn merge(&self, key: &BarSeriesKey, bars: Vec<Bar>, fetched: TimeRange) -> MergeStats {
        self.lock(key).await.merge(bars, fetched)
    }
}

impl LockedSeries<'_> {
    pub fn key(&self) -> &BarSeriesKey {
        self.guard.series.key()
    }

    pub fn coverage(&self) -> Option<TimeRange> {
        self.guard.series.coverage()
    }

    /// What to fetch for `requested`, bridged to the current coverage when the
    /// hole is at most `max_bridge`
    pub fn plan(&self, requested: &TimeRange, max_bridge: Duration) -> FetchPlan {
        plan_fetch(requested, self.coverage().as_ref(), max_bridge)
    }

    /// Merge and persist; a failed write is logged and memory keeps the merge
    pub fn merge(&mut self, bars: Vec<Bar>, fetched: TimeRange) -> MergeStats {
        let stats = self.guard.series.merge(bars, fetched);

        if let Err(e) = self.store.save(&self.guard.series) {
            let e = match e {
                TwsError::CacheIo(_) => e,
                other => TwsError::CacheIo(other.to_string()),
            };
            error!(
                "❌ Failed to persist {}: {} ({})",
                self.guard.series.key(),
                e,
                e.error_code()
            );
        } else {
            debug!("Persisted {} ({} bars)", self.guard.series.key(), self.guard.series.len());
        }

        stats
    }

    pub fn read(&self, requested: &TimeRange) -> Vec<Bar> {
        self.guard.series.slice(requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BarSize, Contract, WhatToShow};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn key() -> BarSeriesKey {
        BarSeriesKey::new(&Contract::stock("AAPL"), BarSize::Min5, WhatToShow::Trades)
    }

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 11, h, m, 0).unwrap()
    }

    fn bars(range: &TimeRange, close: f64) -> Vec<Bar> {
        let mut out = Vec::new();
        let mut ts = range.start;
        while ts <= range.end {
            out.push(Bar {
                timestamp: ts,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
                wap: close,
                count: 1,
            });
            ts += Duration::minutes(5);
        }
        out
    }

    #[tokio::test]
    async fn test_merge_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let range = TimeRange::new(t(10, 0), t(11, 0)).unwrap();
        {
            let cache = HistoricalDataCache::new(dir.path());
            assert_eq!(cache.coverage(&key()).await, None);
            cache.merge(&key(), bars(&range, 1.0), range).await;
        }

        let cache = HistoricalDataCache::new(dir.path());
        assert_eq!(cache.coverage(&key()).await, Some(range));
        let read = cache.read(&key(), &TimeRange::new(t(10, 30), t(10, 40)).unwrap()).await;
        assert_eq!(read.len(), 3);
    }

    #[tokio::test]
    async fn test_union_is_order_independent() {
        let a = TimeRange::new(t(10, 0), t(11, 0)).unwrap();
        let b = TimeRange::new(t(10, 30), t(12, 0)).unwrap();

        let dir1 = tempfile::tempdir().unwrap();
        let first = HistoricalDataCache::new(dir1.path());
        first.merge(&key(), bars(&a, 1.0), a).await;
        first.merge(&key(), bars(&b, 1.0), b).await;

        let dir2 = tempfile::tempdir().unwrap();
        let second = HistoricalDataCache::new(dir2.path());
        second.merge(&key(), bars(&b, 1.0), b).await;
        second.merge(&key(), bars(&a, 1.0), a).await;

        assert_eq!(first.coverage(&key()).await, Some(a.hull(&b)));
        assert_eq!(first.coverage(&key()).await, second.coverage(&key()).await);
        assert_eq!(
            first.read(&key(), &a.hull(&b)).await,
            second.read(&key(), &a.hull(&b)).await
        );
    }

    #[tokio::test]
    async fn test_plan_follows_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HistoricalDataCache::new(dir.path());
        let covered = TimeRange::new(t(10, 0), t(11, 0)).unwrap();
        cache.merge(&key(), bars(&covered, 1.0), covered).await;

        let locked = cache.lock(&key()).await;
        let later = TimeRange::new(t(12, 0), t(13, 0)).unwrap();
        let bridge = Duration::hours(2);
        assert_eq!(
            locked.plan(&later, bridge),
            FetchPlan::Extend(vec![TimeRange::new(t(11, 0), t(13, 0)).unwrap()])
        );
        assert!(locked.plan(&TimeRange::new(t(10, 15), t(10, 45)).unwrap(), bridge).is_covered());
        assert_eq!(locked.plan(&later, Duration::minutes(30)), FetchPlan::Detached(later));
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();

        let cache = HistoricalDataCache::new(&blocker);
        let range = TimeRange::new(t(10, 0), t(10, 30)).unwrap();
        let stats = cache.merge(&key(), bars(&range, 1.0), range).await;

        assert_eq!(stats.inserted, 7);
        assert_eq!(cache.coverage(&key()).await, Some(range));
        assert_eq!(cache.read(&key(), &range).await.len(), 7);
    }
}
