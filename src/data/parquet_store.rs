/// Parquet persistence for bar series
///
/// Layout: `{cache_dir}/{bar_size_dir}/{SYMBOL}_{EXCHANGE}_{SECTYPE}_{CURRENCY}_{WHAT}.parquet`
/// with a `.meta.json` sidecar next to it. Files are rewritten whole on every
/// save through a temp file and rename. Files that fail validation on load are
/// renamed to `*.quarantined` and the series starts empty.
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::data::series::{BarSeries, BarSeriesKey};
use crate::error::{Result, TwsError};
use crate::types::{Bar, TimeRange};

const COLUMNS: [&str; 8] = [
    "timestamp", "open", "high", "low", "close", "volume", "wap", "bar_count",
];

/// Metadata sidecar for one series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub key: BarSeriesKey,
    pub fingerprint: String,
    pub covered_start: DateTime<Utc>,
    pub covered_end: DateTime<Utc>,
    pub bar_count: usize,
    pub written_at: DateTime<Utc>,
}

pub struct ParquetStore {
    cache_dir: PathBuf,
}

impl ParquetStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        ParquetStore {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn data_path(&self, key: &BarSeriesKey) -> PathBuf {
        self.cache_dir.join(key.relative_path())
    }

    pub fn meta_path(&self, key: &BarSeriesKey) -> PathBuf {
        self.data_path(key).with_extension("meta.json")
    }

    /// Read the sidecar without touching the parquet file
    pub fn read_meta(&self, key: &BarSeriesKey) -> Option<CacheMeta> {
        let content = fs::read_to_string(self.meta_path(key)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Persist the full series, replacing what is on disk
    pub fn save(&self, series: &BarSeries) -> Result<()> {
        let coverage = match series.coverage() {
            Some(range) => range,
            None => return Ok(()),
        };
        let key = series.key();
        let path = self.data_path(key);

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| TwsError::CacheIo(format!("failed to create {}: {}", dir.display(), e)))?;
        }

        // Data file first: a crash before the sidecar lands leaves the old,
        // narrower coverage or one derived from the bars, never a wider one
        let mut df = bars_to_dataframe(series.bars())?;
        let tmp_path = path.with_extension("parquet.tmp");
        write_parquet(&mut df, &tmp_path)?;
        atomic_rename(&tmp_path, &path)?;

        let meta = CacheMeta {
            key: key.clone(),
            fingerprint: key.fingerprint(),
            covered_start: coverage.start,
            covered_end: coverage.end,
            bar_count: series.len(),
            written_at: Utc::now(),
        };
        let meta_path = self.meta_path(key);
        let meta_tmp = meta_path.with_extension("json.tmp");
        let meta_json = serde_json::to_string_pretty(&meta)?;
        fs::write(&meta_tmp, meta_json)
            .map_err(|e| TwsError::CacheIo(format!("meta write {}: {}", meta_tmp.display(), e)))?;
        atomic_rename(&meta_tmp, &meta_path)?;

        debug!("Saved {} bars for {} to {}", series.len(), key, path.display());
        Ok(())
    }

    /// Load a persisted series; `None` when nothing usable is on disk
    pub fn load(&self, key: &BarSeriesKey) -> Option<BarSeries> {
        let path = self.data_path(key);
        if !path.exists() {
            debug!("No cache file for {}", key);
            return None;
        }

        match self.load_validated(key, &path) {
            Ok(series) => {
                info!(
                    "📂 Loaded {} cached bars for {} covering {:?}",
                    series.len(),
                    key,
                    series.coverage()
                );
                Some(series)
            }
            Err(e) => {
                warn!("⚠️  Quarantining cache file {}: {}", path.display(), e);
                self.quarantine(key);
                None
            }
        }
    }

    fn load_validated(&self, key: &BarSeriesKey, path: &Path) -> Result<BarSeries> {
        let bars = read_parquet(path)?;

        let coverage = match self.read_meta(key) {
            Some(meta) => {
                if meta.fingerprint != key.fingerprint() {
                    return Err(TwsError::InvalidBarData(format!(
                        "fingerprint mismatch for {}",
                        key
                    )));
                }
                if meta.bar_count == bars.len() {
                    Some(TimeRange::new(meta.covered_start, meta.covered_end)?)
                } else {
                    // Save interrupted between the data file and the sidecar
                    warn!(
                        "Cache sidecar for {} records {} bars, file holds {}; deriving coverage from bars",
                        key,
                        meta.bar_count,
                        bars.len()
                    );
                    coverage_of(&bars)?
                }
            }
            None => {
                warn!("Cache sidecar missing for {}, deriving coverage from bars", key);
                coverage_of(&bars)?
            }
        };

        BarSeries::from_parts(key.clone(), bars, coverage)
    }

    fn quarantine(&self, key: &BarSeriesKey) {
        for path in [self.data_path(key), self.meta_path(key)] {
            if !path.exists() {
                continue;
            }
            let mut quarantined = path.clone().into_os_string();
            quarantined.push(".quarantined");
            if let Err(e) = fs::rename(&path, &quarantined) {
                warn!("Failed to quarantine {}: {}", path.display(), e);
            }
        }
    }
}

/// Narrowest range holding every bar; the bars themselves are the only evidence
fn coverage_of(bars: &[Bar]) -> Result<Option<TimeRange>> {
    match (bars.first(), bars.last()) {
        (Some(first), Some(last)) => Ok(Some(TimeRange::new(first.timestamp, last.timestamp)?)),
        _ => Ok(None),
    }
}

fn atomic_rename(tmp: &Path, dest: &Path) -> Result<()> {
    fs::rename(tmp, dest).map_err(|e| {
        let _ = fs::remove_file(tmp);
        TwsError::CacheIo(format!("atomic rename to {} failed: {}", dest.display(), e))
    })
}

fn polars_err(context: &str) -> impl Fn(PolarsError) -> TwsError + '_ {
    move |e| TwsError::CacheIo(format!("{}: {}", context, e))
}

fn bars_to_dataframe<'a>(bars: impl Iterator<Item = &'a Bar>) -> Result<DataFrame> {
    let (lower, _) = bars.size_hint();
    let mut timestamps: Vec<i64> = Vec::with_capacity(lower);
    let mut opens: Vec<f64> = Vec::with_capacity(lower);
    let mut highs: Vec<f64> = Vec::with_capacity(lower);
    let mut lows: Vec<f64> = Vec::with_capacity(lower);
    let mut closes: Vec<f64> = Vec::with_capacity(lower);
    let mut volumes: Vec<f64> = Vec::with_capacity(lower);
    let mut waps: Vec<f64> = Vec::with_capacity(lower);
    let mut counts: Vec<i64> = Vec::with_capacity(lower);

    for bar in bars {
        timestamps.push(bar.timestamp.timestamp_millis());
        opens.push(bar.open);
        highs.push(bar.high);
        lows.push(bar.low);
        closes.push(bar.close);
        volumes.push(bar.volume);
        waps.push(bar.wap);
        counts.push(bar.count);
    }

    DataFrame::new(vec![
        Column::new("timestamp".into(), timestamps)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .map_err(polars_err("timestamp cast"))?,
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
        Column::new("wap".into(), waps),
        Column::new("bar_count".into(), counts),
    ])
    .map_err(polars_err("dataframe creation"))
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<()> {
    let file = fs::File::create(path)
        .map_err(|e| TwsError::CacheIo(format!("create {}: {}", path.display(), e)))?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(polars_err("write parquet"))?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<Vec<Bar>> {
    let file = fs::File::open(path)
        .map_err(|e| TwsError::CacheIo(format!("open {}: {}", path.display(), e)))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(polars_err("read parquet"))?;

    for name in COLUMNS {
        if df.column(name).is_err() {
            return Err(TwsError::InvalidBarData(format!("missing column '{}'", name)));
        }
    }

    let timestamps = df
        .column("timestamp")
        .and_then(|c| c.cast(&DataType::Int64))
        .map_err(polars_err("timestamp column"))?;
    let ts_ca = timestamps.i64().map_err(polars_err("timestamp column type"))?;

    let f64_column = |name: &str| -> Result<Float64Chunked> {
        df.column(name)
            .and_then(|c| c.f64().cloned())
            .map_err(|e| TwsError::InvalidBarData(format!("{} column: {}", name, e)))
    };
    let open_ca = f64_column("open")?;
    let high_ca = f64_column("high")?;
    let low_ca = f64_column("low")?;
    let close_ca = f64_column("close")?;
    let volume_ca = f64_column("volume")?;
    let wap_ca = f64_column("wap")?;
    let count_ca = df
        .column("bar_count")
        .and_then(|c| c.i64().cloned())
        .map_err(|e| TwsError::InvalidBarData(format!("bar_count column: {}", e)))?;

    let n = df.height();
    let mut bars = Vec::with_capacity(n);
    let mut previous: Option<DateTime<Utc>> = None;

    for i in 0..n {
        let millis = ts_ca
            .get(i)
            .ok_or_else(|| TwsError::InvalidBarData(format!("null timestamp at row {}", i)))?;
        let timestamp = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| TwsError::InvalidBarData(format!("timestamp out of range at row {}", i)))?;

        if previous.is_some_and(|p| p >= timestamp) {
            return Err(TwsError::InvalidBarData(format!(
                "timestamps not strictly increasing at row {}",
                i
            )));
        }
        previous = Some(timestamp);

        bars.push(Bar {
            timestamp,
            open: open_ca.get(i).unwrap_or(f64::NAN),
            high: high_ca.get(i).unwrap_or(f64::NAN),
            low: low_ca.get(i).unwrap_or(f64::NAN),
            close: close_ca.get(i).unwrap_or(f64::NAN),
            volume: volume_ca.get(i).unwrap_or(0.0),
            wap: wap_ca.get(i).unwrap_or(f64::NAN),
            count: count_ca.get(i).unwrap_or(0),
        });
    }

    Ok(bars)
}
