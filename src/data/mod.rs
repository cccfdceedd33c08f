pub mod cache;
pub mod coverage;
pub mod historical_sync;
pub mod parquet_store;
pub mod series;

pub use cache::{HistoricalDataCache, LockedSeries};
pub use coverage::{compute_gap, plan_fetch, split_range, FetchPlan, MAX_REQUEST_DAYS};
pub use historical_sync::{HistoricalDataSync, SyncReport};
pub use parquet_store::{CacheMeta, ParquetStore};
pub use series::{BarSeries, BarSeriesKey, MergeStats};
