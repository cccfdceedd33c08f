/// Fetches uncovered sub-ranges from the session and merges them into the cache
use chrono_tz::Tz;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::cache::LockedSeries;
use super::coverage::{split_range, MAX_REQUEST_DAYS};
use super::series::BarSeriesKey;
use crate::broker::HistoricalDataRequest;
use crate::connection::ConnectionManager;
use crate::error::{Result, TwsError};
use crate::events::{PumpHandle, RawBar};
use crate::requests::RequestCorrelator;
use crate::types::{Bar, Contract, TimeRange};
use crate::utils::{market_timezone, parse_bar_date, RateLimiter};

/// What one `fetch_missing` call did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub sub_ranges: usize,
    pub failed: usize,
    pub bars_received: usize,
    pub bars_inserted: usize,
    pub bars_replaced: usize,
    pub bars_discarded: usize,
}

pub struct HistoricalDataSync {
    correlator: Arc<RequestCorrelator>,
    connection: Arc<ConnectionManager>,
    pump: PumpHandle,
    limiter: RateLimiter,
    use_rth: bool,
}

impl HistoricalDataSync {
    pub fn new(
        correlator: Arc<RequestCorrelator>,
        connection: Arc<ConnectionManager>,
        pump: PumpHandle,
        limiter: RateLimiter,
        use_rth: bool,
    ) -> Self {
        Self {
            correlator,
            connection,
            pump,
            limiter,
            use_rth,
        }
    }

    /// Fetch every gap concurrently, one request id per piece.
    ///
    /// Gaps longer than one request may span are split first. Successful pieces
    /// are merged even when another one fails, as long as they touch the cached
    /// range; the first failure in gap order is returned, wrapped in
    /// `PartialFetch` when more than one piece was requested.
    pub async fn fetch_missing(
        &self,
        series: &mut LockedSeries<'_>,
        contract: &Contract,
        gaps: &[TimeRange],
        timeout: Duration,
    ) -> Result<SyncReport> {
        let pieces: Vec<TimeRange> = gaps
            .iter()
            .flat_map(|gap| split_range(gap, max_request_span()))
            .collect();
        let mut report = SyncReport {
            sub_ranges: pieces.len(),
            ..SyncReport::default()
        };
        if pieces.is_empty() {
            return Ok(report);
        }

        self.connection.ensure_ready()?;
        info!("📥 Fetching {} sub-range(s) for {}", pieces.len(), series.key());

        let key = series.key().clone();
        let results = join_all(
            pieces
                .iter()
                .map(|piece| self.fetch_range(contract, &key, *piece, timeout)),
        )
        .await;

        let mut fetched = Vec::with_capacity(pieces.len());
        let mut first_error: Option<TwsError> = None;
        for (piece, result) in pieces.iter().zip(results) {
            match result {
                Ok(bars) => {
                    report.bars_received += bars.len();
                    fetched.push((*piece, bars));
                }
                Err(e) => {
                    warn!("⚠️  Sub-range {} for {} failed: {} ({})", piece, key, e, e.error_code());
                    report.failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        // Coverage must never span a piece that failed
        while let Some(index) = fetched
            .iter()
            .position(|(piece, _)| series.coverage().map_or(true, |c| c.overlaps(piece)))
        {
            let (piece, bars) = fetched.remove(index);
            let stats = series.merge(bars, piece);
            report.bars_inserted += stats.inserted;
            report.bars_replaced += stats.replaced;
            report.bars_discarded += stats.discarded;
        }
        for (piece, bars) in fetched {
            warn!(
                "Dropping {} bars for {} in {}: cut off from the cached range by a failed fetch",
                bars.len(),
                key,
                piece
            );
            report.bars_discarded += bars.len();
        }

        match first_error {
            None => {
                info!(
                    "✅ Fetched {} bars for {} ({} new)",
                    report.bars_received, key, report.bars_inserted
                );
                Ok(report)
            }
            Some(e) => Err(fetch_error(e, report.failed, report.sub_ranges)),
        }
    }

    /// Fetch `range` without touching the cache; every piece must succeed
    pub async fn fetch_detached(
        &self,
        contract: &Contract,
        key: &BarSeriesKey,
        range: TimeRange,
        timeout: Duration,
    ) -> Result<Vec<Bar>> {
        self.connection.ensure_ready()?;

        let pieces = split_range(&range, max_request_span());
        info!(
            "📥 Fetching {} for {} outside the cached range ({} request(s), not cached)",
            range,
            key,
            pieces.len()
        );

        let results = join_all(
            pieces
                .iter()
                .map(|piece| self.fetch_range(contract, key, *piece, timeout)),
        )
        .await;

        let mut bars = BTreeMap::new();
        let mut failed = 0;
        let mut first_error: Option<TwsError> = None;
        for (piece, result) in pieces.iter().zip(results) {
            match result {
                Ok(piece_bars) => {
                    for bar in piece_bars.into_iter().filter(|b| range.contains(b.timestamp)) {
                        bars.insert(bar.timestamp, bar);
                    }
                }
                Err(e) => {
                    warn!("⚠️  Sub-range {} for {} failed: {} ({})", piece, key, e, e.error_code());
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(bars.into_values().collect()),
            Some(e) => Err(fetch_error(e, failed, pieces.len())),
        }
    }

    async fn fetch_range(
        &self,
        contract: &Contract,
        key: &BarSeriesKey,
        range: TimeRange,
        timeout: Duration,
    ) -> Result<Vec<Bar>> {
        self.limiter.acquire().await;
        self.connection.ensure_ready()?;

        let request_id = self.correlator.next_request_id();
        let request = HistoricalDataRequest::for_range(
            contract,
            &range,
            key.bar_size,
            key.what_to_show,
            self.use_rth,
        );

        // Register before sending so no callback can arrive for an unknown id
        let waiter = self.correlator.submit(request_id, timeout).await?;
        if let Err(e) = self.pump.send_historical(request_id, request).await {
            self.correlator.abandon(request_id).await;
            return Err(e);
        }

        match self.correlator.wait(waiter).await {
            Ok(raw) => convert_bars(raw, bar_timezone(contract)),
            Err(e @ TwsError::RequestTimeout { .. }) => {
                self.pump.cancel(request_id);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

fn max_request_span() -> chrono::Duration {
    chrono::Duration::days(MAX_REQUEST_DAYS)
}

/// First failure of a multi-piece fetch, wrapped when there were several pieces
fn fetch_error(first: TwsError, failed: usize, total: usize) -> TwsError {
    if total == 1 {
        first
    } else {
        TwsError::PartialFetch {
            failed,
            total,
            source: Box::new(first),
        }
    }
}

fn bar_timezone(contract: &Contract) -> Tz {
    if contract.primary_exchange.is_empty() {
        market_timezone(&contract.exchange)
    } else {
        market_timezone(&contract.primary_exchange)
    }
}

pub fn convert_bars(raw: Vec<RawBar>, tz: Tz) -> Result<Vec<Bar>> {
    raw.into_iter()
        .map(|bar| {
            Ok(Bar {
                timestamp: parse_bar_date(&bar.date, tz)?,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
                wap: bar.wap,
                count: bar.count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn raw(date: &str) -> RawBar {
        RawBar {
            date: date.to_string(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 100.0,
            wap: 1.25,
            count: 4,
        }
    }

    #[test]
    fn test_convert_bars_normalizes_dates() {
        let bars = convert_bars(
            vec![raw("1752154200"), raw("20250710 09:35:00 US/Eastern")],
            chrono_tz::America::New_York,
        )
        .unwrap();

        assert_eq!(bars[0].timestamp, Utc.with_ymd_and_hms(2025, 7, 10, 13, 30, 0).unwrap());
        assert_eq!(bars[1].timestamp, Utc.with_ymd_and_hms(2025, 7, 10, 13, 35, 0).unwrap());
        assert_eq!(bars[1].count, 4);
    }

    #[test]
    fn test_convert_bars_rejects_bad_date() {
        let result = convert_bars(vec![raw("not a date")], chrono_tz::America::New_York);
        assert!(matches!(result, Err(TwsError::InvalidBarData(_))));
    }

    #[test]
    fn test_primary_exchange_sets_timezone() {
        let contract = Contract::stock("700").on_exchange("SMART").with_primary_exchange("SEHK");
        assert_eq!(bar_timezone(&contract), chrono_tz::Asia::Hong_Kong);
    }
}
