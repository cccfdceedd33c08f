/// Boundary to the external protocol session
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::events::SessionEvent;
use crate::types::{BarSize, Contract, RequestId, TimeRange, WhatToShow};
use crate::utils::{duration_string_for, format_end_datetime, parse_duration, parse_end_datetime};

/// Dates come back as epoch seconds
pub const FORMAT_DATE_EPOCH: i32 = 2;

/// Parameters of one historical data request as sent on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalDataRequest {
    pub contract: Contract,
    /// `yyyyMMdd-HH:mm:ss`, UTC
    pub end_date_time: String,
    /// e.g. "3600 S", "2 D"
    pub duration: String,
    pub bar_size: BarSize,
    pub what_to_show: WhatToShow,
    pub use_rth: bool,
    pub format_date: i32,
}

impl HistoricalDataRequest {
    /// Request covering `range`, ending at its end
    pub fn for_range(
        contract: &Contract,
        range: &TimeRange,
        bar_size: BarSize,
        what_to_show: WhatToShow,
        use_rth: bool,
    ) -> Self {
        HistoricalDataRequest {
            contract: contract.clone(),
            end_date_time: format_end_datetime(range.end),
            duration: duration_string_for(range),
            bar_size,
            what_to_show,
            use_rth,
            format_date: FORMAT_DATE_EPOCH,
        }
    }

    /// Range the session will answer for; may start earlier than asked
    /// because durations beyond a day are rounded up to whole days
    pub fn requested_range(&self) -> Result<TimeRange> {
        let end = parse_end_datetime(&self.end_date_time)?;
        let duration: Duration = parse_duration(&self.duration)?;
        TimeRange::ending_at(end, duration)
    }
}

/// Where the session pushes its callbacks
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        EventSink { tx }
    }

    /// Push an event; false once the pump is gone
    pub fn emit(&self, event: SessionEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!("Event sink closed, dropping {}", e.0.as_str());
                false
            }
        }
    }
}

/// Protocol session driven exclusively from the event pump.
///
/// Calls return once the request is handed to the session; results arrive
/// later through the [`EventSink`] given to `connect`.
pub trait SessionAdapter: Send {
    fn connect(&mut self, host: &str, port: u16, client_id: i32, sink: EventSink) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;

    fn send_historical_data_request(
        &mut self,
        request_id: RequestId,
        request: &HistoricalDataRequest,
    ) -> Result<()>;

    /// Best effort, no acknowledgement expected
    fn cancel_historical_data(&mut self, request_id: RequestId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_request_for_range() {
        let end = chrono::Utc.with_ymd_and_hms(2025, 7, 12, 3, 0, 0).unwrap();
        let range = TimeRange::ending_at(end, Duration::minutes(390)).unwrap();
        let request = HistoricalDataRequest::for_range(
            &Contract::stock("AAPL"),
            &range,
            BarSize::Min5,
            WhatToShow::Trades,
            false,
        );

        assert_eq!(request.end_date_time, "20250712-03:00:00");
        assert_eq!(request.duration, "23400 S");
        assert_eq!(request.format_date, 2);
        assert_eq!(request.requested_range().unwrap(), range);
    }

    #[test]
    fn test_multi_day_request_rounds_up() {
        let end = chrono::Utc.with_ymd_and_hms(2025, 7, 12, 0, 0, 0).unwrap();
        let range = TimeRange::ending_at(end, Duration::hours(36)).unwrap();
        let request = HistoricalDataRequest::for_range(
            &Contract::stock("AAPL"),
            &range,
            BarSize::Hour1,
            WhatToShow::Trades,
            true,
        );

        assert_eq!(request.duration, "2 D");
        let answered = request.requested_range().unwrap();
        assert!(range.is_within(&answered));
    }

    #[test]
    fn test_sink_reports_closed_pump() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        assert!(sink.emit(SessionEvent::NextValidId(1)));
        drop(rx);
        assert!(!sink.emit(SessionEvent::ConnectionClosed));
    }
}
