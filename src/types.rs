/// Core type definitions for the TWS client
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, TwsError};

/// Request identifier assigned by the client, unique per session
pub type RequestId = i64;

/// OHLCV bar as stored in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub wap: f64,
    pub count: i64,
}

/// Closed time interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(TwsError::InvalidParameter(format!(
                "range start {} is after end {}",
                start, end
            )));
        }
        Ok(TimeRange { start, end })
    }

    /// Range of `duration` ending at `end`, the way TWS interprets end + duration
    pub fn ending_at(end: DateTime<Utc>, duration: Duration) -> Result<Self> {
        if duration < Duration::zero() {
            return Err(TwsError::InvalidParameter(format!(
                "negative duration: {}",
                duration
            )));
        }
        Self::new(end - duration, end)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// True if `self` lies entirely inside `other`
    pub fn is_within(&self, other: &TimeRange) -> bool {
        self.start >= other.start && self.end <= other.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(TimeRange { start, end })
    }

    /// Smallest range containing both
    pub fn hull(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} .. {}]",
            self.start.format("%Y-%m-%d %H:%M:%S"),
            self.end.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Connection state machine owned by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
            ConnectionState::Failed => "FAILED",
        }
    }
}

/// Security type codes as used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityType {
    #[serde(rename = "STK")]
    Stock,
    #[serde(rename = "OPT")]
    Option,
    #[serde(rename = "FUT")]
    Future,
    #[serde(rename = "CASH")]
    Forex,
    #[serde(rename = "CFD")]
    Cfd,
    #[serde(rename = "BOND")]
    Bond,
    #[serde(rename = "IND")]
    Index,
    #[serde(rename = "FUND")]
    Fund,
    #[serde(rename = "BAG")]
    Combo,
    #[serde(rename = "WAR")]
    Warrant,
    #[serde(rename = "CRYPTO")]
    Crypto,
}

impl SecurityType {
    pub fn as_str(&self) -> &str {
        match self {
            SecurityType::Stock => "STK",
            SecurityType::Option => "OPT",
            SecurityType::Future => "FUT",
            SecurityType::Forex => "CASH",
            SecurityType::Cfd => "CFD",
            SecurityType::Bond => "BOND",
            SecurityType::Index => "IND",
            SecurityType::Fund => "FUND",
            SecurityType::Combo => "BAG",
            SecurityType::Warrant => "WAR",
            SecurityType::Crypto => "CRYPTO",
        }
    }
}

/// Which price series a historical request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WhatToShow {
    Trades,
    Midpoint,
    BidAsk,
    Bid,
    Ask,
    OptionImpliedVolatility,
    OptionVolume,
    OptionOpenInterest,
}

impl WhatToShow {
    pub fn as_str(&self) -> &str {
        match self {
            WhatToShow::Trades => "TRADES",
            WhatToShow::Midpoint => "MIDPOINT",
            WhatToShow::BidAsk => "BID_ASK",
            WhatToShow::Bid => "BID",
            WhatToShow::Ask => "ASK",
            WhatToShow::OptionImpliedVolatility => "OPTION_IMPLIED_VOLATILITY",
            WhatToShow::OptionVolume => "OPTION_VOLUME",
            WhatToShow::OptionOpenInterest => "OPTION_OPEN_INTEREST",
        }
    }
}

/// Bar size settings accepted by historical data requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BarSize {
    Sec1,
    Sec5,
    Sec10,
    Sec15,
    Sec30,
    Min1,
    Min2,
    Min3,
    Min5,
    Min10,
    Min15,
    Min20,
    Min30,
    Hour1,
    Hour2,
    Hour3,
    Hour4,
    Hour8,
    Day1,
    Week1,
    Month1,
}

const BAR_SIZES: [BarSize; 21] = [
    BarSize::Sec1,
    BarSize::Sec5,
    BarSize::Sec10,
    BarSize::Sec15,
    BarSize::Sec30,
    BarSize::Min1,
    BarSize::Min2,
    BarSize::Min3,
    BarSize::Min5,
    BarSize::Min10,
    BarSize::Min15,
    BarSize::Min20,
    BarSize::Min30,
    BarSize::Hour1,
    BarSize::Hour2,
    BarSize::Hour3,
    BarSize::Hour4,
    BarSize::Hour8,
    BarSize::Day1,
    BarSize::Week1,
    BarSize::Month1,
];

impl BarSize {
    /// Wire string, e.g. "5 mins"
    pub fn as_str(&self) -> &'static str {
        match self {
            BarSize::Sec1 => "1 secs",
            BarSize::Sec5 => "5 secs",
            BarSize::Sec10 => "10 secs",
            BarSize::Sec15 => "15 secs",
            BarSize::Sec30 => "30 secs",
            BarSize::Min1 => "1 min",
            BarSize::Min2 => "2 mins",
            BarSize::Min3 => "3 mins",
            BarSize::Min5 => "5 mins",
            BarSize::Min10 => "10 mins",
            BarSize::Min15 => "15 mins",
            BarSize::Min20 => "20 mins",
            BarSize::Min30 => "30 mins",
            BarSize::Hour1 => "1 hour",
            BarSize::Hour2 => "2 hours",
            BarSize::Hour3 => "3 hours",
            BarSize::Hour4 => "4 hours",
            BarSize::Hour8 => "8 hours",
            BarSize::Day1 => "1 day",
            BarSize::Week1 => "1 week",
            BarSize::Month1 => "1 month",
        }
    }

    /// Parse a bar size, tolerating singular/plural units and case
    pub fn parse(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        let mut parts = normalized.split_whitespace();
        let (amount, unit) = match (parts.next(), parts.next(), parts.next()) {
            (Some(amount), Some(unit), None) => (amount, unit.trim_end_matches('s')),
            _ => return Err(TwsError::InvalidParameter(format!("invalid bar size: '{}'", s))),
        };

        BAR_SIZES
            .iter()
            .copied()
            .find(|size| {
                let mut wire = size.as_str().split(' ');
                wire.next() == Some(amount)
                    && wire.next().map(|u| u.trim_end_matches('s')) == Some(unit)
            })
            .ok_or_else(|| TwsError::InvalidParameter(format!("invalid bar size: '{}'", s)))
    }

    /// Nominal length of one bar (months counted as 30 days)
    pub fn duration(&self) -> Duration {
        match self {
            BarSize::Sec1 => Duration::seconds(1),
            BarSize::Sec5 => Duration::seconds(5),
            BarSize::Sec10 => Duration::seconds(10),
            BarSize::Sec15 => Duration::seconds(15),
            BarSize::Sec30 => Duration::seconds(30),
            BarSize::Min1 => Duration::minutes(1),
            BarSize::Min2 => Duration::minutes(2),
            BarSize::Min3 => Duration::minutes(3),
            BarSize::Min5 => Duration::minutes(5),
            BarSize::Min10 => Duration::minutes(10),
            BarSize::Min15 => Duration::minutes(15),
            BarSize::Min20 => Duration::minutes(20),
            BarSize::Min30 => Duration::minutes(30),
            BarSize::Hour1 => Duration::hours(1),
            BarSize::Hour2 => Duration::hours(2),
            BarSize::Hour3 => Duration::hours(3),
            BarSize::Hour4 => Duration::hours(4),
            BarSize::Hour8 => Duration::hours(8),
            BarSize::Day1 => Duration::days(1),
            BarSize::Week1 => Duration::weeks(1),
            BarSize::Month1 => Duration::days(30),
        }
    }

    /// Cache subdirectory name, e.g. "5_mins"
    pub fn dir_name(&self) -> String {
        self.as_str().replace(' ', "_")
    }
}

impl fmt::Display for BarSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for BarSize {
    type Error = TwsError;

    fn try_from(value: String) -> Result<Self> {
        BarSize::parse(&value)
    }
}

impl From<BarSize> for String {
    fn from(size: BarSize) -> Self {
        size.as_str().to_string()
    }
}

/// Financial instrument as sent in historical requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub sec_type: SecurityType,
    pub exchange: String,
    pub currency: String,
    pub primary_exchange: String,
    pub local_symbol: String,
    pub con_id: i64,
}

impl Contract {
    /// Stock routed through SMART in USD
    pub fn stock(symbol: &str) -> Self {
        Contract {
            symbol: symbol.to_uppercase(),
            sec_type: SecurityType::Stock,
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            primary_exchange: String::new(),
            local_symbol: String::new(),
            con_id: 0,
        }
    }

    pub fn on_exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_uppercase();
        self
    }

    pub fn in_currency(mut self, currency: &str) -> Self {
        self.currency = currency.to_uppercase();
        self
    }

    pub fn with_primary_exchange(mut self, primary_exchange: &str) -> Self {
        self.primary_exchange = primary_exchange.to_uppercase();
        self
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    // Connection
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    pub connect_timeout_sec: u64,
    pub disconnect_timeout_sec: u64,

    // Historical Requests
    pub request_timeout_sec: u64,
    pub what_to_show: WhatToShow,
    pub use_rth: bool,
    /// Largest hole between a request and the cached range that is fetched
    /// to keep the range contiguous; farther requests bypass the cache
    pub max_bridge_days: u32,

    // Pacing
    pub pacing_max_requests: u32,
    pub pacing_window_sec: u64,

    // Storage
    pub cache_dir: PathBuf,

    // Logging
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 1,
            connect_timeout_sec: 10,
            disconnect_timeout_sec: 3,
            request_timeout_sec: 60,
            what_to_show: WhatToShow::Trades,
            use_rth: true,
            max_bridge_days: 30,
            pacing_max_requests: 60,
            pacing_window_sec: 600,
            cache_dir: PathBuf::from(".twsc_cache"),
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn disconnect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.disconnect_timeout_sec)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_sec)
    }

    pub fn pacing_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pacing_window_sec)
    }

    pub fn max_bridge(&self) -> Duration {
        Duration::days(i64::from(self.max_bridge_days))
    }
}
