/// Time utilities for TWS request strings and bar timestamps
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{Result, TwsError};
use crate::types::TimeRange;

const SECONDS_PER_DAY: i64 = 86_400;

/// Parse a TWS duration string such as "3600 S", "2 D", "1 W", "1 M" or "1 Y"
pub fn parse_duration(s: &str) -> Result<Duration> {
    let mut parts = s.split_whitespace();
    let (amount, unit) = match (parts.next(), parts.next(), parts.next()) {
        (Some(amount), Some(unit), None) => (amount, unit),
        _ => return Err(TwsError::InvalidParameter(format!("invalid duration: '{}'", s))),
    };

    let amount: i64 = amount
        .parse()
        .map_err(|_| TwsError::InvalidParameter(format!("invalid duration amount: '{}'", s)))?;
    if amount <= 0 {
        return Err(TwsError::InvalidParameter(format!("duration must be positive: '{}'", s)));
    }

    match unit.to_uppercase().as_str() {
        "S" => Ok(Duration::seconds(amount)),
        "D" => Ok(Duration::days(amount)),
        "W" => Ok(Duration::weeks(amount)),
        "M" => Ok(Duration::days(amount * 30)),
        "Y" => Ok(Duration::days(amount * 365)),
        other => Err(TwsError::InvalidParameter(format!("invalid duration unit: '{}'", other))),
    }
}

/// Duration string covering `range`: seconds up to one day, whole days beyond
pub fn duration_string_for(range: &TimeRange) -> String {
    let seconds = range.duration().num_seconds().max(1);
    if seconds <= SECONDS_PER_DAY {
        format!("{} S", seconds)
    } else {
        let days = (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY;
        format!("{} D", days)
    }
}

/// End date-time in the UTC form TWS accepts: `yyyyMMdd-HH:mm:ss`
pub fn format_end_datetime(end: DateTime<Utc>) -> String {
    end.format("%Y%m%d-%H:%M:%S").to_string()
}

/// Inverse of [`format_end_datetime`]
pub fn parse_end_datetime(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), "%Y%m%d-%H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| TwsError::InvalidParameter(format!("invalid end date-time: '{}'", s)))
}

/// Trading timezone of an exchange, New York when unknown
pub fn market_timezone(exchange: &str) -> Tz {
    match exchange.to_uppercase().as_str() {
        "SMART" | "NASDAQ" | "NYSE" | "ARCA" | "AMEX" | "ISLAND" => chrono_tz::America::New_York,
        "HKEX" | "SEHK" => chrono_tz::Asia::Hong_Kong,
        "LSE" => chrono_tz::Europe::London,
        "TSE" | "TSEJ" => chrono_tz::Asia::Tokyo,
        "SSE" => chrono_tz::Asia::Shanghai,
        "SGX" => chrono_tz::Asia::Singapore,
        _ => chrono_tz::America::New_York,
    }
}

/// Normalise a bar date as delivered by TWS to UTC.
///
/// Accepted forms: epoch seconds, `yyyyMMdd HH:mm:ss <zone>`,
/// `yyyyMMdd HH:mm:ss` (exchange zone) and `yyyyMMdd` (midnight, exchange zone).
pub fn parse_bar_date(raw: &str, exchange_tz: Tz) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    let invalid = || TwsError::InvalidBarData(format!("unparseable bar date: '{}'", raw));

    if raw.len() == 8 && raw.chars().all(|c| c.is_ascii_digit()) {
        let date = NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|_| invalid())?;
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
        return localize(exchange_tz, midnight).ok_or_else(invalid);
    }

    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        let secs: i64 = raw.parse().map_err(|_| invalid())?;
        return DateTime::from_timestamp(secs, 0).ok_or_else(invalid);
    }

    let parts: Vec<&str> = raw.split_whitespace().collect();
    let (date_part, time_part, zone) = match parts.as_slice() {
        [date, time] => (*date, *time, exchange_tz),
        [date, time, zone] => {
            let tz: Tz = zone.parse().map_err(|_| invalid())?;
            (*date, *time, tz)
        }
        _ => return Err(invalid()),
    };

    let naive = NaiveDateTime::parse_from_str(
        &format!("{} {}", date_part, time_part),
        "%Y%m%d %H:%M:%S",
    )
    .map_err(|_| invalid())?;

    localize(zone, naive).ok_or_else(invalid)
}

fn localize(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3600 S").unwrap(), Duration::hours(1));
        assert_eq!(parse_duration("2 D").unwrap(), Duration::days(2));
        assert_eq!(parse_duration("1 w").unwrap(), Duration::days(7));
        assert_eq!(parse_duration("1 M").unwrap(), Duration::days(30));
        assert_eq!(parse_duration("1 Y").unwrap(), Duration::days(365));
        assert!(parse_duration("0 D").is_err());
        assert!(parse_duration("5 Q").is_err());
        assert!(parse_duration("D").is_err());
    }

    #[test]
    fn test_duration_string_for_range() {
        let end = Utc.with_ymd_and_hms(2025, 7, 12, 3, 0, 0).unwrap();
        let short = TimeRange::ending_at(end, Duration::minutes(390)).unwrap();
        assert_eq!(duration_string_for(&short), "23400 S");

        let long = TimeRange::ending_at(end, Duration::hours(30)).unwrap();
        assert_eq!(duration_string_for(&long), "2 D");

        let day = TimeRange::ending_at(end, Duration::days(1)).unwrap();
        assert_eq!(duration_string_for(&day), "86400 S");
    }

    #[test]
    fn test_format_end_datetime() {
        let end = Utc.with_ymd_and_hms(2025, 7, 12, 3, 0, 0).unwrap();
        assert_eq!(format_end_datetime(end), "20250712-03:00:00");
        assert_eq!(parse_end_datetime("20250712-03:00:00").unwrap(), end);
        assert!(parse_end_datetime("2025-07-12 03:00").is_err());
    }

    #[test]
    fn test_parse_bar_date_forms() {
        let ny = market_timezone("NASDAQ");
        let expected = Utc.with_ymd_and_hms(2025, 7, 10, 13, 30, 0).unwrap();

        assert_eq!(parse_bar_date("1752154200", ny).unwrap(), expected);
        assert_eq!(parse_bar_date("20250710 09:30:00 US/Eastern", ny).unwrap(), expected);
        assert_eq!(parse_bar_date("20250710  09:30:00", ny).unwrap(), expected);
        assert_eq!(
            parse_bar_date("20250710 09:30:00 Asia/Hong_Kong", ny).unwrap(),
            Utc.with_ymd_and_hms(2025, 7, 10, 1, 30, 0).unwrap()
        );
        assert_eq!(
            parse_bar_date("20250710", ny).unwrap(),
            Utc.with_ymd_and_hms(2025, 7, 10, 4, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_bar_date_rejects_garbage() {
        let ny = market_timezone("SMART");
        assert!(parse_bar_date("", ny).is_err());
        assert!(parse_bar_date("yesterday", ny).is_err());
        assert!(parse_bar_date("20250710 09:30:00 Mars/Olympus", ny).is_err());
    }

    #[test]
    fn test_market_timezone_table() {
        assert_eq!(market_timezone("hkex"), chrono_tz::Asia::Hong_Kong);
        assert_eq!(market_timezone("LSE"), chrono_tz::Europe::London);
        assert_eq!(market_timezone("UNKNOWN"), chrono_tz::America::New_York);
    }
}
