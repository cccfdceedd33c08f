/// Gap computation between a requested range and the cached coverage
use chrono::Duration;

use crate::types::TimeRange;

/// Sub-ranges of `requested` not inside `covered`.
///
/// Returns the whole request when nothing is cached or the ranges are disjoint,
/// nothing when the request lies inside the coverage, otherwise one range per
/// uncovered end. Gap boundaries share the covered endpoint.
pub fn compute_gap(requested: &TimeRange, covered: Option<&TimeRange>) -> Vec<TimeRange> {
    let covered = match covered {
        Some(covered) if covered.overlaps(requested) => covered,
        _ => return vec![*requested],
    };

    let mut gaps = Vec::with_capacity(2);
    if requested.start < covered.start {
        gaps.push(TimeRange {
            start: requested.start,
            end: covered.start,
        });
    }
    if requested.end > covered.end {
        gaps.push(TimeRange {
            start: covered.end,
            end: requested.end,
        });
    }
    gaps
}

/// Longest span one historical request may ask for ("365 D")
pub const MAX_REQUEST_DAYS: i64 = 365;

/// How a request is satisfied against the current coverage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPlan {
    /// Fetch these ranges (possibly none) and merge them into the series
    Extend(Vec<TimeRange>),
    /// Too far from the coverage to bridge: fetch the request on its own and
    /// leave the cached series as it is
    Detached(TimeRange),
}

impl FetchPlan {
    /// True when the cache already answers the request
    pub fn is_covered(&self) -> bool {
        matches!(self, FetchPlan::Extend(ranges) if ranges.is_empty())
    }
}

/// Ranges to fetch so that coverage stays one contiguous interval.
///
/// Same as [`compute_gap`] except that a request disjoint from the coverage is
/// widened to reach it, as long as the hole in between is at most `max_bridge`.
pub fn plan_fetch(requested: &TimeRange, covered: Option<&TimeRange>, max_bridge: Duration) -> FetchPlan {
    let covered = match covered {
        Some(covered) if !covered.overlaps(requested) => covered,
        _ => return FetchPlan::Extend(compute_gap(requested, covered)),
    };

    let (bridged, hole) = if requested.end < covered.start {
        (
            TimeRange {
                start: requested.start,
                end: covered.start,
            },
            covered.start - requested.end,
        )
    } else {
        (
            TimeRange {
                start: covered.end,
                end: requested.end,
            },
            requested.start - covered.end,
        )
    };

    if hole <= max_bridge {
        FetchPlan::Extend(vec![bridged])
    } else {
        FetchPlan::Detached(*requested)
    }
}

/// Cut `range` into consecutive pieces no longer than `max_span`; neighbours
/// share their boundary instant
pub fn split_range(range: &TimeRange, max_span: Duration) -> Vec<TimeRange> {
    if max_span <= Duration::zero() || range.duration() <= max_span {
        return vec![*range];
    }

    let mut pieces = Vec::new();
    let mut start = range.start;
    while start < range.end {
        let end = (start + max_span).min(range.end);
        pieces.push(TimeRange { start, end });
        start = end;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn at(offset_min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 11, 0, 0, 0).unwrap() + Duration::minutes(offset_min)
    }

    fn range(a: i64, b: i64) -> TimeRange {
        TimeRange::new(at(a.min(b)), at(a.max(b))).unwrap()
    }

    #[test]
    fn test_gap_relations() {
        let covered = range(100, 200);

        assert_eq!(compute_gap(&range(0, 50), None), vec![range(0, 50)]);
        assert_eq!(compute_gap(&range(0, 50), Some(&covered)), vec![range(0, 50)]);
        assert_eq!(compute_gap(&range(250, 300), Some(&covered)), vec![range(250, 300)]);
        assert!(compute_gap(&range(120, 180), Some(&covered)).is_empty());
        assert!(compute_gap(&covered, Some(&covered)).is_empty());
        assert_eq!(compute_gap(&range(50, 150), Some(&covered)), vec![range(50, 100)]);
        assert_eq!(compute_gap(&range(150, 250), Some(&covered)), vec![range(200, 250)]);
        assert_eq!(
            compute_gap(&range(50, 250), Some(&covered)),
            vec![range(50, 100), range(200, 250)]
        );
        // Touching at a single instant counts as overlap
        assert_eq!(compute_gap(&range(50, 100), Some(&covered)), vec![range(50, 100)]);
    }

    #[test]
    fn test_plan_bridges_disjoint_requests() {
        let covered = range(100, 200);
        let bridge = Duration::minutes(60);
        assert_eq!(
            plan_fetch(&range(50, 80), Some(&covered), bridge),
            FetchPlan::Extend(vec![range(50, 100)])
        );
        assert_eq!(
            plan_fetch(&range(250, 300), Some(&covered), bridge),
            FetchPlan::Extend(vec![range(200, 300)])
        );
        assert_eq!(
            plan_fetch(&range(0, 50), None, bridge),
            FetchPlan::Extend(vec![range(0, 50)])
        );
        assert_eq!(
            plan_fetch(&range(50, 250), Some(&covered), bridge),
            FetchPlan::Extend(compute_gap(&range(50, 250), Some(&covered)))
        );
        assert!(plan_fetch(&range(120, 180), Some(&covered), bridge).is_covered());
    }

    #[test]
    fn test_plan_far_disjoint_request_is_detached() {
        let covered = TimeRange::new(
            Utc.with_ymd_and_hms(2020, 1, 2, 14, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 1, 2, 15, 0, 0).unwrap(),
        )
        .unwrap();
        let requested = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 7, 11, 14, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 7, 11, 15, 0, 0).unwrap(),
        )
        .unwrap();

        assert_eq!(
            plan_fetch(&requested, Some(&covered), Duration::days(30)),
            FetchPlan::Detached(requested)
        );
        // The hole is exactly the limit: still bridged
        assert_eq!(
            plan_fetch(&range(0, 40), Some(&range(100, 200)), Duration::minutes(60)),
            FetchPlan::Extend(vec![range(0, 100)])
        );
    }

    #[test]
    fn test_split_range_respects_max_span() {
        assert_eq!(split_range(&range(0, 50), Duration::minutes(60)), vec![range(0, 50)]);
        assert_eq!(
            split_range(&range(0, 150), Duration::minutes(60)),
            vec![range(0, 60), range(60, 120), range(120, 150)]
        );

        let years = TimeRange::new(
            Utc.with_ymd_and_hms(2020, 1, 2, 15, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 7, 11, 15, 0, 0).unwrap(),
        )
        .unwrap();
        let pieces = split_range(&years, Duration::days(MAX_REQUEST_DAYS));
        assert_eq!(pieces.len(), 6);
        assert_eq!(pieces.first().unwrap().start, years.start);
        assert_eq!(pieces.last().unwrap().end, years.end);
        for piece in &pieces {
            assert!(piece.duration() <= Duration::days(MAX_REQUEST_DAYS));
        }
    }

    proptest! {
        #[test]
        fn prop_gaps_plus_coverage_span_request(
            ra in 0i64..1000, rb in 0i64..1000,
            ca in 0i64..1000, cb in 0i64..1000,
            point in 0i64..1000,
            cached in any::<bool>(),
        ) {
            let requested = range(ra, rb);
            let covered = range(ca, cb);
            let covered_opt = if cached { Some(&covered) } else { None };
            let gaps = compute_gap(&requested, covered_opt);

            prop_assert!(gaps.len() <= 2);
            for gap in &gaps {
                prop_assert!(gap.is_within(&requested));
                // A gap never reaches into the interior of the coverage
                if cached && gap.overlaps(&covered) {
                    let shared = gap.intersection(&covered).unwrap();
                    prop_assert_eq!(shared.start, shared.end);
                }
            }

            let t = at(point);
            if requested.contains(t) {
                let in_cache = cached && covered.contains(t);
                prop_assert!(in_cache || gaps.iter().any(|g| g.contains(t)));
            }
        }

        #[test]
        fn prop_plan_keeps_coverage_contiguous(
            ra in 0i64..1000, rb in 0i64..1000,
            ca in 0i64..1000, cb in 0i64..1000,
            bridge in 0i64..1000,
        ) {
            let requested = range(ra, rb);
            let covered = range(ca, cb);
            match plan_fetch(&requested, Some(&covered), Duration::minutes(bridge)) {
                FetchPlan::Extend(plan) => {
                    let mut merged = covered;
                    for fetch in &plan {
                        prop_assert!(fetch.overlaps(&covered));
                        merged = merged.hull(fetch);
                    }
                    prop_assert!(requested.is_within(&merged));
                }
                FetchPlan::Detached(fetch) => {
                    prop_assert_eq!(fetch, requested);
                    prop_assert!(!requested.overlaps(&covered));
                }
            }
        }
    }
}
