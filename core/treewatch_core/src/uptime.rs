//! Windowed uptime/downtime over a tree log slice, plus the percentile report built on the same
//! clamped, outlier-filtered rows.

use crate::tree_log::TreeEvent;
use serde::Serialize;
use std::collections::BTreeMap;
use time::{OffsetDateTime, UtcOffset};

const BANDS: [(u8, u8); 3] = [(40, 60), (25, 75), (10, 90)];

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct UpDown {
    pub uptime_seconds: f64,
    pub downtime_seconds: f64,
}

impl UpDown {
    pub fn uptime_percent(&self) -> f64 {
        100.0 * self.uptime_seconds / (self.uptime_seconds + self.downtime_seconds + 0.00001)
    }
}

#[derive(Clone, Copy, Debug)]
struct Row {
    end: OffsetDateTime,
    uptime: f64,
    /// Gap since the previous event of the slice; the first row has none.
    downtime: Option<f64>,
}

/// Clamps each event to the window and computes per-row uptime and the gap to its predecessor,
/// then drops rows where either value reaches `outlier_seconds`.
fn filtered_rows(
    events: &[TreeEvent],
    window_start: OffsetDateTime,
    window_end: OffsetDateTime,
    outlier_seconds: f64,
) -> Vec<Row> {
    let mut rows = Vec::with_capacity(events.len());
    let mut prev_end: Option<OffsetDateTime> = None;
    for e in events {
        let start = e.start.max(window_start);
        let end = e.end.min(window_end);
        rows.push(Row {
            end,
            uptime: (end - start).as_seconds_f64(),
            downtime: prev_end.map(|p| (start - p).as_seconds_f64()),
        });
        prev_end = Some(end);
    }
    rows.retain(|r| {
        r.uptime < outlier_seconds && r.downtime.map_or(true, |d| d < outlier_seconds)
    });
    rows
}

/// Total covered (`uptime`) and uncovered (`downtime`) seconds of the window.
///
/// `events` must be one category, sorted by start and overlap-free (as returned by
/// `TreeLogStore::read`). An empty slice means the tree was down for the whole window.
pub fn up_down(
    events: &[TreeEvent],
    window_start: OffsetDateTime,
    window_end: OffsetDateTime,
    outlier_seconds: f64,
) -> UpDown {
    let rows = filtered_rows(events, window_start, window_end, outlier_seconds);
    let Some(last) = rows.last() else {
        return UpDown {
            uptime_seconds: 0.0,
            downtime_seconds: (window_end - window_start).as_seconds_f64().max(0.0),
        };
    };

    let mut out = UpDown::default();
    for r in &rows {
        out.uptime_seconds += r.uptime;
        out.downtime_seconds += r.downtime.unwrap_or(0.0);
    }
    // Still dry at the end of the window.
    if last.end < window_end {
        out.downtime_seconds += (window_end - last.end).as_seconds_f64();
    }
    out
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Band {
    pub lower_pct: u8,
    pub upper_pct: u8,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupStats {
    pub key: u8,
    pub count: usize,
    pub median: f64,
    pub bands: Vec<Band>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DateRatio {
    pub date: String,
    pub ratio: f64,
}

/// Downtime distribution by hour of day and day of week, and the mean downtime/uptime ratio per
/// calendar date. Grouping uses each interval's end in `tz`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SummaryReport {
    pub rows: usize,
    pub hour_of_day: Vec<GroupStats>,
    pub day_of_week: Vec<GroupStats>,
    pub date_ratio: Vec<DateRatio>,
}

/// Linear-interpolated quantile of sorted values.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn group_stats(groups: BTreeMap<u8, Vec<f64>>) -> Vec<GroupStats> {
    groups
        .into_iter()
        .map(|(key, mut values)| {
            values.sort_by(f64::total_cmp);
            GroupStats {
                key,
                count: values.len(),
                median: quantile(&values, 0.5),
                bands: BANDS
                    .iter()
                    .map(|&(lower_pct, upper_pct)| Band {
                        lower_pct,
                        upper_pct,
                        lower: quantile(&values, f64::from(lower_pct) / 100.0),
                        upper: quantile(&values, f64::from(upper_pct) / 100.0),
                    })
                    .collect(),
            }
        })
        .collect()
}

pub fn summary_report(
    events: &[TreeEvent],
    window_start: OffsetDateTime,
    window_end: OffsetDateTime,
    outlier_seconds: f64,
    tz: UtcOffset,
) -> SummaryReport {
    let rows = filtered_rows(events, window_start, window_end, outlier_seconds);

    let mut by_hour: BTreeMap<u8, Vec<f64>> = BTreeMap::new();
    let mut by_day: BTreeMap<u8, Vec<f64>> = BTreeMap::new();
    let mut by_date: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    let mut used = 0;

    for r in &rows {
        let Some(downtime) = r.downtime else {
            continue;
        };
        used += 1;
        let local_end = r.end.to_offset(tz);
        by_hour.entry(local_end.hour()).or_default().push(downtime);
        by_day
            .entry(local_end.weekday().number_days_from_monday())
            .or_default()
            .push(downtime);
        if r.uptime > 0.0 {
            let acc = by_date.entry(local_end.date().to_string()).or_default();
            acc.0 += downtime / r.uptime;
            acc.1 += 1;
        }
    }

    SummaryReport {
        rows: used,
        hour_of_day: group_stats(by_hour),
        day_of_week: group_stats(by_day),
        date_ratio: by_date
            .into_iter()
            .map(|(date, (sum, n))| DateRatio {
                date,
                ratio: sum / n as f64,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree_log::Category;
    use time::{macros::datetime, Duration};

    const THRESHOLD: f64 = 2.0 * 60.0 * 60.0;

    fn base() -> OffsetDateTime {
        datetime!(2025-01-06 00:00:00 UTC)
    }

    fn water(start_s: i64, end_s: i64) -> TreeEvent {
        TreeEvent::new(
            base() + Duration::seconds(start_s),
            base() + Duration::seconds(end_s),
            Category::Water,
        )
    }

    #[test]
    fn empty_slice_is_fully_down() {
        let ws = base();
        let we = base() + Duration::hours(24);
        let got = up_down(&[], ws, we, THRESHOLD);
        assert_eq!(
            got,
            UpDown {
                uptime_seconds: 0.0,
                downtime_seconds: 86_400.0
            }
        );
    }

    #[test]
    fn event_spanning_window_is_fully_clamped() {
        let ws = base() + Duration::seconds(100);
        let we = base() + Duration::seconds(1_100);
        let got = up_down(&[water(90, 1_110)], ws, we, THRESHOLD);
        assert_eq!(got.uptime_seconds, 1_000.0);
        assert_eq!(got.downtime_seconds, 0.0);
    }

    #[test]
    fn sums_gaps_and_trailing_downtime() {
        let ws = base();
        let we = base() + Duration::seconds(1_000);
        let events = [water(0, 100), water(150, 300), water(400, 600)];
        let got = up_down(&events, ws, we, THRESHOLD);
        assert_eq!(got.uptime_seconds, 100.0 + 150.0 + 200.0);
        assert_eq!(got.downtime_seconds, 50.0 + 100.0 + 400.0);
    }

    #[test]
    fn outlier_rows_contribute_nothing() {
        let ws = base();
        let we = base() + Duration::seconds(1_000);
        let threshold = 300.0;
        // Middle event lasts 400s, over the threshold: its uptime and its own gap are dropped.
        let events = [water(0, 100), water(150, 550), water(600, 700)];
        let got = up_down(&events, ws, we, threshold);
        assert_eq!(got.uptime_seconds, 100.0 + 100.0);
        assert_eq!(got.downtime_seconds, 50.0 + 300.0);
    }

    #[test]
    fn long_gap_is_an_outlier() {
        let ws = base();
        let we = base() + Duration::seconds(2_000);
        let threshold = 500.0;
        let events = [water(0, 100), water(900, 1_000)];
        let got = up_down(&events, ws, we, threshold);
        // Second row's gap (800s) rejects it; the first row is last and the tail counts as down.
        assert_eq!(got.uptime_seconds, 100.0);
        assert_eq!(got.downtime_seconds, 1_900.0);
    }

    #[test]
    fn uptime_percent_handles_zero_totals() {
        assert_eq!(UpDown::default().uptime_percent(), 0.0);
        let half = UpDown {
            uptime_seconds: 50.0,
            downtime_seconds: 50.0,
        };
        assert!((half.uptime_percent() - 50.0).abs() < 1e-3);
    }

    #[test]
    fn quantile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&v, 0.5), 2.5);
        assert_eq!(quantile(&v, 0.0), 1.0);
        assert_eq!(quantile(&v, 1.0), 4.0);
        assert!(quantile(&[], 0.5).is_nan());
    }

    #[test]
    fn summary_groups_by_local_end() {
        let ws = base();
        let we = base() + Duration::hours(6);
        // 2025-01-06 is a Monday.
        let events = [
            water(0, 600),
            water(660, 1_260),
            water(1_380, 1_980),
            water(3_600, 4_200),
        ];
        let report = summary_report(&events, ws, we, THRESHOLD, UtcOffset::UTC);
        assert_eq!(report.rows, 3);
        assert_eq!(report.hour_of_day.len(), 2);
        assert_eq!(report.hour_of_day[0].key, 0);
        assert_eq!(report.hour_of_day[0].count, 2);
        assert_eq!(report.hour_of_day[0].median, 90.0);
        assert_eq!(report.hour_of_day[1].key, 1);
        assert_eq!(report.hour_of_day[1].median, 1_620.0);
        assert_eq!(report.day_of_week.len(), 1);
        assert_eq!(report.day_of_week[0].key, 0);
        assert_eq!(report.day_of_week[0].bands.len(), 3);
        assert_eq!(report.date_ratio.len(), 1);
        assert_eq!(report.date_ratio[0].date, "2025-01-06");

        let shifted = summary_report(
            &events,
            ws,
            we,
            THRESHOLD,
            UtcOffset::from_hms(-2, 0, 0).unwrap(),
        );
        assert_eq!(shifted.day_of_week[0].key, 6);
        assert_eq!(shifted.date_ratio[0].date, "2025-01-05");
    }
}
