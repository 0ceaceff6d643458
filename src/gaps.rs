use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::timestamp::parse_date;

/// One day of the external feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub rooms_available: u32,
}

/// A run of consecutive days with at least one room free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityGap {
    pub start_date: NaiveDate,
    /// Last available day of the run, inclusive.
    pub end_date: NaiveDate,
    pub nights: u32,
    /// Bottleneck: the fewest rooms free on any day of the run.
    pub min_rooms_available: u32,
}

/// Read one raw feed entry. `None` for anything malformed.
pub fn parse_day(value: &Value) -> Option<DayAvailability> {
    let date = parse_date(value.get("date")?.as_str()?)?;
    let rooms = value
        .get("roomsAvailable")
        .or_else(|| value.get("rooms_available"))?
        .as_u64()?;
    Some(DayAvailability {
        date,
        rooms_available: u32::try_from(rooms).ok()?,
    })
}

/// Keep the well-formed entries, in feed order.
pub fn parse_days(values: &[Value]) -> Vec<DayAvailability> {
    let days: Vec<_> = values.iter().filter_map(parse_day).collect();
    let skipped = values.len() - days.len();
    if skipped > 0 {
        debug!(skipped, "skipped malformed availability entries");
    }
    days
}

/// Reduce a day sequence to runs of available days at least `min_nights`
/// long. Days are sorted first and a repeated date keeps its first entry.
/// Only a sold-out day ends a run; a day missing from the feed does not.
pub fn find_gaps(days: &[DayAvailability], min_nights: u32) -> Vec<AvailabilityGap> {
    let min_nights = min_nights.max(1);
    let mut sorted = days.to_vec();
    sorted.sort_by_key(|d| d.date);
    sorted.dedup_by_key(|d| d.date);

    let mut gaps = Vec::new();
    let mut current: Option<AvailabilityGap> = None;
    let mut close = |gap: Option<AvailabilityGap>| {
        if let Some(gap) = gap.filter(|g| g.nights >= min_nights) {
            gaps.push(gap);
        }
    };

    for day in sorted {
        if day.rooms_available == 0 {
            close(current.take());
            continue;
        }
        match current.as_mut() {
            Some(gap) => {
                gap.end_date = day.date;
                gap.nights += 1;
                gap.min_rooms_available = gap.min_rooms_available.min(day.rooms_available);
            }
            None => {
                current = Some(AvailabilityGap {
                    start_date: day.date,
                    end_date: day.date,
                    nights: 1,
                    min_rooms_available: day.rooms_available,
                });
            }
        }
    }
    close(current);
    gaps
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn day(s: &str, rooms: u32) -> DayAvailability {
        DayAvailability {
            date: date(s),
            rooms_available: rooms,
        }
    }

    fn january() -> Vec<DayAvailability> {
        vec![
            day("2030-01-01", 2),
            day("2030-01-02", 1),
            day("2030-01-03", 0),
            day("2030-01-04", 3),
            day("2030-01-05", 3),
        ]
    }

    #[test]
    fn two_night_runs_are_found() {
        assert_eq!(
            find_gaps(&january(), 2),
            vec![
                AvailabilityGap {
                    start_date: date("2030-01-01"),
                    end_date: date("2030-01-02"),
                    nights: 2,
                    min_rooms_available: 1,
                },
                AvailabilityGap {
                    start_date: date("2030-01-04"),
                    end_date: date("2030-01-05"),
                    nights: 2,
                    min_rooms_available: 3,
                },
            ]
        );
    }

    #[test]
    fn threshold_above_every_run_yields_nothing() {
        assert!(find_gaps(&january(), 3).is_empty());
    }

    #[test]
    fn empty_feed_yields_nothing() {
        assert!(find_gaps(&[], 1).is_empty());
    }

    #[test]
    fn zero_min_nights_counts_single_days() {
        let gaps = find_gaps(&[day("2030-01-01", 0), day("2030-01-02", 4)], 0);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].nights, 1);
    }

    #[test]
    fn unsorted_input_is_ordered_first() {
        let mut days = january();
        days.reverse();
        assert_eq!(find_gaps(&days, 2), find_gaps(&january(), 2));
    }

    #[test]
    fn malformed_day_inside_a_run_is_skipped_over() {
        let raw = vec![
            json!({"date": "2030-01-01", "roomsAvailable": 2}),
            json!({"date": "2030-01-02", "roomsAvailable": "n/a"}),
            json!({"date": "2030-01-03", "roomsAvailable": 2}),
        ];
        assert_eq!(
            find_gaps(&parse_days(&raw), 2),
            vec![AvailabilityGap {
                start_date: date("2030-01-01"),
                end_date: date("2030-01-03"),
                nights: 2,
                min_rooms_available: 2,
            }]
        );
    }

    #[test]
    fn only_sold_out_days_split_runs() {
        let days = [day("2030-01-01", 1), day("2030-01-02", 0), day("2030-01-04", 1), day("2030-01-07", 3)];
        let gaps = find_gaps(&days, 1);
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].end_date, date("2030-01-01"));
        assert_eq!(gaps[1].start_date, date("2030-01-04"));
        assert_eq!(gaps[1].end_date, date("2030-01-07"));
        assert_eq!(gaps[1].nights, 2);
    }

    #[test]
    fn duplicate_date_keeps_first_entry() {
        let days = [day("2030-01-01", 5), day("2030-01-01", 0), day("2030-01-02", 2)];
        let gaps = find_gaps(&days, 1);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].nights, 2);
        assert_eq!(gaps[0].min_rooms_available, 2);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let raw = vec![
            json!({"date": "2030-01-01", "roomsAvailable": 2}),
            json!({"date": "2030-01-02", "rooms_available": 1}),
            json!({"roomsAvailable": 4}),
            json!({"date": "01/03/2030", "roomsAvailable": 4}),
            json!({"date": "2030-01-04", "roomsAvailable": -1}),
            json!({"date": "2030-01-05", "roomsAvailable": "3"}),
            json!("2030-01-06"),
        ];
        assert_eq!(parse_days(&raw), vec![day("2030-01-01", 2), day("2030-01-02", 1)]);
    }

    #[test]
    fn gap_serializes_camel_case() {
        let gap = find_gaps(&january(), 2)[0];
        assert_eq!(
            serde_json::to_value(gap).unwrap(),
            json!({
                "startDate": "2030-01-01",
                "endDate": "2030-01-02",
                "nights": 2,
                "minRoomsAvailable": 1,
            })
        );
    }
}
