//! Checks and derived values for a day's charge/discharge schedule.
//!
//! Slots are keyed by their start time. Slot 1 always begins the day at
//! `00:00:00`; other slots left at midnight are unused placeholders and
//! take no part in duplicate detection.

use std::collections::{BTreeMap, BTreeSet};

use setpoint_proto::ScheduleSlot;
use time::macros::format_description;
use time::Time;

use crate::rows::{Row, RowValidator};

/// Ordinal of the slot that implicitly starts the day.
pub const FIRST_SLOT: i64 = 1;

/// Accepts `HH:MM:SS` and `HH:MM`.
pub fn parse_time_of_day(text: &str) -> Option<Time> {
    let text = text.trim();
    Time::parse(text, format_description!("[hour]:[minute]:[second]"))
        .or_else(|_| Time::parse(text, format_description!("[hour]:[minute]")))
        .ok()
}

pub fn format_time_of_day(time: Time) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        time.hour(),
        time.minute(),
        time.second()
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleValidator;

impl ScheduleValidator {
    /// Ids of rows that share a start time with another active row or whose
    /// start time does not parse.
    pub fn validate(&self, rows: &[Row<ScheduleSlot>]) -> BTreeSet<i64> {
        let mut invalid = BTreeSet::new();
        let mut by_time: BTreeMap<Time, Vec<&Row<ScheduleSlot>>> = BTreeMap::new();

        for row in rows {
            match parse_time_of_day(&row.local_value.start_time) {
                Some(time) => by_time.entry(time).or_default().push(row),
                None => {
                    invalid.insert(row.id);
                }
            }
        }

        for (time, group) in by_time {
            if group.len() < 2 {
                continue;
            }
            if time == Time::MIDNIGHT {
                let has_first = group.iter().any(|row| row.local_value.rec_no == FIRST_SLOT);
                if has_first {
                    invalid.extend(
                        group
                            .iter()
                            .filter(|row| row.local_value.rec_no != FIRST_SLOT)
                            .map(|row| row.id),
                    );
                }
            } else {
                invalid.extend(group.iter().map(|row| row.id));
            }
        }

        invalid
    }

    /// Orders rows by time of day. Rows whose time does not parse come first,
    /// ties fall back to ordinal and id.
    pub fn sort(&self, rows: &mut [Row<ScheduleSlot>]) {
        rows.sort_by_key(|row| {
            (
                parse_time_of_day(&row.local_value.start_time),
                row.local_value.rec_no,
                row.id,
            )
        });
    }

    /// End time shown for each row: the next distinct start time, wrapping to
    /// the earliest one at the end of the day. Unparseable rows get none.
    pub fn end_times(&self, rows: &[Row<ScheduleSlot>]) -> BTreeMap<i64, Time> {
        let parsed: Vec<(i64, Time)> = rows
            .iter()
            .filter_map(|row| parse_time_of_day(&row.local_value.start_time).map(|t| (row.id, t)))
            .collect();
        let distinct: BTreeSet<Time> = parsed.iter().map(|(_, time)| *time).collect();
        let Some(first) = distinct.iter().next().copied() else {
            return BTreeMap::new();
        };

        parsed
            .into_iter()
            .map(|(id, start)| {
                let end = distinct
                    .range((std::ops::Bound::Excluded(start), std::ops::Bound::Unbounded))
                    .next()
                    .copied()
                    .unwrap_or(first);
                (id, end)
            })
            .collect()
    }
}

impl RowValidator<ScheduleSlot> for ScheduleValidator {
    fn invalid_rows(&self, rows: &[Row<ScheduleSlot>]) -> BTreeSet<i64> {
        self.validate(rows)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use time::macros::time;

    use super::*;

    fn slot(rec_no: i64, start_time: &str) -> ScheduleSlot {
        ScheduleSlot {
            rec_no,
            start_time: start_time.to_string(),
            charge_from_grid: false,
            allow_to_sell: true,
            charge_power: 0.0,
            charge_limit: 100.0,
            discharge_power: 5.0,
            source: 0,
        }
    }

    fn row(id: i64, rec_no: i64, start_time: &str) -> Row<ScheduleSlot> {
        let value = slot(rec_no, start_time);
        Row {
            id,
            server_value: Some(value.clone()),
            local_value: value,
        }
    }

    fn sample() -> Vec<Row<ScheduleSlot>> {
        vec![
            row(10, 1, "00:00:00"),
            row(11, 2, "06:00:00"),
            row(12, 3, "09:00:00"),
            row(13, 4, "09:00"),
            row(14, 5, "00:00:00"),
            row(15, 6, "25:61"),
            row(16, 7, "18:30:00"),
            row(17, 8, "00:00:00"),
        ]
    }

    #[test]
    fn duplicate_times_flag_every_member() {
        let rows = vec![row(1, 2, "09:00:00"), row(2, 3, "09:00:00"), row(3, 4, "10:00:00")];
        let invalid = ScheduleValidator.validate(&rows);
        assert_eq!(invalid, BTreeSet::from([1, 2]));
    }

    #[test]
    fn first_slot_is_exempt_at_midnight() {
        let rows = vec![row(1, 1, "00:00:00"), row(2, 2, "00:00:00"), row(3, 3, "07:00:00")];
        assert_eq!(ScheduleValidator.validate(&rows), BTreeSet::from([2]));
    }

    #[test]
    fn midnight_placeholders_without_first_slot_are_inactive() {
        let rows = vec![row(1, 4, "00:00:00"), row(2, 5, "00:00:00"), row(3, 1, "05:00:00")];
        assert!(ScheduleValidator.validate(&rows).is_empty());
    }

    #[test]
    fn unparseable_times_are_always_flagged() {
        let rows = vec![row(1, 1, "00:00:00"), row(2, 2, "noon"), row(3, 3, "24:00:00")];
        assert_eq!(ScheduleValidator.validate(&rows), BTreeSet::from([2, 3]));
    }

    #[test]
    fn validation_uses_local_edits() {
        let mut rows = vec![row(1, 2, "08:00:00"), row(2, 3, "09:00:00")];
        rows[1].local_value.start_time = "08:00".into();
        assert_eq!(ScheduleValidator.validate(&rows), BTreeSet::from([1, 2]));
    }

    #[test_timeout::timeout(10)]
    fn validation_is_order_independent_and_idempotent() {
        let rows = sample();
        let expected = ScheduleValidator.validate(&rows);
        assert_eq!(expected, BTreeSet::from([12, 13, 14, 15, 17]));
        assert_eq!(ScheduleValidator.validate(&rows), expected);

        let mut rng = StdRng::seed_from_u64(0x5e7_901e);
        let mut shuffled = rows.clone();
        for _ in 0..200 {
            shuffled.shuffle(&mut rng);
            assert_eq!(ScheduleValidator.validate(&shuffled), expected);
        }
    }

    #[test]
    fn sort_puts_unparseable_first_then_by_time() {
        let mut rows = sample();
        ScheduleValidator.sort(&mut rows);
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        assert_eq!(ids, vec![15, 10, 14, 17, 11, 12, 13, 16]);
    }

    #[test]
    fn end_times_wrap_to_first_start() {
        let rows = vec![
            row(1, 1, "00:00:00"),
            row(2, 2, "06:00:00"),
            row(3, 3, "18:30"),
            row(4, 4, "bogus"),
        ];
        let ends = ScheduleValidator.end_times(&rows);
        assert_eq!(ends.get(&1), Some(&time!(6:00)));
        assert_eq!(ends.get(&2), Some(&time!(18:30)));
        assert_eq!(ends.get(&3), Some(&Time::MIDNIGHT));
        assert!(!ends.contains_key(&4));
        assert_eq!(format_time_of_day(time!(18:30)), "18:30:00");
    }

    #[test]
    fn parses_both_time_formats() {
        assert_eq!(parse_time_of_day("07:15"), Some(time!(7:15)));
        assert_eq!(parse_time_of_day(" 07:15:30 "), Some(time!(7:15:30)));
        assert_eq!(parse_time_of_day(""), None);
    }
}
