// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Retention slot schedule.
//!
//! A __slot schedule__ describes the retention ladder that every tracked file
//! in a safe climbs as it ages. The ladder is made of three runs of slots:
//! day slots, month slots, and year slots, in that order. Each slot has a
//! __maximum age__ in days. Once the copy occupying a slot grows older than
//! that maximum age, the slot becomes eligible to take a younger copy from
//! the slot below it.
//!
//! # Slot Labels
//!
//! Each slot is given a stable label made of its unit and its one-based
//! position inside that unit, e.g., "D-1", "D-2", "M-1", "Y-3". Labels are the
//! keys used when a file table is persisted, so they never change for a given
//! schedule.
//!
//! # Ceilings
//!
//! A finer unit must never reach into the span covered by the next coarser
//! unit, otherwise the maximum ages would stop ascending:
//!
//! - With month slots, there may be at most 29 day slots.
//! - With year slots but no month slots, there may be at most 359 day slots.
//! - With year slots, there may be at most 11 month slots.

use std::fmt::{Display, Formatter, Result as FmtResult};

/// Length of a month slot in days.
pub const DAYS_PER_MONTH: u32 = 30;

/// Length of a year slot in days.
pub const DAYS_PER_YEAR: u32 = 365;

/// Day ceiling implied by year slots when no month slots exist.
const DAYS_PER_YEAR_OF_MONTHS: u32 = 12 * DAYS_PER_MONTH;

/// Months allowed below a year slot.
const MONTHS_PER_YEAR: u32 = 12;

/// Ordered retention ladder of day, month, and year slots.
///
/// # Invariant
///
/// - Maximum ages strictly ascend across the whole ladder.
/// - Labels are unique.
/// - There is at least one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSchedule {
    days: u32,
    months: u32,
    years: u32,
    labels: Vec<String>,
    max_ages: Vec<u32>,
}

impl SlotSchedule {
    /// Construct new slot schedule.
    ///
    /// # Errors
    ///
    /// - Return [`ScheduleError::TooManyDays`] if day slots reach into the
    ///   span of the next coarser unit.
    /// - Return [`ScheduleError::TooManyMonths`] if month slots reach into the
    ///   span of a year slot.
    /// - Return [`ScheduleError::Empty`] if no slots are requested at all.
    /// - Return [`ScheduleError::AgeOverflow`] if the oldest slot of a unit
    ///   cannot have its maximum age represented.
    pub fn new(days: u32, months: u32, years: u32) -> Result<Self> {
        let day_limit = if months > 0 {
            Some(DAYS_PER_MONTH)
        } else if years > 0 {
            Some(DAYS_PER_YEAR_OF_MONTHS)
        } else {
            None
        };

        if let Some(limit) = day_limit {
            if days >= limit {
                return Err(ScheduleError::TooManyDays { days, limit });
            }
        }

        if years > 0 && months >= MONTHS_PER_YEAR {
            return Err(ScheduleError::TooManyMonths {
                months,
                limit: MONTHS_PER_YEAR,
            });
        }

        if days == 0 && months == 0 && years == 0 {
            return Err(ScheduleError::Empty);
        }

        let mut labels = Vec::new();
        let mut max_ages = Vec::new();
        for (unit, count, span) in [
            ('D', days, 1),
            ('M', months, DAYS_PER_MONTH),
            ('Y', years, DAYS_PER_YEAR),
        ] {
            // INVARIANT: The oldest slot of each unit must have a representable age.
            if count.checked_mul(span).is_none() {
                return Err(ScheduleError::AgeOverflow { unit, count });
            }

            for index in 1..=count {
                labels.push(format!("{unit}-{index}"));
                max_ages.push(index * span);
            }
        }

        Ok(Self {
            days,
            months,
            years,
            labels,
            max_ages,
        })
    }

    /// Number of slots in the whole ladder.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Schedules always hold at least one slot.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn days(&self) -> u32 {
        self.days
    }

    pub fn months(&self) -> u32 {
        self.months
    }

    pub fn years(&self) -> u32 {
        self.years
    }

    /// Maximum age in days of slot at `index`.
    ///
    /// # Panics
    ///
    /// - Will panic if `index` is out of bounds.
    pub fn max_age(&self, index: usize) -> u32 {
        self.max_ages[index]
    }

    /// Label of slot at `index`.
    ///
    /// # Panics
    ///
    /// - Will panic if `index` is out of bounds.
    pub fn label(&self, index: usize) -> &str {
        self.labels[index].as_str()
    }

    /// Find slot index of a label.
    pub fn position(&self, label: impl AsRef<str>) -> Option<usize> {
        self.labels.iter().position(|known| known == label.as_ref())
    }

    /// Iterate through slots from youngest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = Slot<'_>> + '_ {
        self.labels
            .iter()
            .zip(self.max_ages.iter())
            .enumerate()
            .map(|(index, (label, max_age))| Slot {
                index,
                label: label.as_str(),
                max_age: *max_age,
            })
    }
}

impl Display for SlotSchedule {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}d/{}m/{}y", self.days, self.months, self.years)
    }
}

/// Single slot view of a [`SlotSchedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot<'a> {
    pub index: usize,
    pub label: &'a str,
    pub max_age: u32,
}

/// Slot schedule error types.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Day slots reach into the span of a coarser unit.
    #[error("{days} day slots requested, but at most {max} are allowed", max = .limit - 1)]
    TooManyDays { days: u32, limit: u32 },

    /// Month slots reach into the span of a year slot.
    #[error("{months} month slots requested, but at most {max} are allowed", max = .limit - 1)]
    TooManyMonths { months: u32, limit: u32 },

    /// No slots requested.
    #[error("schedule must contain at least one slot")]
    Empty,

    /// Oldest slot of a unit would have a maximum age too large to represent.
    #[error("{count} '{unit}' slots push the maximum slot age out of range")]
    AgeOverflow { unit: char, count: u32 },
}

/// Friendly result alias :3
type Result<T, E = ScheduleError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case(1, 0, 0; "single day")]
    #[test_case(4, 3, 3; "small ladder")]
    #[test_case(29, 11, 9; "every ceiling touched")]
    #[test_case(359, 0, 2; "days straight into years")]
    #[test_case(400, 0, 0; "days only")]
    #[test_case(0, 40, 0; "months only")]
    #[test_case(0, 0, 5; "years only")]
    #[test]
    fn slot_schedule_valid_ladders(days: u32, months: u32, years: u32) {
        use pretty_assertions::assert_eq;

        let schedule = SlotSchedule::new(days, months, years).unwrap();
        assert_eq!(schedule.len(), (days + months + years) as usize);

        let ages = schedule.iter().map(|slot| slot.max_age).collect::<Vec<_>>();
        assert!(ages.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test_case(30, 12, 0, ScheduleError::TooManyDays { days: 30, limit: 30 }; "days past month")]
    #[test_case(360, 0, 1, ScheduleError::TooManyDays { days: 360, limit: 360 }; "days past year")]
    #[test_case(7, 12, 1, ScheduleError::TooManyMonths { months: 12, limit: 12 }; "months past year")]
    #[test_case(0, 0, 0, ScheduleError::Empty; "no slots")]
    #[test_case(0, 0, 12_000_000, ScheduleError::AgeOverflow { unit: 'Y', count: 12_000_000 }; "year ages overflow")]
    #[test_case(0, 150_000_000, 0, ScheduleError::AgeOverflow { unit: 'M', count: 150_000_000 }; "month ages overflow")]
    #[test]
    fn slot_schedule_rejects_bad_ladders(days: u32, months: u32, years: u32, expect: ScheduleError) {
        use pretty_assertions::assert_eq;

        let result = SlotSchedule::new(days, months, years);
        assert_eq!(result, Err(expect));
    }

    #[test]
    fn slot_schedule_labels_and_ages() {
        let schedule = SlotSchedule::new(2, 2, 2).unwrap();
        let result = schedule
            .iter()
            .map(|slot| (slot.label.to_string(), slot.max_age))
            .collect::<Vec<_>>();
        let expect = vec![
            ("D-1".to_string(), 1),
            ("D-2".to_string(), 2),
            ("M-1".to_string(), 30),
            ("M-2".to_string(), 60),
            ("Y-1".to_string(), 365),
            ("Y-2".to_string(), 730),
        ];
        assert_eq!(result, expect);
        assert_eq!(schedule.position("M-2"), Some(3));
        assert_eq!(schedule.position("W-1"), None);
        assert_eq!(schedule.to_string(), "2d/2m/2y");
    }
}
