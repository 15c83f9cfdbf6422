//! Calendar windows used by the analysis engine.
//!
//! All windows are inclusive `[start, end]` date ranges derived from a single
//! reference "today". Both the figures and their display labels come from the
//! same [`Windows`] value, so they cannot drift apart.

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::Serialize;

use crate::model::DateRanges;

/// Length of each rolling window, in days.
pub const ROLLING_WINDOW_DAYS: u64 = 30;

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Whether the range contains no days at all.
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Number of days in the range (0 when empty).
    pub fn len_days(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start).num_days() as u64 + 1
        }
    }

    /// Label like `Mar 1 - Mar 15`.
    pub fn label(&self) -> String {
        format!(
            "{} - {}",
            self.start.format("%b %-d"),
            self.end.format("%b %-d")
        )
    }
}

/// Every window the analysis engine compares, for one reference day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Windows {
    pub today: NaiveDate,
    pub yesterday: NaiveDate,
    /// First of the current month through today.
    pub month_to_date: DateWindow,
    /// First of last month through the same day-of-month, clamped to the
    /// length of last month.
    pub last_month_to_date: DateWindow,
    /// Last fully completed calendar month.
    pub last_month: DateWindow,
    /// The calendar month before `last_month`.
    pub month_before_last: DateWindow,
    /// The 30 days ending yesterday.
    pub rolling_30: DateWindow,
    /// The 30 days immediately before `rolling_30`.
    pub previous_30: DateWindow,
}

impl Windows {
    pub fn for_today(today: NaiveDate) -> Self {
        let month_start = first_of_month(today);
        let last_month_start = shift_months_back(month_start, 1);
        let last_month_end = day_before(month_start);
        let month_before_last_start = shift_months_back(month_start, 2);
        let month_before_last_end = day_before(last_month_start);

        let same_day = today.day().min(last_month_end.day());
        let last_month_same_day = last_month_start
            .with_day(same_day)
            .unwrap_or(last_month_end);

        let yesterday = day_before(today);
        let rolling_start = yesterday - Days::new(ROLLING_WINDOW_DAYS - 1);
        let previous_end = day_before(rolling_start);
        let previous_start = previous_end - Days::new(ROLLING_WINDOW_DAYS - 1);

        Self {
            today,
            yesterday,
            month_to_date: DateWindow::new(month_start, today),
            last_month_to_date: DateWindow::new(last_month_start, last_month_same_day),
            last_month: DateWindow::new(last_month_start, last_month_end),
            month_before_last: DateWindow::new(month_before_last_start, month_before_last_end),
            rolling_30: DateWindow::new(rolling_start, yesterday),
            previous_30: DateWindow::new(previous_start, previous_end),
        }
    }

    /// Display labels for the four comparison windows.
    pub fn date_ranges(&self) -> DateRanges {
        DateRanges {
            mtd: self.month_to_date.label(),
            last_month_to_date: self.last_month_to_date.label(),
            rolling_30: self.rolling_30.label(),
            previous_30: self.previous_30.label(),
        }
    }

    /// Label for the full-month comparison, e.g. `February vs January`.
    pub fn full_month_label(&self) -> String {
        format!(
            "{} vs {}",
            self.last_month.start.format("%B"),
            self.month_before_last.start.format("%B")
        )
    }
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn day_before(date: NaiveDate) -> NaiveDate {
    date.pred_opt().unwrap_or(date)
}

fn shift_months_back(month_start: NaiveDate, months: u32) -> NaiveDate {
    month_start
        .checked_sub_months(Months::new(months))
        .unwrap_or(month_start)
}
