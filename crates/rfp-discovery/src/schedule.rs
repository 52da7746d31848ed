use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

use crate::source::DateRange;

/// Which posted-date window a trigger searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchWindow {
    /// Previous business window: yesterday, or Friday through Sunday on Monday.
    Production,
    /// Today only.
    Test,
    /// The `n` days ending yesterday.
    DaysBack(u32),
}

/// `None` means there is nothing to search today (Sunday in production mode; Saturday and
/// Sunday postings are picked up on Monday).
pub fn search_range(today: NaiveDate, window: SearchWindow) -> Option<DateRange> {
    let yesterday = today.checked_sub_days(Days::new(1))?;
    match window {
        SearchWindow::Test => Some(DateRange::single(today)),
        SearchWindow::DaysBack(n) => Some(DateRange {
            from: today.checked_sub_days(Days::new(u64::from(n.max(1))))?,
            to: yesterday,
        }),
        SearchWindow::Production => match today.weekday() {
            Weekday::Sun => None,
            Weekday::Mon => Some(DateRange {
                from: today.checked_sub_days(Days::new(3))?,
                to: yesterday,
            }),
            _ => Some(DateRange::single(yesterday)),
        },
    }
}

/// Next occurrence of `run_at` strictly after `now`.
pub fn next_run_after(now: NaiveDateTime, run_at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(run_at);
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}
