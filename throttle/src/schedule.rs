//! Daily time windows mapped to target read rates.
//!
//! A schedule is a short, human-authored list of windows such as "between 00:00 and 06:00 allow
//! 64 KiB/s". Lookups scan the list in insertion order and the first window that contains the
//! queried instant wins; an instant outside every window is unthrottled.

use std::num::NonZeroU64;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::instrument;

use crate::clock::Instant;
use crate::error::{Error, Result};

/// A recurring instant within a day.
///
/// There is no date component: comparisons always place the time-of-day on the calendar date of
/// the instant it is compared against. [`TimeOfDay::end_of_day`] (written `24:00`) lies after
/// every other time of the same day, so `HH:MM-24:00` windows reach midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(chrono::NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32, second: u32) -> Result<Self> {
        chrono::NaiveTime::from_hms_opt(hour, minute, second)
            .map(Self)
            .ok_or_else(|| {
                Error::invalid(format!(
                    "{hour:02}:{minute:02}:{second:02} is not a valid time of day"
                ))
            })
    }

    /// The end of the day, `24:00`. Only meaningful as a window end.
    pub fn end_of_day() -> Self {
        // last representable instant of the day, not a leap second
        Self(chrono::NaiveTime::MIN - chrono::TimeDelta::nanoseconds(1))
    }

    pub fn is_end_of_day(&self) -> bool {
        *self == Self::end_of_day()
    }

    /// This time-of-day placed on the same calendar date as `instant`.
    fn on_date_of(&self, instant: &Instant) -> Option<Instant> {
        instant
            .date_naive()
            .and_time(self.0)
            .and_local_timezone(*instant.offset())
            .single()
    }

    /// Today-at-this-time is strictly earlier than `instant`.
    pub fn is_before(&self, instant: &Instant) -> bool {
        self.on_date_of(instant).is_some_and(|today| today < *instant)
    }

    /// Today-at-this-time is strictly later than `instant`.
    pub fn is_after(&self, instant: &Instant) -> bool {
        self.on_date_of(instant).is_some_and(|today| today > *instant)
    }
}

impl std::str::FromStr for TimeOfDay {
    type Err = Error;
    /// Accepts `HH:MM` or `HH:MM:SS`, and `24:00` / `24:00:00` for the end of the day.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "24:00" || s == "24:00:00" {
            return Ok(Self::end_of_day());
        }
        chrono::NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| chrono::NaiveTime::parse_from_str(s, "%H:%M"))
            .map(Self)
            .map_err(|error| Error::invalid(format!("invalid time of day '{s}': {error}")))
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_end_of_day() {
            return write!(f, "24:00:00");
        }
        write!(f, "{}", self.0.format("%H:%M:%S"))
    }
}

/// Rate applicable at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRate {
    /// No window is active, reads are not throttled.
    Unlimited,
    BytesPerSecond(NonZeroU64),
}

impl std::fmt::Display for TargetRate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TargetRate::Unlimited => write!(f, "unlimited"),
            TargetRate::BytesPerSecond(rate) => {
                write!(f, "{}/s", bytesize::ByteSize(rate.get()))
            }
        }
    }
}

/// One daily window and the rate allowed inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    start: TimeOfDay,
    end: TimeOfDay,
    rate: NonZeroU64,
}

impl ScheduleEntry {
    /// Windows must not cross midnight: `start` has to be strictly earlier than `end`.
    pub fn new(start: TimeOfDay, end: TimeOfDay, rate_bytes_per_second: u64) -> Result<Self> {
        let rate = NonZeroU64::new(rate_bytes_per_second)
            .ok_or_else(|| Error::invalid("rate in bytes per second must be positive"))?;
        if start >= end {
            // overnight windows would compare against the wrong calendar date
            return Err(Error::invalid(format!(
                "window start {start} must be earlier than window end {end}, split windows crossing midnight in two"
            )));
        }
        Ok(Self { start, end, rate })
    }

    pub fn start(&self) -> TimeOfDay {
        self.start
    }

    pub fn end(&self) -> TimeOfDay {
        self.end
    }

    pub fn rate(&self) -> NonZeroU64 {
        self.rate
    }

    /// Both bounds are exclusive, so the exact instant `00:00:00.000` is never covered.
    pub fn matches(&self, instant: &Instant) -> bool {
        self.start.is_before(instant) && self.end.is_after(instant)
    }
}

impl std::fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}-{} {}",
            self.start,
            self.end,
            TargetRate::BytesPerSecond(self.rate)
        )
    }
}

/// Ordered, append-only collection of schedule windows.
///
/// Appends replace the entry list wholesale (copy-on-write) so lookups running on other threads
/// keep scanning their own snapshot and never hold the lock while doing so.
#[derive(Debug, Default)]
pub struct ScheduleTable {
    entries: RwLock<Arc<Vec<ScheduleEntry>>>,
}

impl ScheduleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ScheduleEntry>) -> Self {
        Self {
            entries: RwLock::new(Arc::new(entries.into_iter().collect())),
        }
    }

    /// Appends a window; the table is left unchanged on error.
    #[instrument(skip(self))]
    pub fn add_window(
        &self,
        start: TimeOfDay,
        end: TimeOfDay,
        rate_bytes_per_second: u64,
    ) -> Result<()> {
        let entry = ScheduleEntry::new(start, end, rate_bytes_per_second)?;
        self.push(entry);
        Ok(())
    }

    /// Same as [`ScheduleTable::add_window`] but for bounds that may be missing, e.g. coming from
    /// a partially filled configuration.
    pub fn try_add_window(
        &self,
        start: Option<TimeOfDay>,
        end: Option<TimeOfDay>,
        rate_bytes_per_second: u64,
    ) -> Result<()> {
        let start = start.ok_or_else(|| Error::invalid("window start cannot be empty"))?;
        let end = end.ok_or_else(|| Error::invalid("window end cannot be empty"))?;
        self.add_window(start, end, rate_bytes_per_second)
    }

    pub fn push(&self, entry: ScheduleEntry) {
        let mut guard = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut entries = Vec::with_capacity(guard.len() + 1);
        entries.extend_from_slice(guard.as_slice());
        entries.push(entry);
        *guard = Arc::new(entries);
        tracing::debug!("added schedule window: {}", entry);
    }

    /// Point-in-time copy of the windows, in lookup order.
    pub fn entries(&self) -> Arc<Vec<ScheduleEntry>> {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Rate of the first window containing `instant`, or [`TargetRate::Unlimited`].
    pub fn active_rate(&self, instant: &Instant) -> TargetRate {
        self.entries()
            .iter()
            .find(|entry| entry.matches(instant))
            .map_or(TargetRate::Unlimited, |entry| {
                TargetRate::BytesPerSecond(entry.rate)
            })
    }
}

impl std::fmt::Display for ScheduleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let entries = self.entries();
        if entries.is_empty() {
            return write!(f, "no windows (unlimited)");
        }
        for (idx, entry) in entries.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hour: u32, minute: u32, second: u32) -> Instant {
        chrono::NaiveDate::from_ymd_opt(2024, 3, 14)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
            .and_utc()
            .fixed_offset()
    }

    fn tod(hour: u32, minute: u32, second: u32) -> TimeOfDay {
        TimeOfDay::new(hour, minute, second).unwrap()
    }

    fn table() -> ScheduleTable {
        let table = ScheduleTable::new();
        table.add_window(tod(12, 0, 0), tod(18, 0, 0), 64 * 1024).unwrap();
        table.add_window(tod(0, 0, 0), tod(6, 0, 0), 64).unwrap();
        table
    }

    fn rate(value: u64) -> TargetRate {
        TargetRate::BytesPerSecond(NonZeroU64::new(value).unwrap())
    }

    #[test]
    fn returns_rate_of_the_window_in_effect() {
        let table = table();
        assert_eq!(table.active_rate(&at(15, 0, 0)), rate(65536));
        assert_eq!(table.active_rate(&at(4, 0, 0)), rate(64));
    }

    #[test]
    fn uncovered_time_is_unlimited() {
        let table = table();
        assert_eq!(table.active_rate(&at(9, 0, 0)), TargetRate::Unlimited);
        assert_eq!(
            ScheduleTable::new().active_rate(&at(9, 0, 0)),
            TargetRate::Unlimited
        );
    }

    #[test]
    fn window_bounds_are_exclusive() {
        let table = table();
        assert_eq!(table.active_rate(&at(12, 0, 0)), TargetRate::Unlimited);
        assert_eq!(table.active_rate(&at(12, 0, 1)), rate(65536));
        assert_eq!(table.active_rate(&at(17, 59, 59)), rate(65536));
        assert_eq!(table.active_rate(&at(18, 0, 0)), TargetRate::Unlimited);
    }

    #[test]
    fn first_matching_window_wins() {
        let table = ScheduleTable::new();
        table.add_window(tod(8, 0, 0), tod(20, 0, 0), 100).unwrap();
        table.add_window(tod(10, 0, 0), tod(12, 0, 0), 5).unwrap();
        assert_eq!(table.active_rate(&at(11, 0, 0)), rate(100));
    }

    #[test]
    fn rejects_non_positive_rate() {
        let table = table();
        let result = table.add_window(tod(7, 0, 0), tod(8, 0, 0), 0);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn rejects_missing_bounds() {
        let table = ScheduleTable::new();
        assert!(matches!(
            table.try_add_window(None, Some(tod(6, 0, 0)), 10),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.try_add_window(Some(tod(6, 0, 0)), None, 10),
            Err(Error::InvalidArgument(_))
        ));
        assert!(table.is_empty());
        table
            .try_add_window(Some(tod(1, 0, 0)), Some(tod(2, 0, 0)), 10)
            .unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rejects_windows_crossing_midnight() {
        let table = ScheduleTable::new();
        assert!(table.add_window(tod(22, 0, 0), tod(2, 0, 0), 10).is_err());
        assert!(table.add_window(tod(2, 0, 0), tod(2, 0, 0), 10).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn rejects_out_of_range_time_of_day() {
        assert!(TimeOfDay::new(24, 0, 0).is_err());
        assert!(TimeOfDay::new(0, 60, 0).is_err());
        assert!(TimeOfDay::new(23, 59, 59).is_ok());
    }

    #[test]
    fn time_of_day_compares_against_instant_date() {
        let noon = tod(12, 0, 0);
        assert!(noon.is_before(&at(13, 0, 0)));
        assert!(!noon.is_before(&at(12, 0, 0)));
        assert!(noon.is_after(&at(11, 59, 59)));
        assert!(!noon.is_after(&at(12, 0, 0)));
    }

    #[test]
    fn time_of_day_uses_the_instant_offset() {
        // 04:00 at +02:00 is 02:00 UTC, the window is evaluated in the instant's own zone
        let offset = chrono::FixedOffset::east_opt(2 * 3600).unwrap();
        let instant = chrono::NaiveDate::from_ymd_opt(2024, 3, 14)
            .unwrap()
            .and_hms_opt(4, 0, 0)
            .unwrap()
            .and_local_timezone(offset)
            .unwrap();
        assert_eq!(table().active_rate(&instant), rate(64));
    }

    #[test]
    fn end_of_day_closes_the_last_second() {
        let table = ScheduleTable::new();
        table
            .add_window(tod(0, 0, 0), TimeOfDay::end_of_day(), 10)
            .unwrap();
        let last_second = at(23, 59, 59) + chrono::TimeDelta::milliseconds(999);
        assert_eq!(table.active_rate(&last_second), rate(10));
        assert_eq!(table.active_rate(&at(23, 59, 59)), rate(10));
        assert_eq!(table.active_rate(&at(0, 0, 1)), rate(10));
        // exclusive start bound
        assert_eq!(table.active_rate(&at(0, 0, 0)), TargetRate::Unlimited);
        assert!(table.add_window(TimeOfDay::end_of_day(), tod(1, 0, 0), 10).is_err());
    }

    #[test]
    fn parses_end_of_day() {
        assert_eq!("24:00".parse::<TimeOfDay>().unwrap(), TimeOfDay::end_of_day());
        assert_eq!("24:00:00".parse::<TimeOfDay>().unwrap(), TimeOfDay::end_of_day());
        assert_eq!(TimeOfDay::end_of_day().to_string(), "24:00:00");
        assert!("24:00:01".parse::<TimeOfDay>().is_err());
        assert!(TimeOfDay::end_of_day() > tod(23, 59, 59));
        assert!(TimeOfDay::new(24, 0, 0).is_err());
    }

    #[test]
    fn parses_time_of_day() {
        assert_eq!("06:30".parse::<TimeOfDay>().unwrap(), tod(6, 30, 0));
        assert_eq!(" 23:15:42 ".parse::<TimeOfDay>().unwrap(), tod(23, 15, 42));
        assert!("25:00".parse::<TimeOfDay>().is_err());
        assert!("noon".parse::<TimeOfDay>().is_err());
        assert_eq!(tod(6, 5, 4).to_string(), "06:05:04");
    }

    #[test]
    fn snapshot_is_not_affected_by_later_appends() {
        let table = table();
        let snapshot = table.entries();
        table.add_window(tod(7, 0, 0), tod(8, 0, 0), 1).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn concurrent_lookups_while_appending() {
        let table = std::sync::Arc::new(ScheduleTable::new());
        table.add_window(tod(0, 0, 0), tod(6, 0, 0), 64).unwrap();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert_eq!(table.active_rate(&at(4, 0, 0)), rate(64));
                    }
                })
            })
            .collect();
        for hour in 7..20 {
            table.add_window(tod(hour, 0, 0), tod(hour, 30, 0), 1).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(table.len(), 14);
    }

    #[test]
    fn display_lists_windows() {
        assert_eq!(ScheduleTable::new().to_string(), "no windows (unlimited)");
        let shown = table().to_string();
        assert!(shown.starts_with("12:00:00-18:00:00"));
        assert!(shown.contains("\n00:00:00-06:00:00"));
    }
}
