//! Wall-clock access for the throttler.
//!
//! Schedules are expressed in local time-of-day, so the clock yields calendar instants rather than
//! monotonic ones. Tests inject a [`ManualClock`] to pin "now" to a deterministic value.

use std::sync::atomic::{AtomicI64, Ordering};

/// A calendar instant with its UTC offset.
pub type Instant = chrono::DateTime<chrono::FixedOffset>;

/// Source of the current instant.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// Local system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        chrono::Local::now().fixed_offset()
    }
}

/// A clock that only moves when told to.
///
/// Time is kept with millisecond resolution, the same resolution the throttler uses for its
/// arithmetic.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
    offset: chrono::FixedOffset,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
            offset: *start.offset(),
        }
    }

    /// Convenience constructor: the given date and time-of-day in UTC.
    ///
    /// Returns `None` if the components do not form a valid date and time.
    pub fn at_utc(date: chrono::NaiveDate, hour: u32, minute: u32, second: u32) -> Option<Self> {
        let naive = date.and_hms_opt(hour, minute, second)?;
        Some(Self::new(naive.and_utc().fixed_offset()))
    }

    pub fn set(&self, instant: Instant) {
        self.millis
            .store(instant.timestamp_millis(), Ordering::Release);
    }

    /// Moves the clock to the given time-of-day on its current date.
    pub fn set_time(&self, hour: u32, minute: u32, second: u32) {
        let current = self.now();
        if let Some(instant) = current
            .date_naive()
            .and_hms_opt(hour, minute, second)
            .and_then(|naive| naive.and_local_timezone(self.offset).single())
        {
            self.set(instant);
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        // the closure never rejects, so the update cannot fail
        let _ = self
            .millis
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(millis))
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let millis = self.millis.load(Ordering::Acquire);
        chrono::DateTime::from_timestamp_millis(millis)
            .unwrap_or_default()
            .with_timezone(&self.offset)
    }
}
