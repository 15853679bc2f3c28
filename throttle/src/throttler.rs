//! Cumulative average-rate throttling.
//!
//! [`AverageRateThrottler`] keeps the total number of bytes read and the instant of the first read.
//! Before every read it computes the instant at which the *cumulative* average since the first
//! read would equal the currently scheduled rate, and pauses the caller until then. Bursts are not
//! smoothed over a rolling window; they are followed by compensating pauses until the long-run
//! average converges to the target.
//!
//! # Concurrency
//!
//! A single throttler may govern many readers at once. All mutable state lives in atomics and no
//! lock is taken on the read path. The price is that a throttling decision may be based on a
//! slightly stale total (another thread's notification can land between loading the counter and
//! computing the pause). Such errors are bounded by one read's worth of bytes and are corrected
//! by the next decision, because the target is a long-run average rather than an instantaneous
//! rate.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use tracing::instrument;

use crate::clock::{Clock, Instant, SystemClock};
use crate::error::{Error, Result};
use crate::schedule::{ScheduleTable, TargetRate};
use crate::sleeper::{Interrupted, Sleeper, ThreadSleeper};

/// The seam between stream decorators and the rate-control algorithm.
pub trait ReadThrottler: Send + Sync {
    /// Records that `size` bytes were just read.
    fn notify_read(&self, size: u64);

    /// Decides, without pausing, how long the next read has to wait.
    ///
    /// `max_wait` of `None` means the caller is willing to wait as long as needed.
    fn check(&self, max_wait: Option<Duration>) -> Result<Duration>;

    /// Pauses the calling thread as long as needed before the next read.
    fn throttle(&self, max_wait: Option<Duration>) -> Result<()>;
}

impl<T: ReadThrottler + ?Sized> ReadThrottler for Arc<T> {
    fn notify_read(&self, size: u64) {
        (**self).notify_read(size)
    }

    fn check(&self, max_wait: Option<Duration>) -> Result<Duration> {
        (**self).check(max_wait)
    }

    fn throttle(&self, max_wait: Option<Duration>) -> Result<()> {
        (**self).throttle(max_wait)
    }
}

/// What happens once the byte counter can no longer represent the total read.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Refuse every further throttling decision with [`Error::Unusable`].
    #[default]
    FailClosed,
    /// Stop throttling and let all further reads through.
    Unthrottled,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-closed" | "failclosed" => Ok(OverflowPolicy::FailClosed),
            "unthrottled" => Ok(OverflowPolicy::Unthrottled),
            other => Err(Error::invalid(format!(
                "unknown overflow policy '{other}', expected 'fail-closed' or 'unthrottled'"
            ))),
        }
    }
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            OverflowPolicy::FailClosed => write!(f, "fail-closed"),
            OverflowPolicy::Unthrottled => write!(f, "unthrottled"),
        }
    }
}

const ACTIVE: u8 = 0;
const UNUSABLE: u8 = 1;
const UNTHROTTLED: u8 = 2;

const NO_READ_YET: i64 = i64::MIN;

/// Throttles reads so that the average rate since the first read stays at or below the rate
/// scheduled for the current time of day.
#[derive(Debug)]
pub struct AverageRateThrottler {
    schedule: Arc<ScheduleTable>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    overflow_policy: OverflowPolicy,
    total_bytes_read: AtomicU64,
    // epoch milliseconds, NO_READ_YET until the first notification
    first_read_ms: AtomicI64,
    state: AtomicU8,
}

impl AverageRateThrottler {
    pub fn new(schedule: Arc<ScheduleTable>) -> Self {
        Self {
            schedule,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(ThreadSleeper),
            overflow_policy: OverflowPolicy::default(),
            total_bytes_read: AtomicU64::new(0),
            first_read_ms: AtomicI64::new(NO_READ_YET),
            state: AtomicU8::new(ACTIVE),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[must_use]
    pub fn with_overflow_policy(mut self, overflow_policy: OverflowPolicy) -> Self {
        self.overflow_policy = overflow_policy;
        self
    }

    pub fn schedule(&self) -> &Arc<ScheduleTable> {
        &self.schedule
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read.load(Ordering::Acquire)
    }

    /// Instant of the first read notification, if any.
    pub fn first_read(&self) -> Option<Instant> {
        match self.first_read_ms.load(Ordering::Acquire) {
            NO_READ_YET => None,
            millis => chrono::DateTime::from_timestamp_millis(millis)
                .map(|utc| utc.with_timezone(self.clock.now().offset())),
        }
    }

    /// False once the byte counter overflowed under [`OverflowPolicy::FailClosed`]; permanent.
    pub fn is_usable(&self) -> bool {
        self.state.load(Ordering::Acquire) != UNUSABLE
    }

    pub fn notify_read(&self, size: u64) {
        if self.first_read_ms.load(Ordering::Acquire) == NO_READ_YET {
            let now_ms = self.clock.now().timestamp_millis();
            // first write wins, losing racers keep the earlier instant
            let _ = self.first_read_ms.compare_exchange(
                NO_READ_YET,
                now_ms,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        match self
            .total_bytes_read
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                total.checked_add(size)
            }) {
            Ok(previous) => tracing::trace!("read {} bytes, {} in total", size, previous + size),
            Err(total) => self.on_overflow(total, size),
        }
    }

    fn on_overflow(&self, total: u64, size: u64) {
        match self.overflow_policy {
            OverflowPolicy::FailClosed => {
                self.state.store(UNUSABLE, Ordering::Release);
                tracing::warn!(
                    "byte counter overflow ({} + {}), throttler is no longer usable",
                    total,
                    size
                );
            }
            OverflowPolicy::Unthrottled => {
                if self
                    .state
                    .compare_exchange(ACTIVE, UNTHROTTLED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::warn!(
                        "byte counter overflow ({} + {}), throttling disabled",
                        total,
                        size
                    );
                }
            }
        }
    }

    /// Pause needed before the next read so that the cumulative average rate does not exceed the
    /// active target rate.
    ///
    /// The counter and the first-read instant are loaded independently; under concurrent
    /// notifications the result may lag by the reads that are still in flight.
    pub fn sleep_time(&self) -> Duration {
        let total = self.total_bytes_read.load(Ordering::Acquire);
        if total == 0 {
            // no baseline to compute a rate from
            return Duration::ZERO;
        }
        let now = self.clock.now();
        let rate = match self.schedule.active_rate(&now) {
            TargetRate::Unlimited => return Duration::ZERO,
            TargetRate::BytesPerSecond(rate) => rate,
        };
        let first_read_ms = self.first_read_ms.load(Ordering::Acquire);
        if first_read_ms == NO_READ_YET {
            return Duration::ZERO;
        }
        // total / ((finish - first_read) / 1000) == rate
        let ideal_elapsed_ms = u128::from(total) * 1000 / u128::from(rate.get());
        let ideal_finish_ms =
            i128::from(first_read_ms) + i128::try_from(ideal_elapsed_ms).unwrap_or(i128::MAX);
        let remaining_ms = ideal_finish_ms.saturating_sub(i128::from(now.timestamp_millis()));
        if remaining_ms <= 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(u64::try_from(remaining_ms).unwrap_or(u64::MAX))
    }

    #[instrument(level = "trace", skip(self))]
    pub fn check(&self, max_wait: Option<Duration>) -> Result<Duration> {
        match self.state.load(Ordering::Acquire) {
            UNUSABLE => return Err(Error::Unusable),
            UNTHROTTLED => return Ok(Duration::ZERO),
            _ => {}
        }
        let required = self.sleep_time();
        if let Some(max_wait) = max_wait.filter(|max_wait| required > *max_wait) {
            tracing::debug!(
                "required pause {:?} exceeds max wait {:?}",
                required,
                max_wait
            );
            return Err(Error::DeadlineExceeded { required, max_wait });
        }
        Ok(required)
    }

    /// Blocks the calling thread until the next read may proceed.
    ///
    /// Fails without pausing when the throttler is unusable or when the required pause is longer
    /// than `max_wait`.
    pub fn throttle(&self, max_wait: Option<Duration>) -> Result<()> {
        let pause = self.check(max_wait)?;
        if pause.is_zero() {
            return Ok(());
        }
        tracing::debug!("throttling read for {:?}", pause);
        self.sleeper
            .sleep(pause)
            .map_err(|Interrupted| Error::Interrupted)
    }

    /// Same as [`AverageRateThrottler::throttle`] but suspends the current task instead of
    /// blocking the thread.
    pub async fn throttle_async(&self, max_wait: Option<Duration>) -> Result<()> {
        let pause = self.check(max_wait)?;
        if pause.is_zero() {
            return Ok(());
        }
        tracing::debug!("throttling read for {:?}", pause);
        tokio::time::sleep(pause).await;
        Ok(())
    }
}

impl ReadThrottler for AverageRateThrottler {
    fn notify_read(&self, size: u64) {
        AverageRateThrottler::notify_read(self, size)
    }

    fn check(&self, max_wait: Option<Duration>) -> Result<Duration> {
        AverageRateThrottler::check(self, max_wait)
    }

    fn throttle(&self, max_wait: Option<Duration>) -> Result<()> {
        AverageRateThrottler::throttle(self, max_wait)
    }
}
