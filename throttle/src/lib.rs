//! Schedule-driven bandwidth throttling for byte streams
//!
//! This crate shapes read throughput so that, averaged over time, it never exceeds a rate chosen
//! by a time-of-day schedule. It wraps any sequential byte source (file, socket, pipe) so the
//! consumer gets bandwidth shaping without changing how it reads.
//!
//! # Overview
//!
//! Two pieces cooperate:
//!
//! 1. **Schedule table** ([`ScheduleTable`]) - daily windows such as "00:00 to 06:00 at 64 KiB/s".
//!    The first window containing the current instant determines the target rate; outside every
//!    window reads are unlimited.
//! 2. **Average-rate throttler** ([`AverageRateThrottler`]) - counts bytes read since the first
//!    read and, before every read, pauses the caller until the cumulative average rate is back at
//!    or below the target.
//!
//! The stream decorators ([`ThrottledReader`], [`AsyncThrottledReader`]) call the throttler before
//! each read and notify it afterwards with the number of bytes actually read.
//!
//! # Usage Patterns
//!
//! ## Blocking reads
//!
//! ```rust,no_run
//! use std::io::Read;
//! use std::sync::Arc;
//! use throttle::{AverageRateThrottler, ScheduleTable, ThrottledReader, TimeOfDay};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let schedule = ScheduleTable::new();
//! // business hours: 1 MiB/s
//! schedule.add_window(TimeOfDay::new(9, 0, 0)?, TimeOfDay::new(17, 0, 0)?, 1024 * 1024)?;
//! let throttler = Arc::new(AverageRateThrottler::new(Arc::new(schedule)));
//!
//! let file = std::fs::File::open("/var/backups/data.tar")?;
//! let mut reader = ThrottledReader::new(file, throttler);
//! let mut contents = Vec::new();
//! reader.read_to_end(&mut contents)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Async reads with a deadline
//!
//! Readers that must not stall for long can set a maximum wait. When the required pause is longer
//! the read fails immediately with `ErrorKind::TimedOut` instead of sleeping:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use throttle::{ScheduleConfig, ThrottledReaderFactory};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ScheduleConfig::new(vec!["00:00-06:00=64KiB".parse()?]);
//! let factory = ThrottledReaderFactory::new(Arc::new(config.build_throttler()?))
//!     .with_max_wait(Some(Duration::from_secs(5)));
//!
//! let socket = tokio::net::TcpStream::connect("10.0.0.1:9000").await?;
//! let mut reader = factory.create_async(socket);
//! tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Rate Calculation
//!
//! With `total` bytes read since the first read at `t0` and a target rate `R`, the next read may
//! start at:
//!
//! ```text
//! t0 + total / R
//! ```
//!
//! The average is cumulative, not a sliding window: a burst is followed by a compensating pause
//! until the long-run average converges to `R`. When the schedule moves to another window the
//! next decision simply uses the new rate against the same totals.
//!
//! # Thread Safety
//!
//! A throttler can be shared by many readers (see [`ThrottledReaderFactory`]); they then share
//! one byte budget. Accounting uses atomics only, so concurrent decisions may act on slightly
//! stale totals and the average is only guaranteed to converge over time.
//!
//! # Failure Modes
//!
//! - [`Error::DeadlineExceeded`] - the pause would exceed the caller's max wait, nothing slept
//! - [`Error::Interrupted`] - the pause was interrupted (see [`InterruptibleSleeper`])
//! - [`Error::Unusable`] - the byte counter overflowed; the throttler refuses all further
//!   decisions (unless built with [`OverflowPolicy::Unthrottled`])

pub mod clock;
pub mod config;
pub mod error;
pub mod reader;
pub mod schedule;
pub mod sleeper;
pub mod throttler;

pub use clock::{Clock, Instant, ManualClock, SystemClock};
pub use config::{ScheduleConfig, WindowSpec, parse_rate};
pub use error::{Error, Result};
pub use reader::{AsyncThrottledReader, ThrottledReader, ThrottledReaderFactory};
pub use schedule::{ScheduleEntry, ScheduleTable, TargetRate, TimeOfDay};
pub use sleeper::{InterruptibleSleeper, Interrupter, Sleeper, ThreadSleeper};
pub use throttler::{AverageRateThrottler, OverflowPolicy, ReadThrottler};
