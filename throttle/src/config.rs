//! Schedule configuration
//!
//! Windows are written as `START-END=RATE`, e.g. `00:00-06:00=64KiB`, where times are `HH:MM` or
//! `HH:MM:SS` and the rate (bytes per second) accepts the usual size suffixes.
//!
//! A schedule file is either JSON:
//!
//! ```json
//! {
//!   "windows": [
//!     { "start": "00:00", "end": "06:00", "rate": "64KiB" },
//!     { "start": "12:00", "end": "18:00", "rate": 1048576 }
//!   ],
//!   "overflow_policy": "fail-closed"
//! }
//! ```
//!
//! or plain text with one window per line, `#` starting a comment line.

use anyhow::Context;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::schedule::{ScheduleTable, TimeOfDay};
use crate::throttler::{AverageRateThrottler, OverflowPolicy};

/// Parses a rate such as `64`, `64KiB` or `1MB` into bytes per second.
pub fn parse_rate(s: &str) -> Result<u64> {
    s.trim()
        .parse::<bytesize::ByteSize>()
        .map(|size| size.as_u64())
        .map_err(|error| Error::invalid(format!("invalid rate '{}': {}", s.trim(), error)))
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RateValue {
    Bytes(u64),
    Text(String),
}

fn deserialize_rate<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    match RateValue::deserialize(deserializer)? {
        RateValue::Bytes(bytes) => Ok(bytes),
        RateValue::Text(text) => parse_rate(&text).map_err(serde::de::Error::custom),
    }
}

/// One configured window, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowSpec {
    #[serde(default)]
    pub start: Option<TimeOfDay>,
    #[serde(default)]
    pub end: Option<TimeOfDay>,
    #[serde(deserialize_with = "deserialize_rate")]
    pub rate: u64,
}

impl std::str::FromStr for WindowSpec {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let (times, rate) = s
            .split_once('=')
            .ok_or_else(|| Error::invalid(format!("window '{s}' must look like START-END=RATE")))?;
        let (start, end) = times
            .split_once('-')
            .ok_or_else(|| Error::invalid(format!("window '{s}' must look like START-END=RATE")))?;
        Ok(Self {
            start: Some(start.parse()?),
            end: Some(end.parse()?),
            rate: parse_rate(rate)?,
        })
    }
}

impl std::fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let show = |time: &Option<TimeOfDay>| time.map_or("?".to_string(), |t| t.to_string());
        write!(f, "{}-{}={}", show(&self.start), show(&self.end), self.rate)
    }
}

/// Everything needed to build a throttler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub windows: Vec<WindowSpec>,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

impl ScheduleConfig {
    pub fn new(windows: Vec<WindowSpec>) -> Self {
        Self {
            windows,
            overflow_policy: OverflowPolicy::default(),
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|error| Error::invalid(format!("invalid schedule: {error}")))
    }

    /// Parse the line-oriented format: one `START-END=RATE` window per line.
    pub fn parse_content(content: &str) -> anyhow::Result<Self> {
        let mut windows = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            // skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let window = line
                .parse::<WindowSpec>()
                .with_context(|| format!("line {}: invalid window", line_num + 1))?;
            windows.push(window);
        }
        Ok(Self::new(windows))
    }

    /// Load a schedule file, JSON if it starts with `{`, the line format otherwise.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schedule file: {path:?}"))?;
        let config = if content.trim_start().starts_with('{') {
            Self::from_json_str(&content)?
        } else {
            Self::parse_content(&content)?
        };
        config
            .validate()
            .with_context(|| format!("invalid schedule file: {path:?}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.to_table().map(|_| ())
    }

    /// Builds the table, stopping at the first invalid window.
    pub fn to_table(&self) -> Result<ScheduleTable> {
        let table = ScheduleTable::new();
        for window in &self.windows {
            table
                .try_add_window(window.start, window.end, window.rate)
                .map_err(|error| match error {
                    Error::InvalidArgument(message) => {
                        Error::InvalidArgument(format!("window {window}: {message}"))
                    }
                    other => other,
                })?;
        }
        Ok(table)
    }

    /// A throttler on the system clock using this schedule and overflow policy.
    pub fn build_throttler(&self) -> Result<AverageRateThrottler> {
        let table = self.to_table()?;
        Ok(AverageRateThrottler::new(Arc::new(table)).with_overflow_policy(self.overflow_policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::TargetRate;
    use std::num::NonZeroU64;

    fn tod(hour: u32, minute: u32) -> Option<TimeOfDay> {
        Some(TimeOfDay::new(hour, minute, 0).unwrap())
    }

    #[test]
    fn parses_rates_with_suffixes() {
        assert_eq!(parse_rate("64").unwrap(), 64);
        assert_eq!(parse_rate("64KiB").unwrap(), 64 * 1024);
        assert_eq!(parse_rate(" 2MiB ").unwrap(), 2 * 1024 * 1024);
        assert!(parse_rate("fast").is_err());
    }

    #[test]
    fn parses_window_spec() {
        let spec: WindowSpec = "00:00-06:00=64KiB".parse().unwrap();
        assert_eq!(
            spec,
            WindowSpec {
                start: tod(0, 0),
                end: tod(6, 0),
                rate: 65536,
            }
        );
        assert_eq!(spec.to_string(), "00:00:00-06:00:00=65536");
        let spec: WindowSpec = "12:00:30-18:00:00=100".parse().unwrap();
        assert_eq!(spec.start, Some(TimeOfDay::new(12, 0, 30).unwrap()));
        let spec: WindowSpec = "22:00-24:00=1KiB".parse().unwrap();
        assert_eq!(spec.end, Some(TimeOfDay::end_of_day()));
        assert_eq!(spec.to_string(), "22:00:00-24:00:00=1024");
    }

    #[test]
    fn rejects_malformed_window_spec() {
        assert!("00:00-06:00".parse::<WindowSpec>().is_err());
        assert!("00:00=64".parse::<WindowSpec>().is_err());
        assert!("00:00-26:00=64".parse::<WindowSpec>().is_err());
        assert!("00:00-06:00=lots".parse::<WindowSpec>().is_err());
    }

    #[test]
    fn json_config_builds_table() {
        let config = ScheduleConfig::from_json_str(
            r#"{
                "windows": [
                    { "start": "12:00", "end": "18:00", "rate": "64KiB" },
                    { "start": "00:00", "end": "06:00", "rate": 64 }
                ],
                "overflow_policy": "unthrottled"
            }"#,
        )
        .unwrap();
        assert_eq!(config.overflow_policy, OverflowPolicy::Unthrottled);
        let table = config.to_table().unwrap();
        assert_eq!(table.len(), 2);
        let instant = chrono::NaiveDate::from_ymd_opt(2024, 3, 14)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap()
            .and_utc()
            .fixed_offset();
        assert_eq!(
            table.active_rate(&instant),
            TargetRate::BytesPerSecond(NonZeroU64::new(65536).unwrap())
        );
    }

    #[test]
    fn missing_bound_is_reported_at_build_time() {
        let config =
            ScheduleConfig::from_json_str(r#"{ "windows": [ { "end": "06:00", "rate": 64 } ] }"#)
                .unwrap();
        match config.validate() {
            Err(Error::InvalidArgument(message)) => {
                assert!(message.contains("start cannot be empty"), "{message}");
            }
            other => panic!("expected invalid argument, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        assert!(ScheduleConfig::from_json_str(r#"{ "windowz": [] }"#).is_err());
        assert!(
            ScheduleConfig::from_json_str(
                r#"{ "windows": [ { "start": "1am", "end": "06:00", "rate": 64 } ] }"#
            )
            .is_err()
        );
        let zero_rate = ScheduleConfig::new(vec![WindowSpec {
            start: tod(1, 0),
            end: tod(2, 0),
            rate: 0,
        }]);
        assert!(zero_rate.build_throttler().is_err());
    }

    #[test]
    fn empty_config_is_unlimited() {
        let config = ScheduleConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.to_table().unwrap().is_empty());
    }

    #[test]
    fn line_format_skips_comments() {
        let config = ScheduleConfig::parse_content(
            "# nightly backup window\n\
             00:00-06:00=64KiB\n\
             \n\
             12:00-18:00=1MiB\n",
        )
        .unwrap();
        assert_eq!(config.windows.len(), 2);
        assert_eq!(config.windows[1].rate, 1024 * 1024);
        let error = ScheduleConfig::parse_content("00:00-06:00=64\nbogus\n").unwrap_err();
        assert!(format!("{error:#}").contains("line 2"));
    }

    #[test]
    fn loads_files_in_both_formats() {
        let dir = std::env::temp_dir().join(format!("rthrottle_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let json = dir.join("schedule.json");
        std::fs::write(
            &json,
            r#"{ "windows": [ { "start": "00:00", "end": "06:00", "rate": "1KiB" } ] }"#,
        )
        .unwrap();
        let text = dir.join("schedule.txt");
        std::fs::write(&text, "00:00-06:00=1KiB\n").unwrap();
        let from_json = ScheduleConfig::from_file(&json).unwrap();
        let from_text = ScheduleConfig::from_file(&text).unwrap();
        assert_eq!(from_json, from_text);
        let invalid = dir.join("invalid.txt");
        std::fs::write(&invalid, "06:00-01:00=1KiB\n").unwrap();
        assert!(ScheduleConfig::from_file(&invalid).is_err());
        assert!(ScheduleConfig::from_file(&dir.join("missing.txt")).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
