// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot schedules and the per-dataset firing cursor.
//!
//! A schedule spec is a comma-separated list of items:
//!
//! | Item | Meaning |
//! |------|---------|
//! | `HH:MM` | one instant per day |
//! | `HH:MM-HH:MM` | hourly instants from start to stop, inclusive |
//! | `HH:MM-HH:MM/4` | every 4 hours from start, plus the stop instant |
//! | `HH:MM-HH:MM/1:30` | every 90 minutes from start, plus the stop |
//! | `trigger` | fire when `<mountpoint>/.trigger` appears |
//!
//! [`MeterTime`] resolves the offsets into concrete instants for the current
//! local day and tracks a cursor: a call to [`MeterTime::do_run`] reports
//! due when any instant fell in `(cursor, now]`, then advances the cursor to
//! `now`. Several missed instants therefore collapse into a single firing,
//! and an instant never fires twice. The initial cursor sits a short
//! hysteresis before startup so an instant hit during process start is not
//! lost.

use crate::error::{EngineError, Result};
use crate::timeline::TRIGGER_FILENAME;
use chrono::{Datelike, Local, NaiveDate, TimeZone, Timelike};
use std::path::Path;
use tracing::{debug, info};

/// Cursor slack at startup, seconds.
pub const DEFAULT_HYSTERESIS_SECS: i64 = 15;

fn parse_offset(item: &str) -> Result<i64> {
    let invalid = || EngineError::ConfigInvalid(format!("invalid schedule time '{}'", item));
    let (hours, minutes) = item.split_once(':').ok_or_else(invalid)?;
    let hours: i64 = hours.parse().map_err(|_| invalid())?;
    let minutes: i64 = minutes.parse().map_err(|_| invalid())?;
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(invalid());
    }
    Ok(hours * 3600 + minutes * 60)
}

fn parse_step(step: &str) -> Result<i64> {
    let invalid = || EngineError::ConfigInvalid(format!("invalid schedule step '{}'", step));
    let seconds = match step.split_once(':') {
        Some((hours, minutes)) => {
            let hours: i64 = hours.parse().map_err(|_| invalid())?;
            let minutes: i64 = minutes.parse().map_err(|_| invalid())?;
            hours * 3600 + minutes * 60
        }
        None => step.parse::<i64>().map_err(|_| invalid())? * 3600,
    };
    if seconds <= 0 {
        return Err(invalid());
    }
    Ok(seconds)
}

/// Parsed schedule: second-of-day offsets plus the trigger flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    offsets: Vec<i64>,
    trigger: bool,
}

impl ScheduleSpec {
    /// Parse a schedule spec string.
    ///
    /// A stop before its start is rejected here, not at firing time.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut offsets = Vec::new();
        let mut trigger = false;
        for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if item == "trigger" {
                trigger = true;
                continue;
            }
            match item.split_once('-') {
                None => offsets.push(parse_offset(item)?),
                Some((start, rest)) => {
                    let (stop, step) = match rest.split_once('/') {
                        Some((stop, step)) => (stop, parse_step(step)?),
                        None => (rest, 3600),
                    };
                    let start = parse_offset(start)?;
                    let stop = parse_offset(stop)?;
                    if stop < start {
                        return Err(EngineError::ConfigInvalid(format!(
                            "schedule range '{}' ends before it starts",
                            item
                        )));
                    }
                    let mut next = start;
                    while next < stop {
                        offsets.push(next);
                        next += step;
                    }
                    offsets.push(stop);
                }
            }
        }
        if offsets.is_empty() && !trigger {
            return Err(EngineError::ConfigInvalid(format!(
                "empty schedule spec '{}'",
                spec
            )));
        }
        offsets.sort_unstable();
        offsets.dedup();
        Ok(Self { offsets, trigger })
    }

    pub fn is_trigger(&self) -> bool {
        self.trigger
    }

    /// Second-of-day offsets, ascending.
    pub fn offsets(&self) -> &[i64] {
        &self.offsets
    }
}

fn local_day(now: i64) -> (NaiveDate, i64) {
    let local = match Local.timestamp_opt(now, 0) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => {
            return (NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default(), now)
        }
    };
    let midnight = local
        .with_hour(0)
        .and_then(|dt| dt.with_minute(0))
        .and_then(|dt| dt.with_second(0))
        .and_then(|dt| dt.with_nanosecond(0))
        .map(|dt| dt.timestamp())
        .unwrap_or(now);
    (
        NaiveDate::from_ymd_opt(local.year(), local.month(), local.day()).unwrap_or_default(),
        midnight,
    )
}

/// Per-dataset firing state over a [`ScheduleSpec`].
#[derive(Debug, Clone)]
pub struct MeterTime {
    spec: ScheduleSpec,
    cursor: i64,
    day: NaiveDate,
    instants: Vec<i64>,
}

impl MeterTime {
    pub fn new(spec: ScheduleSpec, now: i64) -> Self {
        Self::with_hysteresis(spec, now, DEFAULT_HYSTERESIS_SECS)
    }

    pub fn with_hysteresis(spec: ScheduleSpec, now: i64, hysteresis: i64) -> Self {
        let (day, midnight) = local_day(now);
        let instants = spec.offsets.iter().map(|o| midnight + o).collect();
        Self {
            spec,
            cursor: now - hysteresis,
            day,
            instants,
        }
    }

    fn roll_day(&mut self, now: i64) {
        let (day, midnight) = local_day(now);
        if day != self.day {
            self.day = day;
            self.instants = self.spec.offsets.iter().map(|o| midnight + o).collect();
            debug!(day = %day, instants = self.instants.len(), "Schedule rolled to new day");
        }
    }

    /// Report whether the dataset is due at `now` and advance the cursor.
    ///
    /// In trigger mode the sentinel file under `mountpoint` is consumed
    /// first; absent that, the instants resolved for the current local day
    /// decide.
    pub fn do_run(&mut self, now: i64, mountpoint: &str) -> Result<bool> {
        self.roll_day(now);

        if self.spec.trigger {
            let path = Path::new(mountpoint).join(TRIGGER_FILENAME);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(mountpoint, "Consumed trigger file");
                    self.cursor = now;
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let due = self
            .instants
            .iter()
            .any(|&v| self.cursor < v && v <= now);
        self.cursor = now;
        Ok(due)
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> i64 {
        self.cursor
    }
}
