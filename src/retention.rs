// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retention schemas and snapshot expiry.
//!
//! A retention schema is a compact string such as `7d3w12m5y` or
//! `1k24h7d4w12m5y` describing how many snapshots to keep per time bucket:
//!
//! | Field | Unit | Bucket width |
//! |-------|------|--------------|
//! | `k`   | full-keep days | everything newer than `keep` days survives |
//! | `h`   | hours  | 1 h |
//! | `d`   | days   | 24 h |
//! | `w`   | weeks  | 168 h |
//! | `m`   | months | 720 h |
//! | `y`   | years  | 8760 h |
//!
//! Bucket boundaries form a staircase of cumulative hour offsets: with
//! `2h1d` the boundaries are 1, 2 and 26 hours. Each snapshot's age (hours
//! before the base time, which is local midnight minus the full-keep window)
//! selects the smallest boundary at or past it; one snapshot survives per
//! bucket, everything older than the last boundary is end-of-life.
//!
//! Expiry is split into a pure planning step ([`RetentionPlan::compute`])
//! and an effectful step ([`Cleaner::clean`]) that issues the destroys, so
//! the bucket arithmetic is testable without a storage engine.

use crate::command::CommandRunner;
use crate::error::{EngineError, Result};
use crate::timeline::{is_managed_label, SnapshotTimeline};
use crate::zfs::ZfsAdapter;
use chrono::{Local, TimeZone, Timelike};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

fn schema_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^((?P<keep>[0-9]+)k){0,1}((?P<hours>[0-9]+)h){0,1}(?P<days>[0-9]+)d(?P<weeks>[0-9]+)w(?P<months>[0-9]+)m(?P<years>[0-9]+)y$",
        )
        .expect("static pattern")
    })
}

/// Parsed retention schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSchema {
    /// Days of unconditional keep before the bucket staircase starts.
    pub keep: u32,
    pub hours: u32,
    pub days: u32,
    pub weeks: u32,
    pub months: u32,
    pub years: u32,
}

impl RetentionSchema {
    /// Parse a schema string such as `7d3w12m5y` or `1k24h7d4w12m5y`.
    pub fn parse(schema: &str) -> Result<Self> {
        let captures = schema_pattern().captures(schema).ok_or_else(|| {
            EngineError::ConfigInvalid(format!("invalid retention schema '{}'", schema))
        })?;
        let field = |name: &str| -> u32 {
            captures
                .name(name)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };
        Ok(Self {
            keep: field("keep"),
            hours: field("hours"),
            days: field("days"),
            weeks: field("weeks"),
            months: field("months"),
            years: field("years"),
        })
    }

    /// Cumulative bucket boundaries in hours, ascending.
    pub fn boundaries(&self) -> Vec<i64> {
        let mut boundaries = Vec::with_capacity(
            (self.hours + self.days + self.weeks + self.months + self.years) as usize,
        );
        let mut offset: i64 = 0;
        let mut stair = |count: u32, step: i64, out: &mut Vec<i64>| {
            for _ in 0..count {
                offset += step;
                out.push(offset);
            }
        };
        stair(self.hours, 1, &mut boundaries);
        stair(self.days, 24, &mut boundaries);
        stair(self.weeks, 168, &mut boundaries);
        stair(self.months, 720, &mut boundaries);
        stair(self.years, 8760, &mut boundaries);
        boundaries
    }

    /// Base time ages are measured from: local midnight of `now`, pushed
    /// back by the full-keep window.
    pub fn base_time(&self, now: i64) -> i64 {
        let local = match Local.timestamp_opt(now, 0) {
            chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
            chrono::LocalResult::None => return now,
        };
        let midnight = local
            .with_hour(0)
            .and_then(|dt| dt.with_minute(0))
            .and_then(|dt| dt.with_second(0))
            .and_then(|dt| dt.with_nanosecond(0))
            .map(|dt| dt.timestamp())
            .unwrap_or(now);
        midnight - i64::from(self.keep) * 86_400
    }
}

impl fmt::Display for RetentionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.keep > 0 {
            write!(f, "{}k", self.keep)?;
        }
        if self.hours > 0 {
            write!(f, "{}h", self.hours)?;
        }
        write!(
            f,
            "{}d{}w{}m{}y",
            self.days, self.weeks, self.months, self.years
        )
    }
}

/// Pure result of applying a schema to a timeline at one instant.
#[derive(Debug, Clone, Default)]
pub struct RetentionPlan {
    /// Whether at least one snapshot is newer than the base time.
    pub fresh: bool,
    /// Labels to destroy, in bucket order then end-of-life.
    pub destroy: Vec<String>,
}

impl RetentionPlan {
    /// Bucket every snapshot and decide which ones expire.
    ///
    /// Foreign (non-timestamp) labels are outside the policy and skipped
    /// entirely unless `clean_all` is set. Per bucket the snapshot with the
    /// greatest age survives (first one wins a tie); snapshots older than
    /// every boundary are end-of-life and always expire. Snapshots at or
    /// newer than the base time are fresh and never considered.
    pub fn compute(
        schema: &RetentionSchema,
        timeline: &SnapshotTimeline,
        now: i64,
        clean_all: bool,
    ) -> Self {
        let base = schema.base_time(now);
        let boundaries = schema.boundaries();
        let mut buckets: Vec<Vec<(i64, &str)>> = vec![Vec::new(); boundaries.len()];
        let mut end_of_life: Vec<String> = Vec::new();
        let mut fresh = false;

        for record in timeline.iter() {
            if !clean_all && !is_managed_label(&record.label) {
                continue;
            }
            let age = (base - record.creation) / 3600;
            if age <= 0 {
                fresh = true;
                continue;
            }
            match boundaries.iter().position(|&b| b >= age) {
                Some(at) => buckets[at].push((age, &record.label)),
                None => end_of_life.push(record.label.clone()),
            }
        }

        let mut destroy = Vec::new();
        for bucket in &buckets {
            let mut keeper: Option<i64> = None;
            for &(age, label) in bucket {
                // The running maximum is replaced silently; only snapshots
                // that never held it expire.
                match keeper {
                    Some(max) if age > max => keeper = Some(age),
                    Some(_) => destroy.push(label.to_string()),
                    None => keeper = Some(age),
                }
            }
        }
        destroy.extend(end_of_life);

        Self { fresh, destroy }
    }
}

/// Issues the destroys a [`RetentionPlan`] calls for.
pub struct Cleaner<R: CommandRunner> {
    zfs: ZfsAdapter<R>,
}

impl<R: CommandRunner> Cleaner<R> {
    pub fn new(zfs: ZfsAdapter<R>) -> Self {
        Self { zfs }
    }

    /// Expire snapshots on one endpoint, mutating the in-memory timeline to
    /// match.
    ///
    /// Only managed timestamp snapshots fall under the policy; `clean_all`
    /// extends it to foreign snapshots too. With no fresh snapshot present,
    /// nothing is destroyed: an engine that has stopped taking snapshots
    /// must not eat its remaining history. Held snapshots are logged and
    /// skipped. A destroy failure propagates; destroys already issued
    /// stand, and the failed snapshot stays in the timeline.
    ///
    /// Returns whether anything was destroyed.
    pub async fn clean(
        &self,
        dataset: &str,
        endpoint: &str,
        timeline: &mut SnapshotTimeline,
        schema: &RetentionSchema,
        clean_all: bool,
        now: i64,
        log_command: bool,
    ) -> Result<bool> {
        let plan = RetentionPlan::compute(schema, timeline, now, clean_all);
        if plan.destroy.is_empty() {
            return Ok(false);
        }
        if !plan.fresh {
            warn!(
                dataset,
                candidates = plan.destroy.len(),
                "No fresh snapshot present, refusing to destroy anything"
            );
            return Ok(false);
        }

        let mut destroyed = 0usize;
        for label in &plan.destroy {
            if self.zfs.is_held(dataset, label, endpoint, log_command).await? {
                info!(dataset, label = %label, "Snapshot is held, skipping destroy");
                continue;
            }
            self.zfs.destroy(dataset, label, endpoint, log_command).await?;
            timeline.remove(label);
            crate::metrics::record_snapshot_destroyed();
            debug!(dataset, label = %label, "Destroyed expired snapshot");
            destroyed += 1;
        }
        if destroyed > 0 {
            info!(dataset, destroyed, "Retention pass complete");
        }
        Ok(destroyed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScriptedRunner;
    use crate::timeline::{format_label, SnapshotRecord};
    use std::sync::Arc;

    fn schema(s: &str) -> RetentionSchema {
        RetentionSchema::parse(s).unwrap()
    }

    /// Managed label of the snapshot aged `age` hours at `base`.
    fn label(base: i64, age: i64) -> String {
        format_label(base - age * 3600)
    }

    fn timeline_at_ages(base: i64, ages_hours: &[i64]) -> SnapshotTimeline {
        ages_hours
            .iter()
            .map(|&age| SnapshotRecord::new(label(base, age), base - age * 3600))
            .collect()
    }

    #[test]
    fn test_parse_full_schema() {
        let s = schema("1k24h7d4w12m5y");
        assert_eq!(s.keep, 1);
        assert_eq!(s.hours, 24);
        assert_eq!(s.days, 7);
        assert_eq!(s.weeks, 4);
        assert_eq!(s.months, 12);
        assert_eq!(s.years, 5);
    }

    #[test]
    fn test_parse_minimal_schema() {
        let s = schema("7d3w12m5y");
        assert_eq!(s.keep, 0);
        assert_eq!(s.hours, 0);
        assert_eq!(s.days, 7);
        assert_eq!(s.years, 5);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RetentionSchema::parse("7x").is_err());
        assert!(RetentionSchema::parse("7d3w").is_err()); // missing m/y
        assert!(RetentionSchema::parse("").is_err());
        assert!(RetentionSchema::parse("24h7d4w12m5yextra").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["7d3w12m5y", "1k24h7d4w12m5y", "2h1d0w0m0y"] {
            assert_eq!(schema(s).to_string(), s);
        }
    }

    #[test]
    fn test_boundaries_staircase() {
        let s = schema("2h2d1w1m1y");
        assert_eq!(
            s.boundaries(),
            vec![1, 2, 26, 50, 218, 938, 9698]
        );
    }

    #[test]
    fn test_base_time_is_local_midnight_minus_keep() {
        let s = schema("2k0d0w0m1y");
        let now = 1_767_268_800; // some mid-day instant
        let base = s.base_time(now);
        let plain = schema("0d0w0m1y").base_time(now);
        assert_eq!(plain - base, 2 * 86_400);
        // Midnight rounding: the base is on a whole hour at least.
        assert_eq!(base % 3600, 0);
    }

    #[test]
    fn test_plan_keeps_oldest_per_bucket() {
        let s = schema("0h2d0w0m0y"); // boundaries: 24, 48
        let base = s.base_time(1_767_268_800);
        // Ages 3 and 20 share the first bucket; 30 and 40 share the second.
        let timeline = timeline_at_ages(base, &[40, 30, 20, 3]);
        let plan = RetentionPlan::compute(&s, &timeline, 1_767_268_800, false);
        // Oldest in each bucket survives: 40 and 20.
        assert_eq!(plan.destroy, vec![label(base, 3), label(base, 30)]);
    }

    #[test]
    fn test_plan_end_of_life_expires() {
        let s = schema("0h1d0w0m0y"); // single boundary at 24
        let base = s.base_time(1_767_268_800);
        let timeline = timeline_at_ages(base, &[100, 10]);
        let plan = RetentionPlan::compute(&s, &timeline, 1_767_268_800, false);
        assert_eq!(plan.destroy, vec![label(base, 100)]);
    }

    #[test]
    fn test_plan_fresh_flag() {
        let s = schema("0h1d0w0m0y");
        let base = s.base_time(1_767_268_800);
        let stale = timeline_at_ages(base, &[10]);
        assert!(!RetentionPlan::compute(&s, &stale, 1_767_268_800, false).fresh);

        let fresh = timeline_at_ages(base, &[10, -2]);
        assert!(RetentionPlan::compute(&s, &fresh, 1_767_268_800, false).fresh);

        // A fresh foreign snapshot is outside the policy and does not
        // satisfy the valve.
        let mut foreign = timeline_at_ages(base, &[10]);
        foreign.insert(SnapshotRecord::new("nightly-dump", base + 3600));
        assert!(!RetentionPlan::compute(&s, &foreign, 1_767_268_800, false).fresh);
    }

    #[test]
    fn test_plan_destroy_order_buckets_then_end_of_life() {
        let s = schema("0h2d0w0m0y"); // boundaries 24, 48
        let base = s.base_time(1_767_268_800);
        let timeline = timeline_at_ages(base, &[100, 40, 30, 20, 3]);
        let plan = RetentionPlan::compute(&s, &timeline, 1_767_268_800, false);
        // Bucket expiries (ascending boundary) come before end-of-life.
        assert_eq!(
            plan.destroy,
            vec![label(base, 3), label(base, 30), label(base, 100)]
        );
    }

    #[test]
    fn test_plan_skips_foreign_labels_unless_clean_all() {
        let s = schema("0h1d0w0m0y"); // single boundary at 24
        let base = s.base_time(1_767_268_800);
        let mut timeline = timeline_at_ages(base, &[100, -1]);
        timeline.insert(SnapshotRecord::new("before-upgrade", base - 9000 * 3600));

        let plan = RetentionPlan::compute(&s, &timeline, 1_767_268_800, false);
        assert_eq!(plan.destroy, vec![label(base, 100)]);

        // clean_all pulls foreign snapshots into the policy; both are past
        // the only boundary, oldest first.
        let plan = RetentionPlan::compute(&s, &timeline, 1_767_268_800, true);
        assert_eq!(
            plan.destroy,
            vec!["before-upgrade".to_string(), label(base, 100)]
        );
    }

    #[test]
    fn test_plan_idempotent() {
        let s = schema("0h3d1w0m0y");
        let now = 1_767_268_800;
        let base = s.base_time(now);
        let mut timeline = timeline_at_ages(base, &[200, 150, 100, 70, 40, 30, 10, -1]);
        let plan = RetentionPlan::compute(&s, &timeline, now, false);
        for label in &plan.destroy {
            timeline.remove(label);
        }
        let again = RetentionPlan::compute(&s, &timeline, now, false);
        assert!(again.destroy.is_empty());
    }

    #[tokio::test]
    async fn test_clean_destroys_and_updates_timeline() {
        let runner = Arc::new(ScriptedRunner::new());
        let cleaner = Cleaner::new(ZfsAdapter::new(runner.clone()));
        let s = schema("0h1d0w0m0y");
        let now = 1_767_268_800;
        let base = s.base_time(now);
        let mut timeline = timeline_at_ages(base, &[100, 10, -1]);

        let changed = cleaner
            .clean("tank/data", "", &mut timeline, &s, false, now, false)
            .await
            .unwrap();
        assert!(changed);
        assert!(!timeline.contains(&label(base, 100)));
        assert_eq!(
            runner.count_containing(&format!("zfs destroy tank/data@{}", label(base, 100))),
            1
        );
    }

    #[tokio::test]
    async fn test_clean_safety_valve_blocks_destroys() {
        let runner = Arc::new(ScriptedRunner::new());
        let cleaner = Cleaner::new(ZfsAdapter::new(runner.clone()));
        let s = schema("0h1d0w0m0y");
        let now = 1_767_268_800;
        let base = s.base_time(now);
        let mut timeline = timeline_at_ages(base, &[100, 10]);

        let changed = cleaner
            .clean("tank/data", "", &mut timeline, &s, false, now, false)
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(runner.count_containing("zfs destroy"), 0);
        assert_eq!(timeline.len(), 2);
    }

    #[tokio::test]
    async fn test_clean_leaves_foreign_snapshots_alone() {
        let runner = Arc::new(ScriptedRunner::new());
        let cleaner = Cleaner::new(ZfsAdapter::new(runner.clone()));
        let s = schema("0h1d0w0m0y");
        let now = 1_767_268_800;
        let base = s.base_time(now);
        // An ancient manual snapshot next to a fresh managed one.
        let mut timeline = timeline_at_ages(base, &[-1]);
        timeline.insert(SnapshotRecord::new("before-upgrade", base - 9000 * 3600));

        let changed = cleaner
            .clean("tank/data", "", &mut timeline, &s, false, now, false)
            .await
            .unwrap();
        assert!(!changed);
        assert!(timeline.contains("before-upgrade"));
        assert_eq!(runner.count_containing("zfs destroy"), 0);
    }

    #[tokio::test]
    async fn test_clean_all_expires_foreign_snapshots() {
        let runner = Arc::new(ScriptedRunner::new());
        let cleaner = Cleaner::new(ZfsAdapter::new(runner.clone()));
        let s = schema("0h1d0w0m0y");
        let now = 1_767_268_800;
        let base = s.base_time(now);
        let mut timeline = timeline_at_ages(base, &[-1]);
        timeline.insert(SnapshotRecord::new("before-upgrade", base - 9000 * 3600));

        let changed = cleaner
            .clean("tank/data", "", &mut timeline, &s, true, now, false)
            .await
            .unwrap();
        assert!(changed);
        assert!(!timeline.contains("before-upgrade"));
        assert_eq!(
            runner.count_containing("zfs destroy tank/data@before-upgrade"),
            1
        );
    }

    #[tokio::test]
    async fn test_clean_skips_held_snapshots() {
        let s = schema("0h1d0w0m0y");
        let now = 1_767_268_800;
        let base = s.base_time(now);
        let stale = label(base, 100);
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            &format!("zfs holds tank/data@{}", stale),
            &format!("tank/data@{}\tzsm\tdate\n", stale),
        );
        let cleaner = Cleaner::new(ZfsAdapter::new(runner.clone()));
        let mut timeline = timeline_at_ages(base, &[100, -1]);

        let changed = cleaner
            .clean("tank/data", "", &mut timeline, &s, false, now, false)
            .await
            .unwrap();
        assert!(!changed);
        assert!(timeline.contains(&stale));
        assert_eq!(runner.count_containing("zfs destroy"), 0);
    }

    #[tokio::test]
    async fn test_clean_destroy_failure_keeps_record_in_timeline() {
        let s = schema("0h1d0w0m0y");
        let now = 1_767_268_800;
        let base = s.base_time(now);
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail(
            &format!("zfs destroy tank/data@{}", label(base, 100)),
            1,
            "dataset is busy",
        );
        let cleaner = Cleaner::new(ZfsAdapter::new(runner.clone()));
        let mut timeline = timeline_at_ages(base, &[200, 100, -1]);

        let err = cleaner
            .clean("tank/data", "", &mut timeline, &s, false, now, false)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        // The first destroy succeeded and is reflected; the failed one left
        // its record in place, still matching the on-disk state.
        assert!(!timeline.contains(&label(base, 200)));
        assert!(timeline.contains(&label(base, 100)));
    }
}
