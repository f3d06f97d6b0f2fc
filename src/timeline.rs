// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ordered snapshot timelines.
//!
//! A [`SnapshotTimeline`] is the in-memory view of one dataset's snapshots
//! on one endpoint, ordered by creation time. The ordering invariant is
//! enforced by the container: [`SnapshotTimeline::insert`] places records at
//! their creation-sorted position, so scanning the timeline is always a walk
//! from oldest to newest.
//!
//! Timelines are mutated in exactly three places: snapshot creation
//! (append), replication apply (mirror records from the peer), and retention
//! destroy (remove by label).

use chrono::{Local, TimeZone};
use regex::Regex;
use std::sync::OnceLock;

/// strftime-style format of managed snapshot labels.
pub const LABEL_FORMAT: &str = "%Y%m%d%H%M";

/// Sentinel file consumed by trigger-mode schedules.
pub const TRIGGER_FILENAME: &str = ".trigger";

fn managed_label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{4})(1[0-2]|0[1-9])(0[1-9]|[1-2]\d|3[0-1])(([0-1]\d|2[0-3])([0-5]\d)){0,1}$")
            .expect("static pattern")
    })
}

/// Check whether a snapshot name is one of ours (a timestamp label).
///
/// Foreign snapshots (manual `zfs snapshot`, other tools) do not match and
/// are skipped by retention and replication unless `all_snapshots` is set.
pub fn is_managed_label(name: &str) -> bool {
    managed_label_pattern().is_match(name)
}

/// Render a creation epoch as a managed snapshot label (local time).
pub fn format_label(creation: i64) -> String {
    match Local.timestamp_opt(creation, 0) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.format(LABEL_FORMAT).to_string()
        }
        chrono::LocalResult::None => String::new(),
    }
}

/// One snapshot on one endpoint.
///
/// Immutable once created; `held` is derived by querying the storage engine
/// at the point of use, never persisted here as authoritative state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Snapshot name after the `@` (timestamp label for managed snapshots).
    pub label: String,
    /// Creation time, UNIX epoch seconds.
    pub creation: i64,
    /// Whether the storage engine reported a hold on this snapshot.
    pub held: bool,
}

impl SnapshotRecord {
    pub fn new(label: impl Into<String>, creation: i64) -> Self {
        Self {
            label: label.into(),
            creation,
            held: false,
        }
    }
}

/// Ordered sequence of snapshot records for one (dataset, endpoint) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotTimeline {
    records: Vec<SnapshotRecord>,
}

impl SnapshotTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert a record at its creation-ordered position.
    ///
    /// If a record with the same label exists it is updated in place,
    /// keeping its position. Equal creation times keep insertion order.
    pub fn insert(&mut self, record: SnapshotRecord) {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|r| r.label == record.label)
        {
            *existing = record;
            return;
        }
        let at = self
            .records
            .iter()
            .position(|r| r.creation > record.creation)
            .unwrap_or(self.records.len());
        self.records.insert(at, record);
    }

    /// Remove a record by label, returning it if present.
    pub fn remove(&mut self, label: &str) -> Option<SnapshotRecord> {
        let at = self.records.iter().position(|r| r.label == label)?;
        Some(self.records.remove(at))
    }

    pub fn contains(&self, label: &str) -> bool {
        self.records.iter().any(|r| r.label == label)
    }

    pub fn get(&self, label: &str) -> Option<&SnapshotRecord> {
        self.records.iter().find(|r| r.label == label)
    }

    /// Newest record (greatest creation time).
    pub fn last(&self) -> Option<&SnapshotRecord> {
        self.records.last()
    }

    /// Records strictly after the given label, oldest first.
    ///
    /// Returns an empty slice when the label is absent or newest.
    pub fn suffix_after(&self, label: &str) -> &[SnapshotRecord] {
        match self.records.iter().position(|r| r.label == label) {
            Some(at) => &self.records[at + 1..],
            None => &[],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapshotRecord> {
        self.records.iter()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.label.as_str()).collect()
    }

    /// Drop records whose labels are not managed timestamp labels.
    pub fn retain_managed(&mut self) {
        self.records.retain(|r| is_managed_label(&r.label));
    }

    /// Replace the whole timeline (after a resume replay re-fetch).
    pub fn replace_with(&mut self, other: SnapshotTimeline) {
        self.records = other.records;
    }
}

impl FromIterator<SnapshotRecord> for SnapshotTimeline {
    fn from_iter<I: IntoIterator<Item = SnapshotRecord>>(iter: I) -> Self {
        let mut timeline = SnapshotTimeline::new();
        for record in iter {
            timeline.insert(record);
        }
        timeline
    }
}
