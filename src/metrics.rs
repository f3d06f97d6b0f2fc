// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation via the `metrics` facade.
//!
//! All metric names carry the `snapshot_engine_` prefix. The facade is a
//! no-op unless the embedding binary installs a recorder, so these helpers
//! are safe to call unconditionally.

use metrics::{counter, histogram};

/// Snapshots created.
pub fn record_snapshot_taken() {
    counter!("snapshot_engine_snapshots_taken_total").increment(1);
}

/// Snapshots destroyed by retention.
pub fn record_snapshot_destroyed() {
    counter!("snapshot_engine_snapshots_destroyed_total").increment(1);
}

/// Replication reconciliations, labelled by outcome
/// (`changed` / `executed` / `failure`).
pub fn record_replication(outcome: &'static str) {
    counter!("snapshot_engine_replications_total", "outcome" => outcome).increment(1);
}

/// Interrupted receives replayed from a resume token.
pub fn record_resume_replay() {
    counter!("snapshot_engine_resume_replays_total").increment(1);
}

/// Endpoints found unreachable by the connectivity gate.
pub fn record_connectivity_failure() {
    counter!("snapshot_engine_connectivity_failures_total").increment(1);
}

/// Datasets processed (due and acted upon) per cycle.
pub fn record_dataset_processed() {
    counter!("snapshot_engine_datasets_processed_total").increment(1);
}

/// Wall time of one full cycle.
pub fn record_cycle_duration(seconds: f64) {
    histogram!("snapshot_engine_cycle_duration_seconds").record(seconds);
}
