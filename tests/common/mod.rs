// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared fixtures for the integration suites: a manually-advanced clock
//! and a manager wired to scripted command/probe doubles.

#![allow(dead_code)]

use chrono::{Local, TimeZone};
use snapshot_engine::manager::Clock;
use snapshot_engine::{DaemonConfig, Manager, ScriptedProber, ScriptedRunner};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Clock whose reading the test sets explicitly.
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn at(epoch: i64) -> Self {
        Self(Arc::new(AtomicI64::new(epoch)))
    }

    pub fn set(&self, epoch: i64) {
        self.0.store(epoch, Ordering::SeqCst);
    }

    pub fn as_clock(&self) -> Clock {
        let cell = Arc::clone(&self.0);
        Arc::new(move || cell.load(Ordering::SeqCst))
    }
}

/// Epoch seconds of a local wall-clock time.
pub fn local_epoch(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
    Local
        .with_ymd_and_hms(y, mo, d, h, mi, 0)
        .single()
        .expect("unambiguous local time")
        .timestamp()
}

/// Managed snapshot label for an instant.
pub fn label_at(epoch: i64) -> String {
    snapshot_engine::timeline::format_label(epoch)
}

pub struct Harness {
    pub clock: ManualClock,
    pub runner: Arc<ScriptedRunner>,
    pub prober: Arc<ScriptedProber>,
    pub manager: Manager<ScriptedRunner, Arc<ScriptedProber>>,
}

/// Install a test-writer subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Build a manager over scripted doubles, started at `start`.
pub fn harness(toml: &str, start: i64) -> Harness {
    init_tracing();
    let config = DaemonConfig::from_toml_str(toml).expect("valid config");
    let runner = Arc::new(ScriptedRunner::new());
    let prober = Arc::new(ScriptedProber::new());
    let clock = ManualClock::at(start);
    let manager = Manager::with_parts(
        Arc::clone(&runner),
        Arc::clone(&prober),
        &config,
        clock.as_clock(),
    )
    .expect("manager construction");
    Harness {
        clock,
        runner,
        prober,
        manager,
    }
}
