// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # snapshot-engine
//!
//! Snapshot lifecycle and replication daemon for copy-on-write filesystem
//! datasets. The engine takes scheduled snapshots, expires them against
//! bucketed retention schemas, and replicates dataset timelines to other
//! hosts over incremental send/receive streams, resuming interrupted
//! transfers and pinning the synchronization point with holds.
//!
//! ## Architecture
//!
//! ```text
//!                         ┌──────────────┐
//!                         │   Manager    │  per-cycle orchestrator
//!                         └──────┬───────┘
//!        ┌───────────────┬───────┼────────────┬─────────────────┐
//!        ▼               ▼       ▼            ▼                 ▼
//! ┌────────────┐ ┌───────────┐ ┌─────────┐ ┌──────────────┐ ┌─────────────┐
//! │ MeterTime  │ │  Cleaner  │ │ZfsAdapter│ │ Replication  │ │Connectivity │
//! │ (schedule) │ │(retention)│ │ (zfs CLI)│ │   Engine     │ │    Gate     │
//! └────────────┘ └───────────┘ └────┬────┘ └──────┬───────┘ └─────────────┘
//!                                   │             │
//!                                   ▼             ▼
//!                            ┌─────────────────────────┐
//!                            │     CommandRunner       │
//!                            │ (sh -c / ssh / scripted)│
//!                            └─────────────────────────┘
//! ```
//!
//! The storage engine is driven exclusively through its command-line
//! interface; every side effect in the crate funnels through the
//! [`command::CommandRunner`] seam, so the whole engine runs against a
//! scripted transcript in tests.
//!
//! Execution is strictly sequential: one dataset at a time, one edge at a
//! time, one subprocess at a time. The async runtime is used for subprocess
//! supervision and timers, not for parallelism.
//!
//! ## Quick start
//!
//! ```no_run
//! use snapshot_engine::{DaemonConfig, Manager};
//!
//! # async fn start() -> snapshot_engine::Result<()> {
//! let config = DaemonConfig::load("/etc/snapshot-engine.toml")?;
//! let mut manager = Manager::new(&config)?;
//! manager.run().await;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod replicate;
pub mod retention;
pub mod schedule;
pub mod timeline;
pub mod zfs;

pub use command::{CommandRunner, CommandSpec, ScriptedRunner, ShellRunner};
pub use config::{DaemonConfig, DatasetConfig, ReplicationEdge, SettingsConfig};
pub use connectivity::{ConnectivityGate, Prober, ScriptedProber, TcpProber};
pub use error::{EngineError, Result};
pub use manager::Manager;
pub use replicate::{Outcome, ReplicationEngine};
pub use retention::{Cleaner, RetentionPlan, RetentionSchema};
pub use schedule::{MeterTime, ScheduleSpec};
pub use timeline::{SnapshotRecord, SnapshotTimeline};
pub use zfs::{Dataset, Direction, SendOptions, ZfsAdapter};
