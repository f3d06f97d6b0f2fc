// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-cycle orchestration and the daemon loop.
//!
//! One cycle walks every dataset the storage engine reports, in listing
//! order, strictly sequentially:
//!
//! ```text
//!  for each configured dataset:
//!      schedule cursor due? ── no ──> next dataset
//!      push datasets: preexec > snapshot > local clean
//!                     > per edge: probe > fetch > reconcile > remote clean
//!                     > hooks on change
//!      pull datasets: per edge: probe > verify > remote snapshot+clean
//!                     > reconcile > hooks on change
//!                     > local clean
//! ```
//!
//! Errors are contained at the dataset boundary: a failing dataset is
//! logged and the cycle moves on. An unreachable endpoint skips only the
//! edges that need it, never the whole dataset. The daemon loop is just
//! cycle-then-sleep; scheduling precision comes from the cursor, not the
//! loop cadence.

use crate::command::{CommandRunner, CommandSpec, ShellRunner};
use crate::config::{DaemonConfig, DatasetConfig, SettingsConfig};
use crate::connectivity::{ConnectivityGate, Prober, TcpProber, DEFAULT_CONNECT_ATTEMPTS};
use crate::error::Result;
use crate::replicate::{Outcome, ReplicationEngine};
use crate::retention::Cleaner;
use crate::schedule::MeterTime;
use crate::timeline::{format_label, SnapshotRecord};
use crate::zfs::{Dataset, Direction, ZfsAdapter};
use chrono::Local;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Time source; swapped out in tests.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// The orchestrator: owns the per-dataset schedule cursors and drives one
/// cycle at a time.
pub struct Manager<R: CommandRunner, P: Prober> {
    runner: Arc<R>,
    zfs: ZfsAdapter<R>,
    engine: ReplicationEngine<R>,
    cleaner: Cleaner<R>,
    gate: ConnectivityGate<P>,
    settings: SettingsConfig,
    configs: BTreeMap<String, DatasetConfig>,
    meters: BTreeMap<String, MeterTime>,
    clock: Clock,
}

impl Manager<ShellRunner, TcpProber> {
    /// Production manager: real subprocesses, real TCP probes, wall clock.
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        Self::with_parts(
            Arc::new(ShellRunner::new()),
            TcpProber::new(config.settings.connect_timeout),
            config,
            Arc::new(|| Local::now().timestamp()),
        )
    }
}

impl<R: CommandRunner, P: Prober> Manager<R, P> {
    pub fn with_parts(
        runner: Arc<R>,
        prober: P,
        config: &DaemonConfig,
        clock: Clock,
    ) -> Result<Self> {
        let configs = config.resolve()?;
        let now = clock();
        let hysteresis = config.settings.startup_hysteresis.as_secs() as i64;
        let meters = configs
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    MeterTime::with_hysteresis(cfg.schedule.clone(), now, hysteresis),
                )
            })
            .collect();
        let zfs = ZfsAdapter::new(Arc::clone(&runner));
        Ok(Self {
            runner,
            engine: ReplicationEngine::new(zfs.clone()),
            cleaner: Cleaner::new(zfs.clone()),
            zfs,
            gate: ConnectivityGate::with_policy(
                prober,
                DEFAULT_CONNECT_ATTEMPTS,
                config.settings.connect_retry_wait,
            ),
            settings: config.settings.clone(),
            configs,
            meters,
            clock,
        })
    }

    /// Run cycles forever, sleeping `settings.sleep_time` in between.
    pub async fn run(&mut self) {
        info!(
            datasets = self.configs.len(),
            interval = ?self.settings.sleep_time,
            "Snapshot engine started"
        );
        loop {
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Cycle failed");
            }
            tokio::time::sleep(self.settings.sleep_time).await;
        }
    }

    /// Walk every dataset once.
    ///
    /// Fails only when the dataset enumeration itself fails; per-dataset
    /// errors are logged and contained.
    pub async fn run_cycle(&mut self) -> Result<()> {
        let start = std::time::Instant::now();
        self.gate.begin_cycle();

        let datasets = self.zfs.datasets("", false).await?;
        for dataset in &datasets {
            let Some(cfg) = self.configs.get(&dataset.name).cloned() else {
                continue;
            };
            if !cfg.snapshot && cfg.edges.is_empty() {
                continue;
            }
            if let Err(e) = self.process_dataset(&cfg, dataset).await {
                error!(
                    dataset = %cfg.name,
                    error = %e,
                    transient = e.is_transient(),
                    "Dataset processing failed, continuing with the next one"
                );
            }
        }

        crate::metrics::record_cycle_duration(start.elapsed().as_secs_f64());
        Ok(())
    }

    async fn process_dataset(&mut self, cfg: &DatasetConfig, dataset: &Dataset) -> Result<()> {
        let now = (self.clock)();
        let mountpoint = cfg
            .mountpoint
            .as_deref()
            .unwrap_or(dataset.mountpoint.as_str());
        let due = match self.meters.get_mut(&cfg.name) {
            Some(meter) => meter.do_run(now, mountpoint)?,
            None => false,
        };
        if !due {
            return Ok(());
        }
        debug!(dataset = %cfg.name, "Dataset due");
        crate::metrics::record_dataset_processed();

        let label = format_label(now);
        if cfg
            .edges
            .iter()
            .any(|e| e.direction == Direction::Pull)
        {
            self.process_pull(cfg, now, &label).await
        } else {
            self.process_push(cfg, now, &label).await
        }
    }

    /// Local-source flow: snapshot and clean here, then push each edge.
    async fn process_push(&mut self, cfg: &DatasetConfig, now: i64, label: &str) -> Result<()> {
        let listing_all = cfg.all_snapshots || cfg.any_full_clone();
        let mut local = self
            .zfs
            .snapshots(&cfg.name, "", listing_all, cfg.log_commands)
            .await?;

        let mut snapped = false;
        if cfg.snapshot && !local.contains(label) {
            if let Some(hook) = &cfg.preexec {
                self.run_hook(hook, "", cfg.log_commands).await?;
            }
            self.zfs
                .create_snapshot(&cfg.name, label, "", cfg.log_commands)
                .await?;
            local.insert(SnapshotRecord::new(label, now));
            crate::metrics::record_snapshot_taken();
            info!(dataset = %cfg.name, label, "Snapshot taken");
            snapped = true;
        }

        self.cleaner
            .clean(
                &cfg.name,
                "",
                &mut local,
                &cfg.schema,
                cfg.clean_all,
                now,
                cfg.log_commands,
            )
            .await?;

        if snapped {
            if let Some(hook) = &cfg.postexec {
                self.run_hook(hook, "", cfg.log_commands).await?;
            }
        }

        let mut any_changed = false;
        for edge in cfg.edges.iter().filter(|e| e.direction == Direction::Push) {
            if self.gate.should_skip(&edge.host, edge.port).await {
                crate::metrics::record_connectivity_failure();
                continue;
            }
            let mut remote = self
                .zfs
                .snapshots(
                    &edge.peer_dataset,
                    &edge.endpoint,
                    edge.options.all_snapshots,
                    cfg.log_commands,
                )
                .await?;
            let outcome = match self
                .engine
                .reconcile(&cfg.name, &mut local, &mut remote, edge, cfg.log_commands)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    crate::metrics::record_replication(Outcome::Failure.as_str());
                    return Err(e);
                }
            };
            crate::metrics::record_replication(outcome.as_str());
            if outcome == Outcome::Changed {
                any_changed = true;
            }
            self.cleaner
                .clean(
                    &edge.peer_dataset,
                    &edge.endpoint,
                    &mut remote,
                    &edge.schema,
                    edge.clean_all,
                    now,
                    cfg.log_commands,
                )
                .await?;
        }

        if any_changed {
            if let Some(hook) = &cfg.replicate_postexec {
                self.run_hook(hook, "", cfg.log_commands).await?;
            }
        }
        Ok(())
    }

    /// Remote-source flow: snapshot and clean through the endpoint, then
    /// pull into the local timeline.
    ///
    /// The remote retention pass runs on every due tick, even when this
    /// tick's snapshot already existed; the safety valve still blocks it
    /// whenever the remote timeline has no fresh anchor.
    async fn process_pull(&mut self, cfg: &DatasetConfig, now: i64, label: &str) -> Result<()> {
        let listing_all = cfg.all_snapshots || cfg.any_full_clone();
        let mut local = self
            .zfs
            .snapshots(&cfg.name, "", listing_all, cfg.log_commands)
            .await?;

        for edge in cfg.edges.iter().filter(|e| e.direction == Direction::Pull) {
            if self.gate.should_skip(&edge.host, edge.port).await {
                crate::metrics::record_connectivity_failure();
                continue;
            }
            self.zfs
                .require_dataset(&edge.peer_dataset, &edge.endpoint, cfg.log_commands)
                .await?;
            let mut remote = self
                .zfs
                .snapshots(
                    &edge.peer_dataset,
                    &edge.endpoint,
                    edge.options.all_snapshots,
                    cfg.log_commands,
                )
                .await?;

            if cfg.snapshot && !remote.contains(label) {
                if let Some(hook) = &cfg.preexec {
                    self.run_hook(hook, &edge.endpoint, cfg.log_commands).await?;
                }
                self.zfs
                    .create_snapshot(&edge.peer_dataset, label, &edge.endpoint, cfg.log_commands)
                    .await?;
                remote.insert(SnapshotRecord::new(label, now));
                crate::metrics::record_snapshot_taken();
                info!(dataset = %edge.peer_dataset, label, "Remote snapshot taken");
                if let Some(hook) = &cfg.postexec {
                    self.run_hook(hook, &edge.endpoint, cfg.log_commands).await?;
                }
            }

            self.cleaner
                .clean(
                    &edge.peer_dataset,
                    &edge.endpoint,
                    &mut remote,
                    &edge.schema,
                    edge.clean_all,
                    now,
                    cfg.log_commands,
                )
                .await?;

            let outcome = match self
                .engine
                .reconcile(&cfg.name, &mut local, &mut remote, edge, cfg.log_commands)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    crate::metrics::record_replication(Outcome::Failure.as_str());
                    return Err(e);
                }
            };
            crate::metrics::record_replication(outcome.as_str());
            if outcome == Outcome::Changed {
                if let Some(hook) = &cfg.replicate_postexec {
                    self.run_hook(hook, &edge.endpoint, cfg.log_commands).await?;
                }
            }
        }

        self.cleaner
            .clean(
                &cfg.name,
                "",
                &mut local,
                &cfg.local_schema,
                cfg.local_clean_all,
                now,
                cfg.log_commands,
            )
            .await?;
        Ok(())
    }

    async fn run_hook(&self, hook: &str, endpoint: &str, log_command: bool) -> Result<()> {
        debug!(hook, endpoint, "Running hook");
        self.runner
            .run(CommandSpec::at(hook, endpoint).logged(log_command))
            .await?;
        Ok(())
    }

    /// Resolved config for one dataset, if managed.
    pub fn dataset_config(&self, name: &str) -> Option<&DatasetConfig> {
        self.configs.get(name)
    }
}
