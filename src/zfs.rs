// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed operations over the ZFS command-line interface.
//!
//! [`ZfsAdapter`] turns engine-level operations (list, snapshot, destroy,
//! hold, send/receive) into shell lines executed through a
//! [`CommandRunner`], and parses the tab-delimited listings back into typed
//! values. The storage engine is an opaque transport: every operation is
//! "execute command, parse output, raise on nonzero exit".
//!
//! All operations accept an endpoint string; an empty endpoint means local,
//! anything else is a remote-shell wrapper the command is piped through.
//! Transfer pipelines (`send | mbuffer | ssh | mbuffer | receive`) embed the
//! endpoint inline and run as a single local shell line, exactly as an
//! operator would type them.

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{EngineError, Result};
use crate::timeline::{is_managed_label, SnapshotRecord, SnapshotTimeline};
use std::sync::Arc;
use tracing::debug;

/// Hold tag applied to synchronization-point snapshots.
pub const HOLD_TAG: &str = "zsm";

/// Default mbuffer size for network transfers.
pub const DEFAULT_BUFFER_SIZE: &str = "512M";

/// One dataset as reported by `zfs list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub mountpoint: String,
}

/// Replication topology: which side of the edge this daemon instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local daemon is the data source.
    Push,
    /// Local daemon is the data destination.
    Pull,
}

/// Send/receive stream options, fixed per replication edge.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Send one cumulative replication stream (`-R`/`-I`) carrying the
    /// whole tree below the dataset.
    pub full_clone: bool,
    /// Carry every intermediate snapshot (`-I`) rather than consecutive
    /// incrementals.
    pub all_snapshots: bool,
    /// `zfs send -Lec`: embedded, large-block, compressed stream.
    pub send_compression: bool,
    /// `zfs send -p`: include dataset properties.
    pub send_properties: bool,
    /// `zfs send -w`: raw (encrypted) stream.
    pub send_raw: bool,
    /// `zfs receive -s`: save partial state for resume.
    pub receive_save: bool,
    /// `zfs receive -u`: do not mount after receive.
    pub receive_umount: bool,
    /// `zfs receive -x mountpoint`: strip the mountpoint property.
    pub receive_no_mountpoint: bool,
    /// `zfs receive -o mountpoint=...`.
    pub receive_mountpoint: Option<String>,
    /// mbuffer memory size on each end of a network hop.
    pub buffer_size: String,
    /// External compression filter piped around the network hop
    /// (e.g. `zstd`), invoked as `<filter> -c` / `<filter> -cd`.
    pub compression: Option<String>,
}

impl SendOptions {
    fn delta_flag(&self) -> &'static str {
        // Consecutive incrementals only when neither cumulative mode is on.
        if !self.full_clone && !self.all_snapshots {
            "-i"
        } else {
            "-I"
        }
    }

    fn send_args(&self, resumed: bool) -> String {
        let mut args = String::new();
        if self.send_compression {
            args.push_str("Lec");
        }
        if self.send_raw {
            args.push('w');
        }
        // Property and clone flags are baked into the resume token.
        if !resumed {
            if self.send_properties {
                args.push('p');
            }
            if self.full_clone {
                args.push('R');
            }
        }
        if args.is_empty() {
            args
        } else {
            format!("-{} ", args)
        }
    }

    fn receive_args(&self) -> String {
        let mut args = String::new();
        if self.receive_save {
            args.push('s');
        }
        if self.receive_umount {
            args.push('u');
        }
        let mut out = if args.is_empty() {
            String::new()
        } else {
            format!("-{} ", args)
        };
        if self.receive_no_mountpoint {
            out.push_str("-x mountpoint ");
        }
        if let Some(mountpoint) = &self.receive_mountpoint {
            out.push_str(&format!("-o \"mountpoint={}\" ", mountpoint));
        }
        out
    }

    fn buffer_size(&self) -> &str {
        if self.buffer_size.is_empty() {
            DEFAULT_BUFFER_SIZE
        } else {
            &self.buffer_size
        }
    }
}

/// One transfer between a source and a destination dataset.
#[derive(Debug, Clone)]
pub struct TransferSpec<'a> {
    pub src_dataset: &'a str,
    pub dst_dataset: &'a str,
    /// Common snapshot the delta starts from; `None` for a full send.
    pub base_label: Option<&'a str>,
    /// Snapshot to send up to; `None` only when resuming from a token.
    pub last_label: Option<&'a str>,
    /// Remote-shell wrapper; empty for a purely local transfer.
    pub endpoint: &'a str,
    pub resume_token: Option<&'a str>,
    pub direction: Direction,
    pub options: &'a SendOptions,
    pub log_command: bool,
}

impl TransferSpec<'_> {
    fn delta(&self) -> String {
        match self.base_label {
            Some(base) => format!(
                "{} {}@{} ",
                self.options.delta_flag(),
                self.src_dataset,
                base
            ),
            None => String::new(),
        }
    }

    fn send_command(&self, dry_run: bool) -> String {
        let nv = if dry_run { "-nv " } else { "" };
        let send_args = self.options.send_args(self.resume_token.is_some());
        match self.resume_token {
            Some(token) => format!("zfs send {}{}-t {}", nv, send_args, token),
            None => format!(
                "zfs send {}{}{}{}@{}",
                nv,
                send_args,
                self.delta(),
                self.src_dataset,
                self.last_label.unwrap_or_default()
            ),
        }
    }
}

/// Typed storage operations over a [`CommandRunner`].
pub struct ZfsAdapter<R: CommandRunner> {
    runner: Arc<R>,
}

impl<R: CommandRunner> Clone for ZfsAdapter<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
        }
    }
}

impl<R: CommandRunner> ZfsAdapter<R> {
    pub fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.runner
    }

    /// List all datasets with their mountpoints, in engine enumeration order.
    pub async fn datasets(&self, endpoint: &str, log_command: bool) -> Result<Vec<Dataset>> {
        let output = self
            .runner
            .run(
                CommandSpec::at("zfs list -pH -o name,mountpoint", endpoint)
                    .logged(log_command),
            )
            .await?;
        let mut datasets = Vec::new();
        for line in output.lines().filter(|l| !l.is_empty()) {
            let mut parts = line.split('\t').filter(|p| !p.is_empty());
            let (Some(name), Some(mountpoint)) = (parts.next(), parts.next()) else {
                continue;
            };
            datasets.push(Dataset {
                name: name.to_string(),
                mountpoint: mountpoint.to_string(),
            });
        }
        Ok(datasets)
    }

    /// List a dataset's snapshots ordered by creation time.
    ///
    /// With `all_snapshots` false, foreign (non-timestamp-labelled)
    /// snapshots are filtered out at parse time.
    pub async fn snapshots(
        &self,
        dataset: &str,
        endpoint: &str,
        all_snapshots: bool,
        log_command: bool,
    ) -> Result<SnapshotTimeline> {
        let command = format!(
            "zfs list -pH -s creation -o name,creation -t snapshot {} || true",
            dataset
        );
        let output = self
            .runner
            .run(CommandSpec::at(command, endpoint).logged(log_command))
            .await?;
        let mut timeline = SnapshotTimeline::new();
        for line in output.lines().filter(|l| !l.is_empty()) {
            let mut parts = line.split('\t').filter(|p| !p.is_empty());
            let (Some(full_name), Some(creation)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Some((_, label)) = full_name.split_once('@') else {
                continue;
            };
            let Ok(creation) = creation.parse::<i64>() else {
                debug!(line, "Skipping snapshot listing line with bad creation");
                continue;
            };
            if !all_snapshots && !is_managed_label(label) {
                continue;
            }
            timeline.insert(SnapshotRecord::new(label, creation));
        }
        Ok(timeline)
    }

    /// Take a snapshot named after the current tick.
    pub async fn create_snapshot(
        &self,
        dataset: &str,
        label: &str,
        endpoint: &str,
        log_command: bool,
    ) -> Result<()> {
        let command = format!("zfs snapshot {}@{}", dataset, label);
        self.runner
            .run(CommandSpec::at(command, endpoint).logged(log_command))
            .await?;
        Ok(())
    }

    /// Destroy a snapshot.
    pub async fn destroy(
        &self,
        dataset: &str,
        label: &str,
        endpoint: &str,
        log_command: bool,
    ) -> Result<()> {
        let command = format!("zfs destroy {}@{}", dataset, label);
        self.runner
            .run(CommandSpec::at(command, endpoint).logged(log_command))
            .await?;
        Ok(())
    }

    /// Apply the engine's hold tag to a snapshot.
    pub async fn hold(
        &self,
        dataset: &str,
        label: &str,
        endpoint: &str,
        may_exist: bool,
        log_command: bool,
    ) -> Result<()> {
        let command = format!("zfs hold {} {}@{}", HOLD_TAG, dataset, label);
        let mut spec = CommandSpec::at(command, endpoint).logged(log_command);
        if may_exist {
            spec = spec.ignoring("tag already exists");
        }
        self.runner.run(spec).await?;
        Ok(())
    }

    /// Release the engine's hold tag from a snapshot (no-op if absent).
    pub async fn release(
        &self,
        dataset: &str,
        label: &str,
        endpoint: &str,
        log_command: bool,
    ) -> Result<()> {
        let command = format!("zfs release {} {}@{} || true", HOLD_TAG, dataset, label);
        self.runner
            .run(CommandSpec::at(command, endpoint).logged(log_command))
            .await?;
        Ok(())
    }

    /// Snapshot labels under this dataset currently carrying our hold tag,
    /// sorted.
    pub async fn holds(
        &self,
        dataset: &str,
        endpoint: &str,
        log_command: bool,
    ) -> Result<Vec<String>> {
        let command = format!(
            "zfs list -H -r -d 1 -t snapshot -o name {} | xargs -d \"\\n\" zfs holds -H",
            dataset
        );
        let output = self
            .runner
            .run(CommandSpec::at(command, endpoint).logged(log_command))
            .await?;
        let mut holds = Vec::new();
        for line in output.lines().filter(|l| !l.is_empty()) {
            let mut parts = line.split('\t').filter(|p| !p.is_empty());
            let (Some(full_name), Some(tag)) = (parts.next(), parts.next()) else {
                continue;
            };
            if tag != HOLD_TAG {
                continue;
            }
            if let Some((_, label)) = full_name.split_once('@') {
                holds.push(label.to_string());
            }
        }
        holds.sort();
        Ok(holds)
    }

    /// Whether a single snapshot carries our hold tag.
    pub async fn is_held(
        &self,
        dataset: &str,
        label: &str,
        endpoint: &str,
        log_command: bool,
    ) -> Result<bool> {
        let command = format!("zfs holds {}@{}", dataset, label);
        let output = self
            .runner
            .run(CommandSpec::at(command, endpoint).logged(log_command))
            .await?;
        Ok(output.contains(HOLD_TAG))
    }

    /// Query the receive resume token left by an interrupted receive.
    pub async fn resume_token(
        &self,
        dataset: &str,
        endpoint: &str,
        log_command: bool,
    ) -> Result<Option<String>> {
        let command = format!(
            "zfs get receive_resume_token -pHo value {} || true",
            dataset
        );
        let output = self
            .runner
            .run(CommandSpec::at(command, endpoint).logged(log_command))
            .await?;
        let token = output
            .lines()
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or("")
            .to_string();
        if token.is_empty() || token == "-" {
            Ok(None)
        } else {
            Ok(Some(token))
        }
    }

    /// Abort an interrupted receive, discarding its partial state.
    pub async fn abort_receive(
        &self,
        dataset: &str,
        endpoint: &str,
        no_save: bool,
        log_command: bool,
    ) -> Result<()> {
        let command = format!("zfs receive -A {}", dataset);
        let mut spec = CommandSpec::at(command, endpoint).logged(log_command);
        if no_save {
            spec = spec.ignoring("does not have any resumable receive state to abort");
        }
        self.runner.run(spec).await?;
        Ok(())
    }

    /// Dry-run the send to estimate the transfer size, humanized.
    ///
    /// The dry run executes on the sending side: locally for a push,
    /// through the endpoint for a pull.
    pub async fn estimate_size(&self, spec: &TransferSpec<'_>) -> Result<String> {
        let send = spec.send_command(true);
        let wrapped = if spec.endpoint.is_empty() || spec.direction == Direction::Push {
            send
        } else {
            format!("{} '{}'", spec.endpoint, send)
        };
        let command = format!("{} 2>&1 | grep 'estimated size is'", wrapped);
        let output = self
            .runner
            .run(CommandSpec::local(command).logged(spec.log_command))
            .await?;
        let size = output.trim().rsplit(' ').next().unwrap_or("").to_string();
        if size.chars().last().is_some_and(|c| c.is_ascii_digit()) {
            Ok(format!("{}B", size))
        } else {
            Ok(format!("{}iB", size))
        }
    }

    /// Run one send/receive pipeline: local, push or pull.
    ///
    /// The stream flows through mbuffer on both ends of a network hop and
    /// optionally through an external compression filter; receive always
    /// uses `-F` so the destination rolls back to the common point.
    pub async fn replicate(&self, spec: &TransferSpec<'_>) -> Result<()> {
        let options = spec.options;
        let send = spec.send_command(false);
        let receive_args = options.receive_args();
        let (compress, decompress) = match &options.compression {
            Some(filter) => (format!("| {} -c", filter), format!("| {} -cd", filter)),
            None => (String::new(), String::new()),
        };
        let buffer = options.buffer_size();

        let command = if spec.endpoint.is_empty() {
            format!(
                "{} | zfs receive {}-F {}",
                send, receive_args, spec.dst_dataset
            )
        } else {
            match spec.direction {
                Direction::Push => format!(
                    "{} {} | mbuffer -q -v 0 -s 128k -m {} | {} 'mbuffer -q -v 0 -s 128k -m {} {} | zfs receive {}-F {}'",
                    send,
                    compress,
                    buffer,
                    spec.endpoint,
                    buffer,
                    decompress,
                    receive_args,
                    spec.dst_dataset
                ),
                Direction::Pull => format!(
                    "{} '{} {} | mbuffer -q -v 0 -s 128k -m {}' | mbuffer -q -v 0 -s 128k -m {} {} | zfs receive {}-F {}",
                    spec.endpoint,
                    send,
                    compress,
                    buffer,
                    buffer,
                    decompress,
                    receive_args,
                    spec.dst_dataset
                ),
            }
        };

        self.runner
            .run(CommandSpec::local(command).logged(spec.log_command))
            .await?;
        Ok(())
    }

    /// Surface a missing dataset as a reconciliation error.
    pub async fn require_dataset(
        &self,
        dataset: &str,
        endpoint: &str,
        log_command: bool,
    ) -> Result<()> {
        let datasets = self.datasets(endpoint, log_command).await?;
        if datasets.iter().any(|d| d.name == dataset) {
            Ok(())
        } else {
            Err(EngineError::reconcile(
                dataset,
                "remote dataset does not exist",
            ))
        }
    }
}
