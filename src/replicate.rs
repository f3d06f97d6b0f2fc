// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Timeline reconciliation between two endpoints.
//!
//! [`ReplicationEngine::reconcile`] drives one replication edge to
//! convergence:
//!
//! ```text
//!  resume token on the destination?
//!      yes ──> replay it, re-fetch the destination, hold the newest
//!  last common label between source and destination?
//!      yes ──> send the suffix (one cumulative stream, or pairwise
//!              incrementals), holding each synchronization point
//!      no, source non-empty ──> full send of the newest snapshot
//!      no, both empty ──> nothing to do
//! ```
//!
//! Every successful transfer moves the synchronization-point hold with
//! [`ReplicationEngine::new_hold`]: the new label is held, every other hold
//! carrying our tag is released. A mid-sequence failure propagates, but
//! transfers already applied keep their mirrored records and holds, so the
//! next cycle resumes from the advanced common point.

use crate::command::CommandRunner;
use crate::config::ReplicationEdge;
use crate::error::Result;
use crate::timeline::SnapshotTimeline;
use crate::zfs::{Direction, TransferSpec, ZfsAdapter};
use tracing::{debug, info};

/// Result of one reconciliation pass over an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Reconciliation ran into an error; set at the orchestration boundary.
    Failure,
    /// Ran to completion without transferring anything.
    Executed,
    /// At least one snapshot was transferred or replayed.
    Changed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Failure => "failure",
            Self::Executed => "executed",
            Self::Changed => "changed",
        }
    }
}

/// Drives replication edges to convergence over a [`ZfsAdapter`].
pub struct ReplicationEngine<R: CommandRunner> {
    zfs: ZfsAdapter<R>,
}

impl<R: CommandRunner> ReplicationEngine<R> {
    pub fn new(zfs: ZfsAdapter<R>) -> Self {
        Self { zfs }
    }

    /// Reconcile one edge, mutating both in-memory timelines to match what
    /// was transferred.
    ///
    /// `local` is this host's timeline for `dataset`; `remote` is the
    /// peer's timeline for the edge's dataset. Which one is the source
    /// follows the edge direction.
    pub async fn reconcile(
        &self,
        dataset: &str,
        local: &mut SnapshotTimeline,
        remote: &mut SnapshotTimeline,
        edge: &ReplicationEdge,
        log_command: bool,
    ) -> Result<Outcome> {
        let (src_name, src_endpoint, src, dst_name, dst_endpoint, dst) = match edge.direction {
            Direction::Push => (
                dataset,
                "",
                &mut *local,
                edge.peer_dataset.as_str(),
                edge.endpoint.as_str(),
                &mut *remote,
            ),
            Direction::Pull => (
                edge.peer_dataset.as_str(),
                edge.endpoint.as_str(),
                &mut *remote,
                dataset,
                "",
                &mut *local,
            ),
        };

        // An interrupted receive leaves a token on the destination; replay
        // it before looking at labels at all.
        if let Some(token) = self
            .zfs
            .resume_token(dst_name, dst_endpoint, log_command)
            .await?
        {
            info!(
                dataset = dst_name,
                "Resume token found, replaying interrupted receive"
            );
            let spec = TransferSpec {
                src_dataset: src_name,
                dst_dataset: dst_name,
                base_label: None,
                last_label: None,
                endpoint: edge.endpoint.as_str(),
                resume_token: Some(&token),
                direction: edge.direction,
                options: &edge.options,
                log_command,
            };
            let size = self.zfs.estimate_size(&spec).await?;
            info!(dataset = dst_name, size = %size, "Replaying resumed stream");
            self.zfs.replicate(&spec).await?;

            let refreshed = self
                .zfs
                .snapshots(dst_name, dst_endpoint, edge.options.all_snapshots, log_command)
                .await?;
            if let Some(newest) = refreshed.last().map(|r| r.label.clone()) {
                self.new_hold(src_name, &newest, src_endpoint, log_command)
                    .await?;
                self.new_hold(dst_name, &newest, dst_endpoint, log_command)
                    .await?;
            }
            dst.replace_with(refreshed);
            crate::metrics::record_resume_replay();
            return Ok(Outcome::Changed);
        }

        // Last source label the destination also has, scanning in creation
        // order.
        let common = src
            .iter()
            .filter(|r| dst.contains(&r.label))
            .last()
            .map(|r| r.label.clone());

        match common {
            Some(common) => {
                let suffix: Vec<_> = src.suffix_after(&common).to_vec();
                if suffix.is_empty() {
                    debug!(dataset = src_name, common = %common, "Edge already in sync");
                    return Ok(Outcome::Executed);
                }

                if edge.options.full_clone || edge.options.all_snapshots {
                    // One cumulative stream carrying the whole suffix.
                    let last = &suffix[suffix.len() - 1].label;
                    let spec = TransferSpec {
                        src_dataset: src_name,
                        dst_dataset: dst_name,
                        base_label: Some(&common),
                        last_label: Some(last),
                        endpoint: edge.endpoint.as_str(),
                        resume_token: None,
                        direction: edge.direction,
                        options: &edge.options,
                        log_command,
                    };
                    let size = self.zfs.estimate_size(&spec).await?;
                    info!(
                        from = %format!("{}@{}", src_name, common),
                        to = %format!("{}@{}", src_name, last),
                        size = %size,
                        "Sending cumulative stream"
                    );
                    self.zfs.replicate(&spec).await?;
                    self.new_hold(src_name, last, src_endpoint, log_command)
                        .await?;
                    self.new_hold(dst_name, last, dst_endpoint, log_command)
                        .await?;
                    for record in suffix {
                        dst.insert(record);
                    }
                } else {
                    // Pairwise incrementals; each applied pair advances the
                    // common point, so a failure loses nothing already sent.
                    let mut base = common;
                    for record in suffix {
                        let spec = TransferSpec {
                            src_dataset: src_name,
                            dst_dataset: dst_name,
                            base_label: Some(&base),
                            last_label: Some(&record.label),
                            endpoint: edge.endpoint.as_str(),
                            resume_token: None,
                            direction: edge.direction,
                            options: &edge.options,
                            log_command,
                        };
                        let size = self.zfs.estimate_size(&spec).await?;
                        info!(
                            from = %format!("{}@{}", src_name, base),
                            to = %format!("{}@{}", src_name, record.label),
                            size = %size,
                            "Sending incremental"
                        );
                        self.zfs.replicate(&spec).await?;
                        self.new_hold(src_name, &record.label, src_endpoint, log_command)
                            .await?;
                        self.new_hold(dst_name, &record.label, dst_endpoint, log_command)
                            .await?;
                        base = record.label.clone();
                        dst.insert(record);
                    }
                }
                Ok(Outcome::Changed)
            }
            None if !src.is_empty() => {
                // No shared history: seed the destination with a full send.
                let newest = src
                    .last()
                    .map(|r| r.label.clone())
                    .unwrap_or_default();
                let spec = TransferSpec {
                    src_dataset: src_name,
                    dst_dataset: dst_name,
                    base_label: None,
                    last_label: Some(&newest),
                    endpoint: edge.endpoint.as_str(),
                    resume_token: None,
                    direction: edge.direction,
                    options: &edge.options,
                    log_command,
                };
                let size = self.zfs.estimate_size(&spec).await?;
                info!(
                    to = %format!("{}@{}", src_name, newest),
                    size = %size,
                    "No common snapshot, sending full stream"
                );
                self.zfs.replicate(&spec).await?;
                self.new_hold(src_name, &newest, src_endpoint, log_command)
                    .await?;
                // A fresh destination has no stale holds to release.
                self.zfs
                    .hold(dst_name, &newest, dst_endpoint, true, log_command)
                    .await?;

                if edge.options.full_clone {
                    // The replication stream carried every snapshot.
                    for record in src.iter().cloned().collect::<Vec<_>>() {
                        dst.insert(record);
                    }
                } else if let Some(record) = src.get(&newest).cloned() {
                    dst.insert(record);
                }
                Ok(Outcome::Changed)
            }
            None => {
                debug!(dataset = src_name, "Both timelines empty, nothing to replicate");
                Ok(Outcome::Executed)
            }
        }
    }

    /// Move the synchronization-point hold to `label`.
    ///
    /// The new hold is applied before the old ones are released, so there
    /// is never a moment without a held snapshot; a crash in between leaves
    /// an extra hold that the next call releases.
    pub async fn new_hold(
        &self,
        dataset: &str,
        label: &str,
        endpoint: &str,
        log_command: bool,
    ) -> Result<()> {
        let existing = self.zfs.holds(dataset, endpoint, log_command).await?;
        self.zfs
            .hold(dataset, label, endpoint, true, log_command)
            .await?;
        for stale in existing.iter().filter(|h| h.as_str() != label) {
            self.zfs
                .release(dataset, stale, endpoint, log_command)
                .await?;
        }
        Ok(())
    }
}
