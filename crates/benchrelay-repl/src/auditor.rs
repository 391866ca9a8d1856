//! Reconciliation auditor: windowed drift detection between leader and
//! followers, with optional repair.
//!
//! Each pass samples every document whose execution timestamp is older than
//! `now - tolerance` on both sides, compares counts and an id checksum, and
//! reports the missing set. Documents younger than the tolerance are still
//! legitimately in flight and never count as drift. Repair re-reads missing
//! documents from the leader and re-enqueues them; discovery never trusts
//! the queue it is auditing.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use benchrelay_model::{format_timestamp, ResultDocument, RESULTS_INDEX_PATTERN};
use benchrelay_store::DocumentStore;

use crate::coordinator::ReplicationCoordinator;
use crate::error::ReplError;
use crate::task::epoch_ms;

/// Auditor tunables.
#[derive(Debug, Clone)]
pub struct AuditorConfig {
    /// Time between scheduled passes.
    pub interval: Duration,
    /// Replication age below which a document is still legitimately in flight.
    pub tolerance: Duration,
    /// Whether scheduled passes re-enqueue missing documents.
    pub repair: bool,
    /// Reports retained for the operator API.
    pub report_capacity: usize,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            tolerance: Duration::from_secs(60),
            repair: false,
            report_capacity: 64,
        }
    }
}

/// Outcome of checking one follower against the leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    /// Follower audited.
    pub follower_id: String,
    /// When the pass ran, milliseconds since epoch.
    pub checked_at_ms: u64,
    /// Upper bound of the audited window (documents at or before this).
    pub window_end: String,
    /// Documents in the window on the leader.
    pub leader_count: u64,
    /// Documents in the window on the follower.
    pub follower_count: u64,
    /// Checksum over sorted leader document ids.
    pub leader_checksum: String,
    /// Checksum over sorted follower document ids.
    pub follower_checksum: String,
    /// Ids present on the leader but missing on the follower.
    pub missing_doc_ids: Vec<String>,
    /// Documents on the follower the leader does not have.
    pub extra_count: u64,
    /// True when the two sides disagree.
    pub drift: bool,
    /// Missing documents re-enqueued by this pass.
    pub repaired: usize,
}

impl DriftReport {
    /// True when the pass found the follower complete.
    pub fn clean(&self) -> bool {
        !self.drift
    }
}

/// Detects and optionally repairs drift between leader and followers.
pub struct ReconciliationAuditor {
    coordinator: Arc<ReplicationCoordinator>,
    config: AuditorConfig,
    reports: RwLock<VecDeque<DriftReport>>,
}

impl ReconciliationAuditor {
    /// Build an auditor over the coordinator's leader and followers.
    pub fn new(coordinator: Arc<ReplicationCoordinator>, config: AuditorConfig) -> Self {
        Self {
            coordinator,
            config,
            reports: RwLock::new(VecDeque::new()),
        }
    }

    /// Whether scheduled passes repair by default.
    pub fn repair_enabled(&self) -> bool {
        self.config.repair
    }

    /// Run one audit pass over every follower.
    pub async fn run_once(&self, repair: bool) -> Result<Vec<DriftReport>, ReplError> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(self.config.tolerance.as_millis() as i64);
        let mut reports = Vec::new();
        for follower_id in self.coordinator.follower_ids() {
            let report = self.audit_follower(&follower_id, cutoff, repair).await?;
            self.retain(report.clone()).await;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Most recent reports, newest first.
    pub async fn recent_reports(&self, limit: usize) -> Vec<DriftReport> {
        let reports = self.reports.read().await;
        reports.iter().rev().take(limit).cloned().collect()
    }

    /// Scheduled audit loop. Runs until the shutdown signal flips.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            tolerance_secs = self.config.tolerance.as_secs(),
            repair = self.config.repair,
            "reconciliation auditor started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = self.run_once(self.config.repair).await {
                error!(error = %e, "reconciliation pass failed");
            }
        }
        info!("reconciliation auditor stopped");
    }

    async fn audit_follower(
        &self,
        follower_id: &str,
        cutoff: DateTime<Utc>,
        repair: bool,
    ) -> Result<DriftReport, ReplError> {
        let window_end = format_timestamp(&cutoff);
        let query = json!({
            "range": {"test-execution-timestamp": {"lte": window_end}}
        });

        let leader = self.coordinator.leader_store();
        let follower_store = self
            .coordinator
            .followers()
            .iter()
            .find(|w| w.follower_id() == follower_id)
            .map(|w| w.store().clone())
            .ok_or_else(|| ReplError::UnknownFollower {
                follower_id: follower_id.to_string(),
            })?;

        // surface writes still sitting in the near-real-time buffer
        if let Err(e) = leader.refresh(RESULTS_INDEX_PATTERN).await {
            debug!(error = %e, "leader refresh before audit failed");
        }
        if let Err(e) = follower_store.refresh(RESULTS_INDEX_PATTERN).await {
            debug!(follower = %follower_id, error = %e, "follower refresh before audit failed");
        }

        let leader_count = leader.count(RESULTS_INDEX_PATTERN, &query).await?;
        let follower_count = follower_store.count(RESULTS_INDEX_PATTERN, &query).await?;
        let leader_ids: BTreeSet<String> = leader
            .doc_ids(RESULTS_INDEX_PATTERN, &query)
            .await?
            .into_iter()
            .collect();
        let follower_ids: BTreeSet<String> = follower_store
            .doc_ids(RESULTS_INDEX_PATTERN, &query)
            .await?
            .into_iter()
            .collect();

        let missing_doc_ids: Vec<String> =
            leader_ids.difference(&follower_ids).cloned().collect();
        let extra_count = follower_ids.difference(&leader_ids).count() as u64;
        let leader_checksum = checksum(&leader_ids);
        let follower_checksum = checksum(&follower_ids);
        let drift = leader_count != follower_count || leader_checksum != follower_checksum;

        let repaired = if repair && !missing_doc_ids.is_empty() {
            self.repair_missing(follower_id, leader.as_ref(), &missing_doc_ids)
                .await?
        } else {
            0
        };

        let report = DriftReport {
            follower_id: follower_id.to_string(),
            checked_at_ms: epoch_ms(),
            window_end,
            leader_count,
            follower_count,
            leader_checksum,
            follower_checksum,
            missing_doc_ids,
            extra_count,
            drift,
            repaired,
        };
        if report.drift {
            warn!(
                follower = %report.follower_id,
                leader_count = report.leader_count,
                follower_count = report.follower_count,
                missing = report.missing_doc_ids.len(),
                extra = report.extra_count,
                repaired = report.repaired,
                "drift detected"
            );
        } else {
            debug!(
                follower = %report.follower_id,
                count = report.leader_count,
                "follower in sync"
            );
        }
        Ok(report)
    }

    /// Re-read missing documents from the leader and re-enqueue them.
    async fn repair_missing(
        &self,
        follower_id: &str,
        leader: &dyn DocumentStore,
        missing: &[String],
    ) -> Result<usize, ReplError> {
        let query = json!({"ids": {"values": missing}});
        let hits = leader.search(RESULTS_INDEX_PATTERN, &query).await?;
        let mut repaired = 0;
        for hit in hits {
            let doc: ResultDocument = match serde_json::from_value(hit.source) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(
                        doc_id = %hit.id,
                        error = %e,
                        "stored document no longer parses, skipping repair"
                    );
                    continue;
                }
            };
            match self.coordinator.enqueue_document(follower_id, &doc) {
                Ok(_) => repaired += 1,
                Err(e) => {
                    error!(
                        follower = %follower_id,
                        doc_id = %hit.id,
                        error = %e,
                        "failed to re-enqueue missing document"
                    );
                }
            }
        }
        info!(follower = %follower_id, repaired, missing = missing.len(), "repair pass finished");
        Ok(repaired)
    }

    async fn retain(&self, report: DriftReport) {
        let mut reports = self.reports.write().await;
        reports.push_back(report);
        while reports.len() > self.config.report_capacity {
            reports.pop_front();
        }
    }
}

/// SHA-256 over newline-joined sorted document ids, hex encoded.
fn checksum(ids: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update([b'\n']);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
