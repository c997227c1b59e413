//! Backup run orchestration
//!
//! A run holds the destination's exclusive lock end to end: node creation,
//! change detection, parallel hashing/storing, completion. Per-file errors
//! are recorded and the run continues, but a node with failures is never
//! marked complete, so later runs never select it as a diff reference or
//! Full ancestor.

use crate::detector::ChangeSetDetector;
use crate::io::{Archiver, Clock, LocalArchiver, LogNotifier, Notifier, NullTransport, SystemClock, Transport};
use crate::lineage::LineageStore;
use crate::lock::StoreLock;
use crate::store::{ObjectStore, Stored};
use crate::types::{NodeKind, RunOutcome, SourceFile};
use crate::{Result, VaultError};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cooperative cancellation signal checked between files. A cancelled run
/// never leaves a node with the completion flag set.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one backup run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub node_id: Uuid,
    pub kind: NodeKind,
    pub files_stored: usize,
    pub files_failed: usize,
    pub bytes_stored: u64,
    pub bytes_deduped: u64,
    pub outcome: RunOutcome,
}

/// Drives backup runs against one destination root.
pub struct BackupEngine {
    store_root: PathBuf,
    clock: Arc<dyn Clock>,
    archiver: Arc<dyn Archiver>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    remote: Option<String>,
    exclude_patterns: Vec<String>,
}

impl BackupEngine {
    pub fn new(store_root: &Path) -> Self {
        Self {
            store_root: store_root.to_path_buf(),
            clock: Arc::new(SystemClock),
            archiver: Arc::new(LocalArchiver),
            transport: Arc::new(NullTransport),
            notifier: Arc::new(LogNotifier),
            remote: None,
            exclude_patterns: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>, remote: Option<String>) -> Self {
        self.transport = transport;
        self.remote = remote;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    /// Execute one backup run. Incremental is chosen automatically when a
    /// completed Full exists (unless forced), and falls back to Full when
    /// the diff reference is unreliable.
    pub async fn backup(
        &self,
        source_root: &Path,
        force_full: bool,
        cancel: &CancelFlag,
    ) -> Result<RunReport> {
        let _lock = StoreLock::exclusive(&self.store_root)?;
        let lineage = LineageStore::open(&self.store_root)?;
        let store = ObjectStore::open(&self.store_root)?;
        let detector = ChangeSetDetector::new(self.exclude_patterns.clone());

        let (kind, parent_id, files) =
            self.select_run(&lineage, &detector, source_root, force_full)?;
        info!(
            "starting {} backup of {} ({} file(s))",
            kind,
            source_root.display(),
            files.len()
        );

        let node = lineage.create_node(kind, parent_id, self.clock.now())?;
        let report = match self.capture(&lineage, &store, node.id, kind, &files, cancel) {
            Ok(report) => report,
            Err(e) => {
                self.notifier
                    .notify(RunOutcome::Failed, &format!("{} backup aborted: {}", kind, e));
                return Err(e);
            }
        };

        let report = self.finish(&lineage, report)?;
        self.notifier.notify(
            report.outcome,
            &format!(
                "{} backup {}: {} file(s) stored, {} failed",
                kind, report.node_id, report.files_stored, report.files_failed
            ),
        );
        Ok(report)
    }

    /// Decide the run kind, parent linkage and input file set.
    fn select_run(
        &self,
        lineage: &LineageStore,
        detector: &ChangeSetDetector,
        source_root: &Path,
        force_full: bool,
    ) -> Result<(NodeKind, Option<Uuid>, Vec<SourceFile>)> {
        if force_full {
            return Ok((NodeKind::Full, None, detector.scan_all(source_root)?));
        }
        let full = match lineage.latest_full()? {
            Some(full) => full,
            None => {
                debug!("no completed full backup exists; running full");
                return Ok((NodeKind::Full, None, detector.scan_all(source_root)?));
            }
        };

        // Diff against the most recent node in the current full's lineage.
        // If that run crashed before completing, the detector refuses it
        // and we fall back to a fresh full instead of diffing against
        // unreliable state.
        let mut reference = full.clone();
        for sibling in lineage.incrementals_of(&full.id)? {
            if sibling.created_at > reference.created_at {
                reference = sibling;
            }
        }

        match detector.changed_since(source_root, &reference) {
            Ok(files) => Ok((NodeKind::Incremental, Some(full.id), files)),
            Err(VaultError::StaleReference { node }) => {
                warn!(
                    "reference node {} never completed; falling back to full backup",
                    node
                );
                Ok((NodeKind::Full, None, detector.scan_all(source_root)?))
            }
            Err(e) => Err(e),
        }
    }

    /// Hash and store the input files, recording entries against the node.
    /// Hashing and storing of independent files run in parallel; only the
    /// store's create-vs-reference decision is serialized.
    fn capture(
        &self,
        lineage: &LineageStore,
        store: &ObjectStore,
        node_id: Uuid,
        kind: NodeKind,
        files: &[SourceFile],
        cancel: &CancelFlag,
    ) -> Result<RunReport> {
        let results: Vec<(usize, Result<Stored>)> = files
            .par_iter()
            .enumerate()
            .map(|(i, file)| {
                if cancel.is_cancelled() {
                    return (i, Err(VaultError::Cancelled));
                }
                let stored = self
                    .archiver
                    .read(&file.path)
                    .and_then(|bytes| store.put(&bytes));
                (i, stored)
            })
            .collect();

        // Lineage-threatening failures abort the whole run: roll back the
        // stored references and remove the node so nothing partial stays
        // visible.
        let abort = results.iter().find_map(|(_, r)| match r {
            Err(VaultError::Cancelled) => Some(VaultError::Cancelled),
            Err(VaultError::PartialWrite { hash, reason }) => Some(VaultError::PartialWrite {
                hash: hash.clone(),
                reason: reason.clone(),
            }),
            _ => None,
        });
        if let Some(cause) = abort {
            warn!("aborting {} run {}: {}", kind, node_id, cause);
            for (_, result) in &results {
                if let Ok(stored) = result {
                    if let Err(e) = store.release(&stored.hash) {
                        warn!("rollback release failed for {}: {}", stored.hash, e);
                    }
                }
            }
            if let Err(e) = lineage.delete_node(&node_id) {
                warn!("failed to remove aborted node {}: {}", node_id, e);
            }
            return Err(cause);
        }

        let mut node = lineage.node(&node_id)?;
        let mut report = RunReport {
            node_id,
            kind,
            files_stored: 0,
            files_failed: 0,
            bytes_stored: 0,
            bytes_deduped: 0,
            outcome: RunOutcome::Success,
        };

        for (i, result) in results {
            let file = &files[i];
            match result {
                Ok(stored) => {
                    store.link(&stored.hash, &mut node, file.relative_path.clone())?;
                    report.files_stored += 1;
                    if stored.deduplicated {
                        report.bytes_deduped += stored.size;
                    } else {
                        report.bytes_stored += stored.size;
                    }
                    debug!("captured {}", file.relative_path.display());
                }
                Err(e) => {
                    error!("failed to capture {}: {}", file.path.display(), e);
                    report.files_failed += 1;
                }
            }
        }

        node.files_failed = report.files_failed as u32;
        lineage.update(&node)?;
        Ok(report)
    }

    /// Completion, transport push and outcome classification.
    fn finish(&self, lineage: &LineageStore, mut report: RunReport) -> Result<RunReport> {
        if report.files_failed > 0 {
            // The node stays incomplete so later runs never diff against
            // it or build on it.
            report.outcome = RunOutcome::Failed;
            warn!(
                "{} backup {} failed: {}/{} file(s) not captured",
                report.kind,
                report.node_id,
                report.files_failed,
                report.files_stored + report.files_failed
            );
            return Ok(report);
        }

        lineage.mark_complete(&report.node_id, self.clock.now())?;
        info!(
            "{} backup {} complete: {} file(s), {} bytes new, {} bytes deduplicated",
            report.kind, report.node_id, report.files_stored, report.bytes_stored, report.bytes_deduped
        );

        if let Some(remote) = &self.remote {
            let artifact = lineage.record_path(&report.node_id);
            if let Err(e) = self.transport.push(&artifact, remote) {
                // Upload failure never invalidates the completed local node.
                warn!("transport push to {} failed: {}", remote, e);
                report.outcome = RunOutcome::SuccessWithWarnings;
            }
        }
        Ok(report)
    }
}
