//! Staged progress reporting for long-running operations.
//!
//! Snapshot transfer, archive import and body backfill report through a
//! [`ProgressReporter`]. Consumers either hold the paired [`ProgressReceiver`]
//! or poll [`ProgressReporter::latest`].
//!
//! Progress never regresses: updates for an earlier stage, or with a smaller
//! `completed` count within the current stage, are dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use ts_rs::TS;

/// Discrete stages of a bootstrap flow, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum BootstrapStage {
    /// Registry lookup and parameter checks
    Preparing,
    /// Removing local files before a server download
    ClearingLocal,
    /// Tombstoning known entries
    Tombstoning,
    /// Building a snapshot of local files
    Exporting,
    /// Sending a snapshot to the server
    Uploading,
    /// Fetching the server snapshot
    Downloading,
    /// Writing archive entries into the local store
    ImportingFiles,
    /// Seeding the replicas from local files
    InitializingState,
    /// Opening the sync channels
    Connecting,
    /// Waiting for the metadata handshake
    SyncingMetadata,
    /// Pushing and pulling entry bodies
    SyncingBodies,
    /// Flow finished
    Complete,
}

impl BootstrapStage {
    /// Get a human-readable description of this stage
    pub fn description(&self) -> &'static str {
        match self {
            BootstrapStage::Preparing => "Preparing...",
            BootstrapStage::ClearingLocal => "Clearing local files...",
            BootstrapStage::Tombstoning => "Marking local entries deleted...",
            BootstrapStage::Exporting => "Packing workspace...",
            BootstrapStage::Uploading => "Uploading snapshot...",
            BootstrapStage::Downloading => "Downloading snapshot...",
            BootstrapStage::ImportingFiles => "Importing files...",
            BootstrapStage::InitializingState => "Loading workspace...",
            BootstrapStage::Connecting => "Connecting...",
            BootstrapStage::SyncingMetadata => "Syncing file list...",
            BootstrapStage::SyncingBodies => "Syncing content...",
            BootstrapStage::Complete => "Done",
        }
    }
}

/// One progress update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Progress {
    /// Current stage
    pub stage: BootstrapStage,
    /// Units finished in this stage (files or bytes)
    pub completed: u64,
    /// Units expected in this stage, 0 when unknown
    pub total: u64,
    /// Optional detail (e.g., the file being processed)
    pub message: Option<String>,
}

impl Progress {
    /// Completion of the current stage in percent, if the total is known.
    pub fn percent(&self) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        Some(((self.completed * 100) / self.total).min(100) as u8)
    }
}

/// Sending half of a progress channel. Cheap to clone.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    latest: Arc<Mutex<Option<Progress>>>,
    tx: Option<mpsc::UnboundedSender<Progress>>,
}

impl ProgressReporter {
    /// Create a reporter and the receiver that observes it.
    pub fn channel() -> (Self, ProgressReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self {
            latest: Arc::new(Mutex::new(None)),
            tx: Some(tx),
        };
        (reporter, ProgressReceiver { rx })
    }

    /// A reporter nobody listens to. [`Self::latest`] still works.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Enter `stage` without a known total.
    pub fn stage(&self, stage: BootstrapStage) {
        self.report(stage, 0, 0, Some(stage.description().to_string()));
    }

    /// Report `completed` of `total` units in `stage`.
    ///
    /// Returns `false` if the update was dropped because it would regress.
    pub fn report(
        &self,
        stage: BootstrapStage,
        completed: u64,
        total: u64,
        message: Option<String>,
    ) -> bool {
        let completed = if total > 0 { completed.min(total) } else { completed };
        let progress = Progress {
            stage,
            completed,
            total,
            message,
        };

        {
            let mut latest = self.latest.lock();
            if let Some(prev) = latest.as_ref()
                && (stage < prev.stage || (stage == prev.stage && completed < prev.completed))
            {
                log::debug!(
                    "[Bootstrap] Dropping regressing progress {:?} {}/{}",
                    stage,
                    completed,
                    total
                );
                return false;
            }
            *latest = Some(progress.clone());
        }

        if let Some(tx) = &self.tx {
            // Receiver gone just means nobody is watching
            let _ = tx.send(progress);
        }
        true
    }

    /// The most recent accepted update.
    pub fn latest(&self) -> Option<Progress> {
        self.latest.lock().clone()
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("latest", &self.latest())
            .finish()
    }
}

/// Receiving half of a progress channel.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<Progress>,
}

impl ProgressReceiver {
    /// Wait for the next update. `None` once every reporter is dropped.
    pub async fn recv(&mut self) -> Option<Progress> {
        self.rx.recv().await
    }

    /// Take every update that is already buffered.
    pub fn drain(&mut self) -> Vec<Progress> {
        let mut out = Vec::new();
        while let Ok(progress) = self.rx.try_recv() {
            out.push(progress);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_never_regresses() {
        let (reporter, mut rx) = ProgressReporter::channel();
        assert!(reporter.report(BootstrapStage::Downloading, 10, 100, None));
        assert!(!reporter.report(BootstrapStage::Downloading, 5, 100, None));
        assert!(!reporter.report(BootstrapStage::Preparing, 0, 0, None));
        assert!(reporter.report(BootstrapStage::ImportingFiles, 0, 3, None));

        let updates = rx.drain();
        assert_eq!(updates.len(), 2);
        assert!(updates.windows(2).all(|w| w[0].stage <= w[1].stage));
    }

    #[test]
    fn test_completed_is_clamped() {
        let reporter = ProgressReporter::noop();
        reporter.report(BootstrapStage::Uploading, 150, 100, None);
        let latest = reporter.latest().unwrap();
        assert_eq!(latest.completed, 100);
        assert_eq!(latest.percent(), Some(100));
    }

    #[test]
    fn test_unknown_total_is_not_clamped() {
        let (reporter, mut rx) = ProgressReporter::channel();
        assert!(reporter.report(BootstrapStage::Downloading, 0, 0, None));
        assert!(reporter.report(BootstrapStage::Downloading, 512, 0, None));
        assert!(reporter.report(BootstrapStage::Downloading, 2048, 0, None));

        let latest = reporter.latest().unwrap();
        assert_eq!(latest.completed, 2048);
        assert_eq!(latest.percent(), None);
        assert_eq!(rx.drain().len(), 3);
    }

    #[test]
    fn test_clones_share_ordering() {
        let (a, mut rx) = ProgressReporter::channel();
        let b = a.clone();
        a.stage(BootstrapStage::SyncingBodies);
        assert!(!b.report(BootstrapStage::Connecting, 1, 1, None));
        assert_eq!(rx.drain().len(), 1);
        assert_eq!(b.latest().unwrap().stage, BootstrapStage::SyncingBodies);
    }
}
