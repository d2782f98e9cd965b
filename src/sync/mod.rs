//! Sync orchestration contract.
//!
//! The types here tie connector output to the caller's persistence layer:
//! [`SyncResult`] summarizes one sync run including validation metrics, and
//! [`SyncMode`] encodes the UIDVALIDITY decision: a mismatch against the
//! stored checkpoint invalidates every cached UID and forces a full resync
//! (RFC 3501 §2.3.1.1).
//!
//! The connector never persists checkpoints itself; it reports the values
//! the caller needs to store ([`FolderCheckpoint`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Complete mailbox sync, ignoring checkpoints.
    Full,
    /// Sync of changes since the last checkpoint or timestamp.
    Incremental,
    /// User-initiated sync (treated as incremental for search criteria).
    Manual,
}

/// A contiguous run of missing UIDs detected in a fetch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidGap {
    /// First missing UID.
    pub start: u32,
    /// Last missing UID.
    pub end: u32,
}

/// Mailbox-coverage metrics for one sync run.
///
/// Silent truncation is the primary correctness risk of incremental sync, so
/// any configured limit that drops messages must be recorded here rather
/// than swallowed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationMetrics {
    /// Total messages the mailbox reported (EXISTS / resultSizeEstimate).
    pub total_emails_in_mailbox: u64,
    /// Messages matching the search criteria (date range etc.).
    pub emails_within_date_range: u64,
    /// Messages dropped because a configured limit truncated the run.
    pub emails_missing_due_to_limits: u64,
    /// Human-readable warnings; non-empty whenever messages were dropped.
    pub warnings: Vec<String>,
    /// Non-contiguous UID runs observed in the fetched sequence.
    pub detected_gaps: Vec<UidGap>,
}

/// Aggregate record describing one sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    /// Unique identifier for this run.
    pub id: Uuid,
    /// Kind of sync performed.
    pub sync_type: SyncType,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished; `None` while in flight.
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether the run completed without a fatal error.
    pub success: bool,
    /// Messages yielded to the caller.
    pub emails_processed: u64,
    /// Messages the caller had not seen before.
    pub emails_added: u64,
    /// Messages whose flags/labels changed.
    pub emails_updated: u64,
    /// Messages skipped due to per-message fetch/parse failures.
    pub emails_skipped: u64,
    /// Attachment metadata entries catalogued.
    pub attachments_catalogued: u64,
    /// Fatal error message, if the run failed.
    pub error_message: Option<String>,
    /// Structured error context, if the run failed.
    pub error_details: Option<serde_json::Value>,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
    /// Mailbox-coverage metrics.
    pub validation: ValidationMetrics,
}

impl SyncResult {
    /// Creates a result for a run starting now.
    pub fn start(sync_type: SyncType) -> Self {
        Self {
            id: Uuid::new_v4(),
            sync_type,
            started_at: Utc::now(),
            completed_at: None,
            success: false,
            emails_processed: 0,
            emails_added: 0,
            emails_updated: 0,
            emails_skipped: 0,
            attachments_catalogued: 0,
            error_message: None,
            error_details: None,
            duration_ms: 0,
            validation: ValidationMetrics::default(),
        }
    }

    /// Marks the run as completed successfully.
    pub fn complete(&mut self) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.completed_at = Some(now);
        self.success = true;
    }

    /// Marks the run as failed with the given error.
    pub fn fail(&mut self, message: impl Into<String>) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.completed_at = Some(now);
        self.success = false;
        self.error_message = Some(message.into());
    }

    /// Records that a configured limit truncated the run.
    ///
    /// Maintains the invariant
    /// `emails_missing_due_to_limits == max(0, found - to_process)` and emits
    /// a warning whenever messages were dropped, so callers can always detect
    /// an incomplete sync.
    pub fn record_truncation(&mut self, folder: &str, found: u64, to_process: u64) {
        self.validation.emails_within_date_range += found;
        if found > to_process {
            let missing = found - to_process;
            self.validation.emails_missing_due_to_limits += missing;
            self.validation.warnings.push(format!(
                "{}: {} of {} matching messages dropped by configured limit (oldest first)",
                folder, missing, found
            ));
        }
    }

    /// Records folders left entirely unsynced because the message cap ran
    /// out before reaching them.
    ///
    /// Their contents were never searched, so no count can be added to
    /// `emails_missing_due_to_limits`; the warning keeps the loss visible.
    pub fn record_skipped_folders(&mut self, folders: &[String]) {
        if folders.is_empty() {
            return;
        }
        self.validation.warnings.push(format!(
            "message cap exhausted before syncing folders: {}",
            folders.join(", ")
        ));
    }

    /// Returns true if the run dropped messages or hit per-message failures.
    pub fn has_warnings(&self) -> bool {
        !self.validation.warnings.is_empty()
    }
}

/// Finds non-contiguous runs in a sequence of UIDs.
///
/// The input may be in any order; gaps are reported ascending. A gap between
/// fetched UIDs usually means expunged messages, but after a run with
/// per-message skips it can also flag messages the caller never received.
pub fn detect_gaps(uids: &[u32]) -> Vec<UidGap> {
    let mut sorted: Vec<u32> = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut gaps = Vec::new();
    for pair in sorted.windows(2) {
        if pair[1] - pair[0] > 1 {
            gaps.push(UidGap {
                start: pair[0] + 1,
                end: pair[1] - 1,
            });
        }
    }
    gaps
}

/// Caller-persisted per-folder sync checkpoint.
///
/// Stored after each successful run and compared against a fresh folder
/// status on the next run to choose between full and incremental sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderCheckpoint {
    /// Folder this checkpoint covers.
    pub folder: String,
    /// UIDVALIDITY observed when the checkpoint was taken.
    pub uid_validity: u32,
    /// Highest UID successfully processed.
    pub last_uid: u32,
    /// When the checkpoint was taken.
    pub synced_at: DateTime<Utc>,
}

/// The sync strategy chosen for a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Fetch everything; any stored UIDs are invalid or absent.
    Full,
    /// Fetch UIDs above the checkpoint.
    Incremental {
        /// Highest UID already processed.
        last_uid: u32,
    },
}

impl SyncMode {
    /// Chooses the sync strategy for a folder.
    ///
    /// A UIDVALIDITY mismatch means the mailbox was reset or recreated;
    /// every previously stored UID is invalid and a full resync is
    /// mandatory. No checkpoint likewise means full.
    pub fn decide(checkpoint: Option<&FolderCheckpoint>, current_uid_validity: u32) -> Self {
        match checkpoint {
            Some(cp) if cp.uid_validity == current_uid_validity => SyncMode::Incremental {
                last_uid: cp.last_uid,
            },
            Some(cp) => {
                tracing::warn!(
                    folder = %cp.folder,
                    stored = cp.uid_validity,
                    current = current_uid_validity,
                    "UIDVALIDITY changed; stored UIDs invalidated, full resync required"
                );
                SyncMode::Full
            }
            None => SyncMode::Full,
        }
    }
}
