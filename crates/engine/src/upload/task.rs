//! Upload task state.

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use model::{AssetId, FolderId, TaskId, VaultId};
use serde::{Deserialize, Serialize};

/// Lifecycle of one upload.
///
/// `Queued -> Uploading -> Finalizing -> Complete`, or `Error` from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Finalizing,
    Complete,
    Error,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Uploading => 1,
            Self::Finalizing => 2,
            Self::Complete | Self::Error => 3,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Uploading => "uploading",
            Self::Finalizing => "finalizing",
            Self::Complete => "complete",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A file picked for upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Local, ephemeral view of one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: TaskId,
    pub vault_id: VaultId,
    pub folder_id: Option<FolderId>,
    pub file_name: String,
    /// Percentage in `0..=100`.
    pub progress: u8,
    pub status: UploadStatus,
    /// 1 for the first run, incremented by every user-initiated retry.
    pub attempt: u32,
    pub error: Option<String>,
    /// Set once the metadata row exists.
    pub asset_id: Option<AssetId>,
    pub created_at: SystemTime,
    /// Enqueue order within the queue.
    pub sequence: u64,
}

impl UploadTask {
    pub fn new(
        vault_id: VaultId,
        folder_id: Option<FolderId>,
        file_name: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            id: TaskId::new(),
            vault_id,
            folder_id,
            file_name: file_name.into(),
            progress: 0,
            status: UploadStatus::Queued,
            attempt: 1,
            error: None,
            asset_id: None,
            created_at: SystemTime::now(),
            sequence,
        }
    }

    /// Moves the task forward.
    ///
    /// Status never goes back and progress never decreases; a terminal
    /// task is left untouched. Returns whether anything changed.
    pub fn advance(&mut self, status: UploadStatus, progress: u8) -> bool {
        if self.status.is_terminal() || status == UploadStatus::Error {
            return false;
        }
        if status.rank() < self.status.rank() {
            return false;
        }

        let progress = progress.min(100).max(self.progress);
        if status == self.status && progress == self.progress {
            return false;
        }

        self.status = status;
        self.progress = progress;
        true
    }

    /// Marks the task failed. Progress stays where it stopped.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = UploadStatus::Error;
        self.error = Some(reason.into());
        true
    }

    /// Starts a new attempt from `Queued`.
    pub(crate) fn restart(&mut self) {
        self.status = UploadStatus::Queued;
        self.progress = 0;
        self.error = None;
        self.attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> UploadTask {
        UploadTask::new(VaultId::new(), None, "a.jpg", 0)
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut t = task();
        assert!(t.advance(UploadStatus::Uploading, 40));
        assert!(!t.advance(UploadStatus::Uploading, 20));
        assert_eq!(t.progress, 40);
        assert!(t.advance(UploadStatus::Finalizing, 85));
        assert!(!t.advance(UploadStatus::Uploading, 90));
        assert_eq!(t.status, UploadStatus::Finalizing);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut t = task();
        t.advance(UploadStatus::Complete, 100);
        assert!(!t.fail("late"));
        assert!(!t.advance(UploadStatus::Uploading, 100));

        let mut t = task();
        t.advance(UploadStatus::Uploading, 10);
        assert!(t.fail("reset"));
        assert!(!t.advance(UploadStatus::Complete, 100));
        assert_eq!(t.status, UploadStatus::Error);
        assert_eq!(t.progress, 10);
    }

    #[test]
    fn test_restart_begins_new_attempt() {
        let mut t = task();
        t.advance(UploadStatus::Uploading, 60);
        t.fail("reset");
        t.restart();
        assert_eq!(t.status, UploadStatus::Queued);
        assert_eq!(t.progress, 0);
        assert_eq!(t.attempt, 2);
        assert!(t.error.is_none());
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut t = task();
        t.advance(UploadStatus::Uploading, 250);
        assert_eq!(t.progress, 100);
    }
}
