//! Concurrent upload queue.
//!
//! Each file gets its own task that runs on its own tokio task, so one
//! failure never affects its siblings. Every state change is an
//! identity-keyed merge into the task map and is broadcast as an
//! [`UploadEvent`]. The queue is independent of any vault session: closing
//! a vault does not abort uploads in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use model::{
    Actor, AssetId, FolderId, MediaAsset, MediaKind, TaskId, UserId, VaultError, VaultId,
    DEFAULT_CONTENT_TYPE,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::task::{UploadFile, UploadStatus, UploadTask};
use crate::auth::MiddlewareChain;
use crate::backend::{BlobStore, ProgressFn, RelationalStore};
use crate::config::UploadConfig;

/// Errors from queue operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("unknown upload task: {0}")]
    UnknownTask(TaskId),

    #[error("upload task {task_id} is {status}; only failed tasks can be retried or dismissed")]
    NotFailed {
        task_id: TaskId,
        status: UploadStatus,
    },

    #[error("file is {size} bytes, limit is {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("payload for upload task {0} is no longer available")]
    PayloadMissing(TaskId),

    #[error(transparent)]
    Remote(#[from] VaultError),
}

/// Change to the set of upload tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Updated(UploadTask),
    Removed(TaskId),
}

/// Counts by state for a progress indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub active: usize,
    pub complete: usize,
    pub failed: usize,
}

impl UploadSummary {
    pub fn total(&self) -> usize {
        self.active + self.complete + self.failed
    }
}

struct Payload {
    file: UploadFile,
    uploader: Option<UserId>,
}

struct QueueInner {
    config: UploadConfig,
    store: Arc<dyn RelationalStore>,
    blobs: Arc<dyn BlobStore>,
    middleware: Arc<MiddlewareChain>,
    tasks: DashMap<TaskId, UploadTask>,
    payloads: DashMap<TaskId, Payload>,
    events: broadcast::Sender<UploadEvent>,
    sequence: AtomicU64,
}

/// Handle to the upload queue. Clones share the same tasks.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

impl UploadQueue {
    pub fn new(
        config: UploadConfig,
        event_buffer: usize,
        store: Arc<dyn RelationalStore>,
        blobs: Arc<dyn BlobStore>,
        middleware: Arc<MiddlewareChain>,
    ) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                blobs,
                middleware,
                tasks: DashMap::new(),
                payloads: DashMap::new(),
                events,
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Creates one task per file and starts them.
    ///
    /// Returns the task ids in file order.
    pub fn enqueue(
        &self,
        files: Vec<UploadFile>,
        vault_id: VaultId,
        folder_id: Option<FolderId>,
        actor: &Actor,
    ) -> Vec<TaskId> {
        let uploader = actor.user_id();
        let mut ids = Vec::with_capacity(files.len());

        for file in files {
            let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
            let task = UploadTask::new(vault_id, folder_id, file.name.clone(), sequence);
            let task_id = task.id;

            tracing::debug!(task_id = %task_id, vault_id = %vault_id, file = %file.name, "Queued upload");

            self.inner.tasks.insert(task_id, task.clone());
            self.inner.payloads.insert(task_id, Payload { file, uploader });
            self.inner.emit(UploadEvent::Updated(task));
            ids.push(task_id);
        }

        for &task_id in &ids {
            QueueInner::start(&self.inner, task_id);
        }

        tracing::info!(vault_id = %vault_id, count = ids.len(), "Enqueued uploads");
        ids
    }

    /// Re-runs a failed task from the beginning.
    pub fn retry(&self, task_id: TaskId) -> Result<(), UploadError> {
        self.require_failed(task_id)?;
        if !self.inner.payloads.contains_key(&task_id) {
            return Err(UploadError::PayloadMissing(task_id));
        }

        // Another handle may have restarted the task since the check above.
        let mut current = None;
        let restarted = self.inner.update(task_id, |task| {
            if task.status != UploadStatus::Error {
                current = Some(task.status);
                return false;
            }
            task.restart();
            true
        });
        if !restarted {
            return Err(match current {
                Some(status) => UploadError::NotFailed { task_id, status },
                None => UploadError::UnknownTask(task_id),
            });
        }
        tracing::info!(task_id = %task_id, "Retrying upload");
        QueueInner::start(&self.inner, task_id);
        Ok(())
    }

    /// Removes a failed task.
    pub fn dismiss(&self, task_id: TaskId) -> Result<(), UploadError> {
        self.require_failed(task_id)?;
        self.inner.remove(task_id);
        Ok(())
    }

    pub fn get(&self, task_id: TaskId) -> Option<UploadTask> {
        self.inner.tasks.get(&task_id).map(|t| t.clone())
    }

    /// All tasks in enqueue order.
    pub fn tasks(&self) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = self.inner.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    pub fn tasks_for_vault(&self, vault_id: VaultId) -> Vec<UploadTask> {
        self.tasks()
            .into_iter()
            .filter(|t| t.vault_id == vault_id)
            .collect()
    }

    pub fn summary(&self) -> UploadSummary {
        let mut summary = UploadSummary::default();
        for task in self.inner.tasks.iter() {
            match task.status {
                UploadStatus::Complete => summary.complete += 1,
                UploadStatus::Error => summary.failed += 1,
                _ => summary.active += 1,
            }
        }
        summary
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    /// Waits until every given task is terminal or gone.
    pub async fn wait_settled(&self, ids: &[TaskId]) {
        let mut events = self.subscribe();
        loop {
            let settled = ids.iter().all(|id| {
                self.inner
                    .tasks
                    .get(id)
                    .map_or(true, |t| t.status.is_terminal())
            });
            if settled {
                return;
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn require_failed(&self, task_id: TaskId) -> Result<(), UploadError> {
        let status = self
            .inner
            .tasks
            .get(&task_id)
            .map(|t| t.status)
            .ok_or(UploadError::UnknownTask(task_id))?;
        if status != UploadStatus::Error {
            return Err(UploadError::NotFailed { task_id, status });
        }
        Ok(())
    }
}

impl QueueInner {
    fn emit(&self, event: UploadEvent) {
        // No receivers is fine; the task map is the source of truth.
        let _ = self.events.send(event);
    }

    /// Applies `f` to one task under its map lock and broadcasts the result
    /// if it changed. Returns whether it did.
    fn update(&self, task_id: TaskId, f: impl FnOnce(&mut UploadTask) -> bool) -> bool {
        let changed = match self.tasks.get_mut(&task_id) {
            Some(mut task) => f(&mut *task).then(|| task.clone()),
            None => None,
        };
        match changed {
            Some(task) => {
                self.emit(UploadEvent::Updated(task));
                true
            }
            None => false,
        }
    }

    fn advance(&self, task_id: TaskId, status: UploadStatus, progress: u8) {
        self.update(task_id, |task| task.advance(status, progress));
    }

    fn fail(&self, task_id: TaskId, reason: &UploadError) {
        tracing::warn!(task_id = %task_id, error = %reason, "Upload failed");
        let reason = reason.to_string();
        self.update(task_id, |task| task.fail(reason));
    }

    fn remove(&self, task_id: TaskId) {
        self.payloads.remove(&task_id);
        if self.tasks.remove(&task_id).is_some() {
            self.emit(UploadEvent::Removed(task_id));
        }
    }

    /// Starts a queued task, rejecting oversized files without transfer.
    fn start(inner: &Arc<Self>, task_id: TaskId) {
        let size = inner.payloads.get(&task_id).map(|p| p.file.size());
        let Some(size) = size else {
            inner.fail(task_id, &UploadError::PayloadMissing(task_id));
            return;
        };

        let limit = inner.config.max_file_size;
        if size > limit {
            inner.fail(task_id, &UploadError::FileTooLarge { size, limit });
            return;
        }

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            inner.run(task_id).await;
        });
    }

    async fn run(self: Arc<Self>, task_id: TaskId) {
        let Some((file, uploader)) = self
            .payloads
            .get(&task_id)
            .map(|p| (p.file.clone(), p.uploader))
        else {
            self.fail(task_id, &UploadError::PayloadMissing(task_id));
            return;
        };
        let Some((vault_id, folder_id)) =
            self.tasks.get(&task_id).map(|t| (t.vault_id, t.folder_id))
        else {
            return;
        };

        self.advance(task_id, UploadStatus::Uploading, 0);

        let content_type = file
            .content_type
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let storage_path = format!("{}/{}-{}", vault_id, Uuid::new_v4().simple(), file.name);

        let url = match self.transfer(task_id, &file, &storage_path, &content_type).await {
            Ok(url) => url,
            Err(e) => {
                self.middleware.observe(&e).await;
                self.fail(task_id, &UploadError::Remote(e));
                return;
            }
        };

        self.advance(task_id, UploadStatus::Finalizing, self.config.transfer_ceiling);

        let asset = MediaAsset {
            id: AssetId::new(),
            vault_id,
            folder_id,
            uploader_id: uploader,
            url,
            storage_path: storage_path.clone(),
            file_name: file.name.clone(),
            kind: MediaKind::classify(&file.name, &content_type),
            size_bytes: file.size(),
            like_count: 0,
            created_at: SystemTime::now(),
        };
        let asset_id = asset.id;

        if let Err(e) = self.store.insert_asset(asset).await {
            self.middleware.observe(&e).await;
            if let Err(cleanup) = self.blobs.remove(vec![storage_path]).await {
                tracing::warn!(task_id = %task_id, error = %cleanup, "Failed to remove orphaned blob");
            }
            self.fail(task_id, &UploadError::Remote(e));
            return;
        }

        self.update(task_id, |task| {
            task.asset_id = Some(asset_id);
            task.advance(UploadStatus::Finalizing, self.config.finalize_ceiling);
            true
        });

        // Give the change feed time to deliver the new asset before the
        // task reports completion.
        tokio::time::sleep(self.config.stabilization_delay()).await;

        self.advance(task_id, UploadStatus::Complete, 100);
        self.payloads.remove(&task_id);
        tracing::info!(task_id = %task_id, vault_id = %vault_id, file = %file.name, "Upload complete");

        tokio::time::sleep(self.config.completion_display()).await;
        let still_complete = self
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.status == UploadStatus::Complete);
        if still_complete {
            self.remove(task_id);
            tracing::debug!(task_id = %task_id, "Evicted completed upload");
        }
    }

    /// Sends the bytes, retrying transient failures with backoff.
    async fn transfer(
        self: &Arc<Self>,
        task_id: TaskId,
        file: &UploadFile,
        storage_path: &str,
        content_type: &str,
    ) -> Result<String, VaultError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = self
                .blobs
                .upload(
                    storage_path.to_string(),
                    file.bytes.clone(),
                    content_type.to_string(),
                    self.progress_fn(task_id),
                )
                .await;

            match result {
                Ok(url) => return Ok(url),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = self.config.backoff_for(attempt);
                    tracing::warn!(
                        task_id = %task_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transfer failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Maps transfer progress onto `0..=transfer_ceiling`.
    fn progress_fn(self: &Arc<Self>, task_id: TaskId) -> ProgressFn {
        let inner = Arc::downgrade(self);
        let ceiling = u64::from(self.config.transfer_ceiling);
        Arc::new(move |sent, total| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let percent = if total == 0 {
                ceiling
            } else {
                sent.min(total) * ceiling / total
            };
            tracing::trace!(task_id = %task_id, percent, "Transfer progress");
            inner.advance(task_id, UploadStatus::Uploading, percent as u8);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBlobStore, MemoryStore};
    use model::GuestId;
    use std::collections::HashMap;
    use std::time::Duration;

    fn queue_with(config: UploadConfig) -> (UploadQueue, MemoryStore, MemoryBlobStore) {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        let queue = UploadQueue::new(
            config,
            256,
            Arc::new(store.clone()),
            Arc::new(blobs.clone()),
            MiddlewareChain::new(),
        );
        (queue, store, blobs)
    }

    fn guest() -> Actor {
        Actor::Anonymous(GuestId::new())
    }

    fn files(names: &[&str]) -> Vec<UploadFile> {
        names
            .iter()
            .map(|n| UploadFile::new(*n, vec![7u8; 64]))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_file_gets_one_task_and_one_terminal_state() {
        let (queue, store, blobs) = queue_with(UploadConfig::default());
        let mut events = queue.subscribe();
        blobs.fail_upload("bad.jpg");
        let vault = VaultId::new();

        let ids = queue.enqueue(files(&["a.jpg", "bad.jpg", "c.mp4"]), vault, None, &guest());
        assert_eq!(ids.len(), 3);
        queue.wait_settled(&ids).await;

        let mut terminal: HashMap<TaskId, Vec<UploadStatus>> = HashMap::new();
        let mut last_progress: HashMap<TaskId, u8> = HashMap::new();
        while let Ok(event) = events.try_recv() {
            if let UploadEvent::Updated(task) = event {
                let last = last_progress.entry(task.id).or_insert(0);
                assert!(task.progress >= *last, "progress went back for {}", task.file_name);
                *last = task.progress;
                if task.status.is_terminal() {
                    terminal.entry(task.id).or_default().push(task.status);
                }
            }
        }

        assert_eq!(terminal.len(), 3);
        assert!(terminal.values().all(|s| s.len() == 1));
        assert_eq!(terminal[&ids[1]], vec![UploadStatus::Error]);
        assert_eq!(store.asset_count(vault), 2);
        assert_eq!(queue.summary().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_tasks_are_evicted_errors_persist() {
        let (queue, _store, blobs) = queue_with(UploadConfig::default());
        blobs.fail_upload("bad.jpg");

        let ids = queue.enqueue(files(&["ok.jpg", "bad.jpg"]), VaultId::new(), None, &guest());
        queue.wait_settled(&ids).await;
        assert_eq!(queue.get(ids[0]).map(|t| t.progress), Some(100));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(queue.get(ids[0]).is_none());
        assert_eq!(queue.get(ids[1]).map(|t| t.status), Some(UploadStatus::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_file_fails_without_transfer() {
        let config = UploadConfig {
            max_file_size: 10,
            ..UploadConfig::default()
        };
        let (queue, _store, blobs) = queue_with(config);

        let ids = queue.enqueue(files(&["big.jpg"]), VaultId::new(), None, &guest());
        let task = queue.get(ids[0]).unwrap();
        assert_eq!(task.status, UploadStatus::Error);
        assert!(task.error.unwrap().contains("limit"));
        assert_eq!(blobs.upload_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_failure_marks_only_that_task() {
        let (queue, store, blobs) = queue_with(UploadConfig::default());
        store.fail_asset_insert("b.jpg").unwrap();
        let vault = VaultId::new();

        let ids = queue.enqueue(files(&["a.jpg", "b.jpg"]), vault, None, &guest());
        queue.wait_settled(&ids).await;

        assert_eq!(queue.get(ids[0]).unwrap().status, UploadStatus::Complete);
        assert_eq!(queue.get(ids[1]).unwrap().status, UploadStatus::Error);
        assert_eq!(blobs.object_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_and_dismiss() {
        let (queue, store, blobs) = queue_with(UploadConfig::default());
        blobs.fail_upload_transiently("flaky.jpg", 1);
        let vault = VaultId::new();

        let ids = queue.enqueue(files(&["flaky.jpg"]), vault, None, &guest());
        queue.wait_settled(&ids).await;
        assert_eq!(queue.get(ids[0]).unwrap().status, UploadStatus::Error);

        queue.retry(ids[0]).unwrap();
        queue.wait_settled(&ids).await;
        let task = queue.get(ids[0]).unwrap();
        assert_eq!(task.status, UploadStatus::Complete);
        assert_eq!(task.attempt, 2);
        assert_eq!(store.asset_count(vault), 1);

        assert_eq!(
            queue.retry(ids[0]),
            Err(UploadError::NotFailed {
                task_id: ids[0],
                status: UploadStatus::Complete
            })
        );

        blobs.fail_upload("gone.jpg");
        let failed = queue.enqueue(files(&["gone.jpg"]), vault, None, &guest());
        queue.wait_settled(&failed).await;
        queue.dismiss(failed[0]).unwrap();
        assert!(queue.get(failed[0]).is_none());
        assert_eq!(queue.dismiss(failed[0]), Err(UploadError::UnknownTask(failed[0])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_retries_restart_task_once() {
        let config = UploadConfig {
            stabilization_delay_ms: 10,
            completion_display_ms: 60_000,
            ..UploadConfig::default()
        };
        let (queue, store, blobs) = queue_with(config);
        blobs.fail_upload_transiently("flaky.jpg", 1);
        let vault = VaultId::new();

        let ids = queue.enqueue(files(&["flaky.jpg"]), vault, None, &guest());
        queue.wait_settled(&ids).await;
        assert_eq!(queue.get(ids[0]).unwrap().status, UploadStatus::Error);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                let task_id = ids[0];
                tokio::spawn(async move { queue.retry(task_id) })
            })
            .collect();
        let mut restarted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => restarted += 1,
                Err(err) => assert!(matches!(err, UploadError::NotFailed { .. }), "{err}"),
            }
        }
        assert_eq!(restarted, 1);

        queue.wait_settled(&ids).await;
        let task = queue.get(ids[0]).unwrap();
        assert_eq!(task.status, UploadStatus::Complete);
        assert_eq!(task.attempt, 2);
        assert_eq!(store.asset_count(vault), 1);
        assert_eq!(blobs.upload_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_backoff_retries_transient_failures() {
        let config = UploadConfig {
            max_attempts: 3,
            ..UploadConfig::default()
        };
        let (queue, _store, blobs) = queue_with(config);
        blobs.fail_upload_transiently("flaky.jpg", 2);

        let ids = queue.enqueue(files(&["flaky.jpg"]), VaultId::new(), None, &guest());
        queue.wait_settled(&ids).await;

        assert_eq!(queue.get(ids[0]).unwrap().status, UploadStatus::Complete);
        assert_eq!(blobs.upload_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failures_are_not_retried() {
        let config = UploadConfig {
            max_attempts: 3,
            ..UploadConfig::default()
        };
        let (queue, _store, blobs) = queue_with(config);
        blobs.fail_upload("bad.jpg");

        let ids = queue.enqueue(files(&["bad.jpg"]), VaultId::new(), None, &guest());
        queue.wait_settled(&ids).await;
        assert_eq!(blobs.upload_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticated_uploader_is_recorded() {
        let (queue, store, _blobs) = queue_with(UploadConfig::default());
        let vault = VaultId::new();
        let user = UserId::new();

        let ids = queue.enqueue(
            vec![UploadFile::new("doc.pdf", vec![1u8; 4])],
            vault,
            None,
            &Actor::Authenticated(user),
        );
        queue.wait_settled(&ids).await;

        let assets = crate::backend::RelationalStore::list_assets(&store, vault, None)
            .await
            .unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].uploader_id, Some(user));
        assert_eq!(assets[0].kind, MediaKind::File);
        assert!(assets[0].storage_path.starts_with(&vault.to_string()));
        assert!(assets[0].storage_path.ends_with("-doc.pdf"));
    }
}
