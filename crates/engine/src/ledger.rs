//! Optimistic deletes with rollback.
//!
//! [`optimistic`] is the general pattern: snapshot the local state, apply
//! the change locally, run the remote call, and restore the snapshot if the
//! remote call fails. [`MutationLedger::delete_items`] uses it for single
//! and bulk deletes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use model::{AssetId, Folder, FolderId, MediaAsset, Result, VaultId};
use serde::Serialize;

use crate::auth::MiddlewareChain;
use crate::backend::{BlobStore, RelationalStore};
use crate::collection::{CollectionView, Listing};
use crate::selection::SelectionModel;

/// State that can be snapshotted and restored around a remote call.
pub trait OptimisticState {
    type Snapshot: Send;

    fn snapshot(&self) -> Self::Snapshot;

    fn restore(&self, snapshot: Self::Snapshot);
}

/// Applies a change locally before `remote` confirms it.
///
/// On success the local change stands. On failure the state is restored to
/// the snapshot taken before `apply`, strictly after the remote call has
/// failed, and the error is returned.
pub async fn optimistic<S, T, A, F, Fut>(state: &S, apply: A, remote: F) -> Result<T>
where
    S: OptimisticState + ?Sized,
    A: FnOnce(&S),
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let snapshot = state.snapshot();
    apply(state);

    match remote().await {
        Ok(value) => Ok(value),
        Err(e) => {
            state.restore(snapshot);
            Err(e)
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The local collection and selection of one opened vault.
pub struct LocalState {
    collection: Mutex<CollectionView>,
    selection: Mutex<SelectionModel>,
}

/// Snapshot of [`LocalState`].
#[derive(Debug, Clone)]
pub struct LocalSnapshot {
    scope: Option<FolderId>,
    listing: Listing,
    selection: SelectionModel,
}

impl LocalState {
    pub fn new(collection: CollectionView) -> Self {
        Self {
            collection: Mutex::new(collection),
            selection: Mutex::new(SelectionModel::new()),
        }
    }

    pub fn collection(&self) -> MutexGuard<'_, CollectionView> {
        lock(&self.collection)
    }

    pub fn selection(&self) -> MutexGuard<'_, SelectionModel> {
        lock(&self.selection)
    }
}

impl OptimisticState for LocalState {
    type Snapshot = LocalSnapshot;

    fn snapshot(&self) -> LocalSnapshot {
        let collection = self.collection();
        LocalSnapshot {
            scope: collection.folder_id(),
            listing: collection.listing(),
            selection: self.selection().clone(),
        }
    }

    fn restore(&self, snapshot: LocalSnapshot) {
        let mut collection = self.collection();
        // A navigation in the meantime already replaced the listing.
        if collection.folder_id() != snapshot.scope {
            return;
        }
        collection.replace(snapshot.listing);
        *self.selection() = snapshot.selection;
    }
}

/// What a committed delete removed remotely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub assets_deleted: usize,
    pub folders_deleted: usize,
    /// Backing objects may have been left behind.
    pub blob_removal_failed: bool,
}

/// Runs deletes against the remote store with local rollback.
pub struct MutationLedger {
    store: Arc<dyn RelationalStore>,
    blobs: Arc<dyn BlobStore>,
    middleware: Arc<MiddlewareChain>,
}

impl MutationLedger {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        blobs: Arc<dyn BlobStore>,
        middleware: Arc<MiddlewareChain>,
    ) -> Self {
        Self {
            store,
            blobs,
            middleware,
        }
    }

    /// Deletes assets and folders.
    ///
    /// Ids not present in the local view are ignored. The items leave the
    /// view and the selection before any remote call. Folders are deleted
    /// together with every descendant folder and every asset inside them.
    /// Blob removal is best-effort; if the metadata delete fails the view
    /// and selection are restored and the error is returned.
    pub async fn delete_items(
        &self,
        local: &LocalState,
        asset_ids: &[AssetId],
        folder_ids: &[FolderId],
    ) -> Result<DeleteOutcome> {
        let (vault_id, assets, folders) = {
            let view = local.collection();
            let assets: Vec<MediaAsset> = asset_ids
                .iter()
                .filter_map(|id| view.file(*id).cloned())
                .collect();
            let folders: Vec<FolderId> = folder_ids
                .iter()
                .copied()
                .filter(|id| view.contains_folder(*id))
                .collect();
            (view.vault_id(), assets, folders)
        };

        if assets.is_empty() && folders.is_empty() {
            tracing::debug!(vault_id = %vault_id, "Nothing to delete");
            return Ok(DeleteOutcome::default());
        }

        let local_assets: Vec<AssetId> = assets.iter().map(|a| a.id).collect();
        let local_folders = folders.clone();

        let result = optimistic(
            local,
            |state| {
                state.collection().remove(&local_assets, &local_folders);
                state.selection().remove(&local_assets, &local_folders);
            },
            || self.commit(vault_id, assets, folders),
        )
        .await;

        match result {
            Ok(outcome) => {
                local.selection().clear();
                tracing::info!(
                    vault_id = %vault_id,
                    assets = outcome.assets_deleted,
                    folders = outcome.folders_deleted,
                    "Delete committed"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(vault_id = %vault_id, error = %e, "Delete failed, local view rolled back");
                self.middleware.observe(&e).await;
                Err(e)
            }
        }
    }

    async fn commit(
        &self,
        vault_id: VaultId,
        mut assets: Vec<MediaAsset>,
        folders: Vec<FolderId>,
    ) -> Result<DeleteOutcome> {
        let folder_ids = if folders.is_empty() {
            Vec::new()
        } else {
            let all = self.store.all_folders(vault_id).await?;
            let folder_ids = descendants(&folders, &all);
            let nested = self.store.assets_in_folders(folder_ids.clone()).await?;

            let mut seen: HashSet<AssetId> = assets.iter().map(|a| a.id).collect();
            assets.extend(nested.into_iter().filter(|a| seen.insert(a.id)));
            folder_ids
        };

        let mut outcome = DeleteOutcome::default();

        let paths: Vec<String> = assets.iter().map(|a| a.storage_path.clone()).collect();
        if !paths.is_empty() {
            if let Err(e) = self.blobs.remove(paths).await {
                tracing::warn!(vault_id = %vault_id, error = %e, "Blob removal failed, objects may be orphaned");
                self.middleware.observe(&e).await;
                outcome.blob_removal_failed = true;
            }
        }

        let asset_ids: Vec<AssetId> = assets.iter().map(|a| a.id).collect();
        if !asset_ids.is_empty() {
            self.store.delete_assets(asset_ids.clone()).await?;
            outcome.assets_deleted = asset_ids.len();
        }

        if !folder_ids.is_empty() {
            // Children first.
            let ordered: Vec<FolderId> = folder_ids.iter().rev().copied().collect();
            self.store.delete_folders(ordered).await?;
            outcome.folders_deleted = folder_ids.len();
        }

        Ok(outcome)
    }
}

/// `roots` and every folder below them, parents before children.
pub fn descendants(roots: &[FolderId], all: &[Folder]) -> Vec<FolderId> {
    let mut children: HashMap<FolderId, Vec<FolderId>> = HashMap::new();
    for folder in all {
        if let Some(parent) = folder.parent_id {
            children.entry(parent).or_default().push(folder.id);
        }
    }

    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<FolderId> = roots.iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        order.push(id);
        if let Some(kids) = children.get(&id) {
            queue.extend(kids.iter().copied());
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBlobStore, MemoryStore};
    use model::{MediaKind, VaultError};
    use std::time::SystemTime;

    struct Counter(Mutex<i32>);

    impl OptimisticState for Counter {
        type Snapshot = i32;

        fn snapshot(&self) -> i32 {
            *lock(&self.0)
        }

        fn restore(&self, snapshot: i32) {
            *lock(&self.0) = snapshot;
        }
    }

    #[tokio::test]
    async fn test_optimistic_restores_on_failure() {
        let counter = Counter(Mutex::new(1));

        let result: Result<()> = optimistic(
            &counter,
            |c| *lock(&c.0) = 5,
            || async { Err(VaultError::TransientNetwork("reset".into())) },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(*lock(&counter.0), 1);

        optimistic(&counter, |c| *lock(&c.0) = 7, || async { Ok::<(), VaultError>(()) })
            .await
            .unwrap();
        assert_eq!(*lock(&counter.0), 7);
    }

    #[test]
    fn test_descendants_walks_whole_subtree() {
        let vault = VaultId::new();
        let root = Folder::new(vault, None, "root");
        let child = Folder::new(vault, Some(root.id), "child");
        let grandchild = Folder::new(vault, Some(child.id), "grandchild");
        let sibling = Folder::new(vault, None, "sibling");
        let all = vec![grandchild.clone(), sibling, child.clone(), root.clone()];

        assert_eq!(
            descendants(&[root.id], &all),
            vec![root.id, child.id, grandchild.id]
        );
    }

    fn asset(vault_id: VaultId, folder_id: Option<FolderId>, name: &str) -> MediaAsset {
        MediaAsset {
            id: AssetId::new(),
            vault_id,
            folder_id,
            uploader_id: None,
            url: format!("memory://media/{}/{}", vault_id, name),
            storage_path: format!("{}/{}", vault_id, name),
            file_name: name.to_string(),
            kind: MediaKind::Image,
            size_bytes: 1,
            like_count: 0,
            created_at: SystemTime::now(),
        }
    }

    fn ledger(store: &MemoryStore, blobs: &MemoryBlobStore) -> MutationLedger {
        MutationLedger::new(
            Arc::new(store.clone()),
            Arc::new(blobs.clone()),
            MiddlewareChain::new(),
        )
    }

    #[tokio::test]
    async fn test_absent_ids_are_a_no_op() {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        let local = LocalState::new(CollectionView::new(VaultId::new(), "v"));

        let outcome = ledger(&store, &blobs)
            .delete_items(&local, &[AssetId::new()], &[FolderId::new()])
            .await
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::default());
    }

    #[tokio::test]
    async fn test_blob_failure_is_not_fatal() {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        let vault = VaultId::new();
        let a = asset(vault, None, "a.jpg");
        store.seed_asset(a.clone()).unwrap();
        let mut view = CollectionView::new(vault, "v");
        view.replace(Listing {
            folders: Vec::new(),
            files: vec![a.clone()],
        });
        let local = LocalState::new(view);
        blobs.fail_removal(true);

        let outcome = ledger(&store, &blobs)
            .delete_items(&local, &[a.id], &[])
            .await
            .unwrap();
        assert!(outcome.blob_removal_failed);
        assert_eq!(outcome.assets_deleted, 1);
        assert!(!store.contains_asset(a.id));
        assert!(local.collection().files().is_empty());
    }

    #[tokio::test]
    async fn test_folder_delete_cascades() {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        let vault = VaultId::new();
        let top = Folder::new(vault, None, "top");
        let nested = Folder::new(vault, Some(top.id), "nested");
        let deep = asset(vault, Some(nested.id), "deep.jpg");
        let kept = asset(vault, None, "kept.jpg");
        store.seed_folder(top.clone()).unwrap();
        store.seed_folder(nested.clone()).unwrap();
        store.seed_asset(deep.clone()).unwrap();
        store.seed_asset(kept.clone()).unwrap();

        let mut view = CollectionView::new(vault, "v");
        view.replace(Listing {
            folders: vec![top.clone()],
            files: vec![kept.clone()],
        });
        let local = LocalState::new(view);

        let outcome = ledger(&store, &blobs)
            .delete_items(&local, &[], &[top.id])
            .await
            .unwrap();

        assert_eq!(outcome.folders_deleted, 2);
        assert_eq!(outcome.assets_deleted, 1);
        assert!(!store.contains_folder(nested.id));
        assert!(!store.contains_asset(deep.id));
        assert!(store.contains_asset(kept.id));
    }

    #[tokio::test]
    async fn test_restore_skipped_after_navigation() {
        let vault = VaultId::new();
        let a = asset(vault, None, "a.jpg");
        let mut view = CollectionView::new(vault, "v");
        view.replace(Listing {
            folders: Vec::new(),
            files: vec![a],
        });
        let local = LocalState::new(view);

        let snapshot = local.snapshot();
        local.collection().set_scope(Some(FolderId::new()), None);
        local.restore(snapshot);
        assert!(local.collection().files().is_empty());
    }
}
