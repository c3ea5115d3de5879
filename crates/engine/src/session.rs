//! One opened vault.
//!
//! A `VaultSession` ties the components together for a single vault:
//! access is resolved on open and again on every identity change, the root
//! scope is loaded and the change feed subscribed once the visitor may
//! view, and deletes run through the mutation ledger against the local
//! view. Closing the session tears the subscription down; uploads belong to
//! the engine and keep running.

use std::sync::{Arc, PoisonError, RwLock, Weak};

use futures_util::FutureExt;
use model::{
    Actor, AssetId, FolderId, GuestId, Identity, MediaAsset, Result, TaskId, Vault, VaultError,
    VaultId,
};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access::{AccessResolver, Permissions};
use crate::auth::{IdentitySession, MiddlewareChain};
use crate::backend::{ChangeNotification, RelationalStore};
use crate::collection::{Breadcrumb, CollectionView, Listing};
use crate::ledger::{DeleteOutcome, LocalState, MutationLedger};
use crate::likes::{LikeService, LikeState};
use crate::orchestrator::Engine;
use crate::selection::{BulkActions, SelectionItem, SelectionModel};
use crate::sync::{ReloadFn, Subscription, SyncChannel};
use crate::upload::{UploadFile, UploadQueue, UploadTask};

/// Events emitted by a vault session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Permissions were re-derived and differ from before.
    AccessChanged(Permissions),
    /// The active scope was reloaded.
    CollectionReloaded {
        folder_id: Option<FolderId>,
        folders: usize,
        files: usize,
    },
    /// A reload failed; the previous listing stays.
    ReloadFailed { reason: String },
    /// A delete was confirmed remotely.
    DeleteCommitted(DeleteOutcome),
    /// A delete failed and the local view was restored.
    DeleteRolledBack { reason: String },
    /// The session was closed.
    Closed,
}

struct SessionInner {
    vault: Vault,
    identity: Arc<IdentitySession>,
    guest: GuestId,
    store: Arc<dyn RelationalStore>,
    middleware: Arc<MiddlewareChain>,
    resolver: AccessResolver,
    ledger: MutationLedger,
    sync: SyncChannel,
    likes: LikeService,
    uploads: UploadQueue,
    local: LocalState,
    permissions: RwLock<Permissions>,
    subscription: Mutex<Option<Subscription>>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

/// Handle to an opened vault.
pub struct VaultSession {
    inner: Arc<SessionInner>,
}

impl VaultSession {
    /// Opens `vault_id`. A missing vault is `NotFound`.
    pub async fn open(engine: &Engine, vault_id: VaultId) -> Result<Self> {
        let backends = engine.backends();
        let middleware = Arc::clone(engine.middleware());

        let vault = match backends.store.get_vault(vault_id).await {
            Ok(Some(vault)) => vault,
            Ok(None) => return Err(VaultError::NotFound(format!("vault {}", vault_id))),
            Err(e) => {
                middleware.observe(&e).await;
                return Err(e);
            }
        };

        let (events, _) = broadcast::channel(engine.config().sync.event_buffer.max(1));
        let inner = Arc::new(SessionInner {
            local: LocalState::new(CollectionView::new(vault.id, vault.name.clone())),
            vault,
            identity: Arc::clone(engine.identity_session()),
            guest: engine.guest(),
            store: Arc::clone(&backends.store),
            middleware: Arc::clone(&middleware),
            resolver: AccessResolver::new(
                Arc::clone(&backends.store),
                Arc::clone(engine.grants()),
                Arc::clone(&middleware),
            ),
            ledger: MutationLedger::new(
                Arc::clone(&backends.store),
                Arc::clone(&backends.blobs),
                Arc::clone(&middleware),
            ),
            sync: SyncChannel::new(Arc::clone(&backends.feed), Arc::clone(&middleware)),
            likes: LikeService::new(Arc::clone(&backends.store), Arc::clone(&middleware)),
            uploads: engine.uploads().clone(),
            permissions: RwLock::new(Permissions::none()),
            subscription: Mutex::new(None),
            events,
            cancel: CancellationToken::new(),
        });

        info!(vault_id = %vault_id, "Opened vault");

        inner.resolve_access().await;
        spawn_identity_watcher(&inner);

        Ok(Self { inner })
    }

    pub fn vault(&self) -> &Vault {
        &self.inner.vault
    }

    pub fn vault_id(&self) -> VaultId {
        self.inner.vault.id
    }

    /// Permissions from the last resolution.
    pub fn permissions(&self) -> Permissions {
        self.inner.permissions()
    }

    /// Re-derives permissions from the current identity and remote state.
    pub async fn resolve_access(&self) -> Permissions {
        self.inner.resolve_access().await
    }

    /// Submits a passkey. Returns the permissions after the join.
    pub async fn request_join(&self, passkey: &str) -> Result<Permissions> {
        let identity = self.inner.identity.identity();
        self.inner
            .resolver
            .request_join(identity.as_ref(), &self.inner.vault, passkey)
            .await?;
        Ok(self.inner.resolve_access().await)
    }

    /// Starts one upload per file into `folder_id`.
    pub async fn enqueue_upload(
        &self,
        files: Vec<UploadFile>,
        folder_id: Option<FolderId>,
    ) -> Result<Vec<TaskId>> {
        if !self.permissions().can_upload {
            return Err(VaultError::AccessDenied("uploads are not allowed".to_string()));
        }
        let actor = self.actor();
        Ok(self
            .inner
            .uploads
            .enqueue(files, self.inner.vault.id, folder_id, &actor))
    }

    /// Upload tasks of this vault.
    pub fn uploads(&self) -> Vec<UploadTask> {
        self.inner.uploads.tasks_for_vault(self.inner.vault.id)
    }

    /// Deletes assets and folders optimistically.
    pub async fn delete_items(
        &self,
        asset_ids: &[AssetId],
        folder_ids: &[FolderId],
    ) -> Result<DeleteOutcome> {
        let permissions = self.permissions();
        if !self.may_delete(&permissions, asset_ids, folder_ids) {
            return Err(VaultError::AccessDenied("delete not allowed".to_string()));
        }

        match self
            .inner
            .ledger
            .delete_items(&self.inner.local, asset_ids, folder_ids)
            .await
        {
            Ok(outcome) => {
                self.inner.emit(SessionEvent::DeleteCommitted(outcome));
                Ok(outcome)
            }
            Err(e) => {
                self.inner.emit(SessionEvent::DeleteRolledBack {
                    reason: e.to_string(),
                });
                if e.is_permission_boundary() {
                    self.inner.resolve_access().await;
                }
                Err(e)
            }
        }
    }

    /// Admins may delete anything. Uploaders may delete only their own
    /// assets, and never folders since those cascade to every descendant.
    fn may_delete(
        &self,
        permissions: &Permissions,
        asset_ids: &[AssetId],
        folder_ids: &[FolderId],
    ) -> bool {
        if permissions.is_admin {
            return true;
        }
        if !permissions.can_upload || !folder_ids.is_empty() {
            return false;
        }
        let identity = self.inner.identity.identity();
        let view = self.inner.local.collection();
        asset_ids
            .iter()
            .filter_map(|id| view.file(*id))
            .all(|asset| permissions.can_delete_asset(identity.as_ref(), asset))
    }

    pub fn toggle_selection(&self, item: SelectionItem) -> bool {
        self.inner.local.selection().toggle(item)
    }

    /// Selects the whole scope, or clears it if already fully selected.
    pub fn select_all(&self) {
        let (assets, folders): (Vec<AssetId>, Vec<FolderId>) = {
            let view = self.inner.local.collection();
            (
                view.files().iter().map(|f| f.id).collect(),
                view.folders().iter().map(|f| f.id).collect(),
            )
        };
        self.inner.local.selection().select_all(assets, folders);
    }

    pub fn clear_selection(&self) {
        self.inner.local.selection().clear();
    }

    pub fn selection(&self) -> SelectionModel {
        self.inner.local.selection().clone()
    }

    pub fn bulk_actions(&self) -> BulkActions {
        self.inner.local.selection().actions(&self.permissions())
    }

    /// Moves to a folder (`None` = root), clearing the selection.
    pub async fn navigate(&self, folder_id: Option<FolderId>) -> Result<()> {
        let name = match folder_id {
            Some(id) => match self.inner.store.get_folder(id).await {
                Ok(Some(folder)) if folder.vault_id == self.inner.vault.id => Some(folder.name),
                Ok(_) => return Err(VaultError::NotFound(format!("folder {}", id))),
                Err(e) => {
                    self.inner.middleware.observe(&e).await;
                    return Err(e);
                }
            },
            None => None,
        };

        self.inner.local.collection().set_scope(folder_id, name);
        self.inner.local.selection().clear();
        debug!(vault_id = %self.inner.vault.id, folder_id = ?folder_id, "Navigated");

        self.reload().await
    }

    /// Reloads the active scope.
    pub async fn reload(&self) -> Result<()> {
        self.inner.reload().await
    }

    pub fn listing(&self) -> Listing {
        self.inner.local.collection().listing()
    }

    pub fn current_folder(&self) -> Option<FolderId> {
        self.inner.local.collection().folder_id()
    }

    pub fn set_search(&self, query: &str) {
        self.inner.local.collection().set_search(query);
    }

    /// Files matching the search query, in view order.
    pub fn visible_files(&self) -> Vec<MediaAsset> {
        self.inner
            .local
            .collection()
            .visible_files()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn breadcrumb(&self) -> Breadcrumb {
        self.inner.local.collection().breadcrumb()
    }

    pub fn preview_next(&self, current: AssetId) -> Option<MediaAsset> {
        self.inner.local.collection().preview_next(current).cloned()
    }

    pub fn preview_previous(&self, current: AssetId) -> Option<MediaAsset> {
        self.inner.local.collection().preview_previous(current).cloned()
    }

    pub fn can_download_all(&self) -> bool {
        self.inner
            .local
            .collection()
            .can_download_all(&self.permissions())
    }

    pub async fn toggle_like(&self, asset_id: AssetId) -> Result<LikeState> {
        if !self.permissions().can_view {
            return Err(VaultError::AccessDenied("vault not viewable".to_string()));
        }
        self.inner.likes.toggle(asset_id, &self.actor()).await
    }

    pub fn actor(&self) -> Actor {
        Actor::from_parts(self.inner.identity.identity().as_ref(), self.inner.guest)
    }

    pub async fn is_subscribed(&self) -> bool {
        self.inner
            .subscription
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.is_active())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Tears down the change-feed subscription and the identity watcher.
    /// Uploads in flight continue.
    pub async fn close(self) {
        self.inner.cancel.cancel();
        self.inner.close_subscription().await;
        self.inner.emit(SessionEvent::Closed);
        info!(vault_id = %self.inner.vault.id, "Closed vault");
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn permissions(&self) -> Permissions {
        *self
            .permissions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn resolve_access(self: &Arc<Self>) -> Permissions {
        let identity: Option<Identity> = self.identity.identity();
        let permissions = self.resolver.resolve(identity.as_ref(), &self.vault).await;

        let changed = {
            let mut current = self
                .permissions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let changed = *current != permissions;
            *current = permissions;
            changed
        };

        if permissions.can_view && !self.cancel.is_cancelled() {
            self.open_subscription().await;
        } else if !permissions.can_view {
            self.close_subscription().await;
            self.local.collection().replace(Listing::default());
            self.local.selection().clear();
        }

        if changed {
            info!(
                vault_id = %self.vault.id,
                can_view = permissions.can_view,
                can_upload = permissions.can_upload,
                can_download = permissions.can_download,
                "Access changed"
            );
            self.emit(SessionEvent::AccessChanged(permissions));
        }

        permissions
    }

    /// Loads the scope and subscribes, once.
    async fn open_subscription(self: &Arc<Self>) {
        let mut slot = self.subscription.lock().await;
        if slot.is_some() || self.cancel.is_cancelled() {
            return;
        }

        if let Err(e) = self.reload().await {
            warn!(vault_id = %self.vault.id, error = %e, "Initial load failed");
        }

        let weak = Arc::downgrade(self);
        match self.sync.subscribe(self.vault.id, reload_on_change(weak)).await {
            Ok(subscription) => *slot = Some(subscription),
            Err(e) => warn!(vault_id = %self.vault.id, error = %e, "Live updates unavailable"),
        }
    }

    async fn close_subscription(&self) {
        let subscription = self.subscription.lock().await.take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe().await;
        }
    }

    async fn reload(&self) -> Result<()> {
        let scope = self.local.collection().folder_id();

        let listing = match Listing::load(self.store.as_ref(), self.vault.id, scope).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(vault_id = %self.vault.id, error = %e, "Reload failed");
                self.middleware.observe(&e).await;
                self.emit(SessionEvent::ReloadFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let (folders, files) = (listing.folders.len(), listing.files.len());
        {
            let mut view = self.local.collection();
            if view.folder_id() != scope {
                debug!(vault_id = %self.vault.id, "Dropping reload for a scope no longer shown");
                return Ok(());
            }
            view.replace(listing);
        }

        debug!(vault_id = %self.vault.id, folders, files, "Reloaded scope");
        self.emit(SessionEvent::CollectionReloaded {
            folder_id: scope,
            folders,
            files,
        });
        Ok(())
    }
}

fn reload_on_change(session: Weak<SessionInner>) -> ReloadFn {
    Arc::new(move |_: ChangeNotification| {
        let session = session.clone();
        async move {
            if let Some(session) = session.upgrade() {
                let _ = session.reload().await;
            }
        }
        .boxed()
    })
}

/// Re-resolves access whenever the identity changes.
fn spawn_identity_watcher(inner: &Arc<SessionInner>) {
    let weak = Arc::downgrade(inner);
    let cancel = inner.cancel.clone();
    let mut changes: watch::Receiver<Option<Identity>> = inner.identity.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    debug!(vault_id = %inner.vault.id, "Identity changed, re-resolving access");
                    inner.resolve_access().await;
                }
            }
        }
    });
}

impl Drop for VaultSession {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
