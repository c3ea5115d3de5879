//! In-process backends.
//!
//! These implementations keep everything in memory and publish change
//! notifications for every write, the way the hosted store does. Each one
//! exposes fault-injection switches so failure paths can be exercised
//! deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use model::{
    AssetId, Folder, FolderId, Identity, LikeRecord, MediaAsset, Member, Result, UserId, Vault,
    VaultError, VaultId,
};
use tokio::sync::{broadcast, mpsc};

use super::{
    AuthEvent, BlobStore, ChangeFeed, ChangeKind, ChangeNotification, IdentityProvider,
    ProgressFn, RelationalStore, Table,
};

/// Capacity of each change-feed subscriber channel.
const SUBSCRIBER_BUFFER: usize = 64;

/// Capacity of the auth event channel.
const AUTH_EVENT_BUFFER: usize = 16;

/// Number of progress callbacks per simulated upload.
const UPLOAD_STEPS: u64 = 4;

fn poisoned(what: &str) -> VaultError {
    VaultError::Storage(format!("{} lock poisoned", what))
}

// ---------------------------------------------------------------------------
// Relational store + change feed
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    vaults: HashMap<VaultId, Vault>,
    members: HashMap<(VaultId, UserId), Member>,
    folders: HashMap<FolderId, Folder>,
    assets: HashMap<AssetId, MediaAsset>,
    likes: HashSet<LikeRecord>,
}

#[derive(Default)]
struct StoreFaults {
    failing_asset_deletes: HashSet<AssetId>,
    failing_folder_deletes: HashSet<FolderId>,
    failing_asset_inserts: HashSet<String>,
    session_expired: bool,
}

struct Subscriber {
    vault_id: VaultId,
    tables: Vec<Table>,
    tx: mpsc::Sender<ChangeNotification>,
}

#[derive(Default)]
struct StoreInner {
    state: RwLock<StoreState>,
    faults: RwLock<StoreFaults>,
    subscribers: Mutex<Vec<Subscriber>>,
    latency: RwLock<Option<Duration>>,
}

impl StoreInner {
    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        self.state.read().map_err(|_| poisoned("store"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        self.state.write().map_err(|_| poisoned("store"))
    }

    fn faults(&self) -> Result<RwLockReadGuard<'_, StoreFaults>> {
        self.faults.read().map_err(|_| poisoned("faults"))
    }

    fn latency(&self) -> Option<Duration> {
        self.latency.read().map(|l| *l).unwrap_or(None)
    }

    fn check_session(&self) -> Result<()> {
        if self.faults()?.session_expired {
            return Err(VaultError::SessionExpired("refresh token not found".to_string()));
        }
        Ok(())
    }

    fn publish(&self, vault_id: VaultId, table: Table, kind: ChangeKind) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            tracing::warn!("Change feed subscriber list poisoned, dropping notification");
            return;
        };

        subscribers.retain(|s| !s.tx.is_closed());

        let notification = ChangeNotification {
            vault_id,
            table,
            kind,
        };
        for subscriber in subscribers
            .iter()
            .filter(|s| s.vault_id == vault_id && s.tables.contains(&table))
        {
            if let Err(mpsc::error::TrySendError::Full(_)) =
                subscriber.tx.try_send(notification.clone())
            {
                tracing::debug!(vault_id = %vault_id, "Subscriber backlog full, notification coalesced");
            }
        }
    }
}

/// In-memory relational store that doubles as its own change feed.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a store operation after the configured latency, failing every
    /// call while the session is marked expired.
    fn call<T, F>(&self, op: F) -> BoxFuture<'_, Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(&StoreInner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        async move {
            if let Some(latency) = inner.latency() {
                tokio::time::sleep(latency).await;
            }
            inner.check_session()?;
            op(&*inner)
        }
        .boxed()
    }

    /// Adds or replaces a vault.
    pub fn add_vault(&self, vault: Vault) -> Result<()> {
        self.inner.write()?.vaults.insert(vault.id, vault);
        Ok(())
    }

    /// Adds an asset without publishing a notification.
    pub fn seed_asset(&self, asset: MediaAsset) -> Result<()> {
        self.inner.write()?.assets.insert(asset.id, asset);
        Ok(())
    }

    /// Adds a folder without publishing a notification.
    pub fn seed_folder(&self, folder: Folder) -> Result<()> {
        self.inner.write()?.folders.insert(folder.id, folder);
        Ok(())
    }

    pub fn contains_asset(&self, id: AssetId) -> bool {
        self.inner
            .read()
            .map(|s| s.assets.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn contains_folder(&self, id: FolderId) -> bool {
        self.inner
            .read()
            .map(|s| s.folders.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn asset_count(&self, vault_id: VaultId) -> usize {
        self.inner
            .read()
            .map(|s| s.assets.values().filter(|a| a.vault_id == vault_id).count())
            .unwrap_or(0)
    }

    pub fn members(&self, vault_id: VaultId) -> Vec<Member> {
        self.inner
            .read()
            .map(|s| {
                s.members
                    .values()
                    .filter(|m| m.vault_id == vault_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Makes any asset delete batch containing `id` fail without deleting.
    pub fn fail_asset_delete(&self, id: AssetId) -> Result<()> {
        self.write_faults(|f| {
            f.failing_asset_deletes.insert(id);
        })
    }

    /// Makes any folder delete batch containing `id` fail without deleting.
    pub fn fail_folder_delete(&self, id: FolderId) -> Result<()> {
        self.write_faults(|f| {
            f.failing_folder_deletes.insert(id);
        })
    }

    /// Makes metadata registration fail for assets with this file name.
    pub fn fail_asset_insert(&self, file_name: impl Into<String>) -> Result<()> {
        let file_name = file_name.into();
        self.write_faults(|f| {
            f.failing_asset_inserts.insert(file_name);
        })
    }

    /// Makes every call fail with `SessionExpired` while set.
    pub fn expire_session(&self, expired: bool) -> Result<()> {
        self.write_faults(|f| f.session_expired = expired)
    }

    pub fn clear_faults(&self) -> Result<()> {
        self.write_faults(|f| *f = StoreFaults::default())
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) -> Result<()> {
        *self.inner.latency.write().map_err(|_| poisoned("latency"))? = latency;
        Ok(())
    }

    /// Publishes a notification as if another client had written.
    pub fn notify(&self, vault_id: VaultId, table: Table, kind: ChangeKind) {
        self.inner.publish(vault_id, table, kind);
    }

    /// Number of open change-feed subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|s| s.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn write_faults(&self, f: impl FnOnce(&mut StoreFaults)) -> Result<()> {
        let mut faults = self.inner.faults.write().map_err(|_| poisoned("faults"))?;
        f(&mut faults);
        Ok(())
    }
}

impl RelationalStore for MemoryStore {
    fn get_vault(&self, vault_id: VaultId) -> BoxFuture<'_, Result<Option<Vault>>> {
        self.call(move |inner| Ok(inner.read()?.vaults.get(&vault_id).cloned()))
    }

    fn find_vault_by_code(&self, code: String) -> BoxFuture<'_, Result<Option<VaultId>>> {
        self.call(move |inner| {
            Ok(inner
                .read()?
                .vaults
                .values()
                .find(|v| v.code == code)
                .map(|v| v.id))
        })
    }

    fn get_membership(
        &self,
        vault_id: VaultId,
        user_id: UserId,
    ) -> BoxFuture<'_, Result<Option<Member>>> {
        self.call(move |inner| Ok(inner.read()?.members.get(&(vault_id, user_id)).cloned()))
    }

    fn insert_membership(&self, member: Member) -> BoxFuture<'_, Result<()>> {
        self.call(move |inner| {
            let mut state = inner.write()?;
            let key = (member.vault_id, member.user_id);
            if state.members.contains_key(&key) {
                return Err(VaultError::Conflict(format!(
                    "duplicate membership for user {} in vault {}",
                    member.user_id, member.vault_id
                )));
            }
            state.members.insert(key, member);
            Ok(())
        })
    }

    fn get_folder(&self, folder_id: FolderId) -> BoxFuture<'_, Result<Option<Folder>>> {
        self.call(move |inner| Ok(inner.read()?.folders.get(&folder_id).cloned()))
    }

    fn list_folders(
        &self,
        vault_id: VaultId,
        parent: Option<FolderId>,
    ) -> BoxFuture<'_, Result<Vec<Folder>>> {
        self.call(move |inner| {
            Ok(inner
                .read()?
                .folders
                .values()
                .filter(|f| f.vault_id == vault_id && f.parent_id == parent)
                .cloned()
                .collect())
        })
    }

    fn all_folders(&self, vault_id: VaultId) -> BoxFuture<'_, Result<Vec<Folder>>> {
        self.call(move |inner| {
            Ok(inner
                .read()?
                .folders
                .values()
                .filter(|f| f.vault_id == vault_id)
                .cloned()
                .collect())
        })
    }

    fn insert_folder(&self, folder: Folder) -> BoxFuture<'_, Result<()>> {
        self.call(move |inner| {
            let vault_id = folder.vault_id;
            inner.write()?.folders.insert(folder.id, folder);
            inner.publish(vault_id, Table::Folders, ChangeKind::Insert);
            Ok(())
        })
    }

    fn list_assets(
        &self,
        vault_id: VaultId,
        folder: Option<FolderId>,
    ) -> BoxFuture<'_, Result<Vec<MediaAsset>>> {
        self.call(move |inner| {
            Ok(inner
                .read()?
                .assets
                .values()
                .filter(|a| a.vault_id == vault_id && a.folder_id == folder)
                .cloned()
                .collect())
        })
    }

    fn assets_in_folders(
        &self,
        folder_ids: Vec<FolderId>,
    ) -> BoxFuture<'_, Result<Vec<MediaAsset>>> {
        self.call(move |inner| {
            Ok(inner
                .read()?
                .assets
                .values()
                .filter(|a| a.folder_id.is_some_and(|f| folder_ids.contains(&f)))
                .cloned()
                .collect())
        })
    }

    fn insert_asset(&self, asset: MediaAsset) -> BoxFuture<'_, Result<()>> {
        self.call(move |inner| {
            if inner.faults()?.failing_asset_inserts.contains(&asset.file_name) {
                return Err(VaultError::Storage(format!(
                    "insert rejected for {}",
                    asset.file_name
                )));
            }
            let vault_id = asset.vault_id;
            inner.write()?.assets.insert(asset.id, asset);
            inner.publish(vault_id, Table::Assets, ChangeKind::Insert);
            Ok(())
        })
    }

    fn delete_assets(&self, ids: Vec<AssetId>) -> BoxFuture<'_, Result<()>> {
        self.call(move |inner| {
            let failed = {
                let faults = inner.faults()?;
                ids.iter()
                    .filter(|id| faults.failing_asset_deletes.contains(*id))
                    .count()
            };
            if failed > 0 {
                return Err(VaultError::PartialFailure {
                    failed,
                    total: ids.len(),
                    reason: "asset row delete rejected".to_string(),
                });
            }

            let mut vaults = HashSet::new();
            {
                let mut state = inner.write()?;
                for id in &ids {
                    if let Some(asset) = state.assets.remove(id) {
                        vaults.insert(asset.vault_id);
                    }
                }
                state.likes.retain(|like| !ids.contains(&like.asset_id));
            }
            for vault_id in vaults {
                inner.publish(vault_id, Table::Assets, ChangeKind::Delete);
            }
            Ok(())
        })
    }

    fn delete_folders(&self, ids: Vec<FolderId>) -> BoxFuture<'_, Result<()>> {
        self.call(move |inner| {
            let failed = {
                let faults = inner.faults()?;
                ids.iter()
                    .filter(|id| faults.failing_folder_deletes.contains(*id))
                    .count()
            };
            if failed > 0 {
                return Err(VaultError::PartialFailure {
                    failed,
                    total: ids.len(),
                    reason: "folder row delete rejected".to_string(),
                });
            }

            let mut vaults = HashSet::new();
            {
                let mut state = inner.write()?;
                for id in &ids {
                    if let Some(folder) = state.folders.remove(id) {
                        vaults.insert(folder.vault_id);
                    }
                }
            }
            for vault_id in vaults {
                inner.publish(vault_id, Table::Folders, ChangeKind::Delete);
            }
            Ok(())
        })
    }

    fn has_like(&self, like: LikeRecord) -> BoxFuture<'_, Result<bool>> {
        self.call(move |inner| Ok(inner.read()?.likes.contains(&like)))
    }

    fn insert_like(&self, like: LikeRecord) -> BoxFuture<'_, Result<()>> {
        self.call(move |inner| {
            let vault_id = {
                let mut state = inner.write()?;
                if state.likes.contains(&like) {
                    return Err(VaultError::Conflict("duplicate like".to_string()));
                }
                let asset = state
                    .assets
                    .get_mut(&like.asset_id)
                    .ok_or_else(|| VaultError::NotFound(format!("asset {}", like.asset_id)))?;
                asset.like_count += 1;
                let vault_id = asset.vault_id;
                state.likes.insert(like);
                vault_id
            };
            inner.publish(vault_id, Table::Assets, ChangeKind::Update);
            Ok(())
        })
    }

    fn delete_like(&self, like: LikeRecord) -> BoxFuture<'_, Result<()>> {
        self.call(move |inner| {
            let vault_id = {
                let mut state = inner.write()?;
                if !state.likes.remove(&like) {
                    return Ok(());
                }
                state.assets.get_mut(&like.asset_id).map(|asset| {
                    asset.like_count = asset.like_count.saturating_sub(1);
                    asset.vault_id
                })
            };
            if let Some(vault_id) = vault_id {
                inner.publish(vault_id, Table::Assets, ChangeKind::Update);
            }
            Ok(())
        })
    }

    fn like_count(&self, asset_id: AssetId) -> BoxFuture<'_, Result<u64>> {
        self.call(move |inner| {
            Ok(inner
                .read()?
                .likes
                .iter()
                .filter(|like| like.asset_id == asset_id)
                .count() as u64)
        })
    }
}

impl ChangeFeed for MemoryStore {
    fn subscribe(
        &self,
        vault_id: VaultId,
        tables: Vec<Table>,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<ChangeNotification>>> {
        self.call(move |inner| {
            let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
            inner
                .subscribers
                .lock()
                .map_err(|_| poisoned("subscribers"))?
                .push(Subscriber {
                    vault_id,
                    tables,
                    tx,
                });
            Ok(rx)
        })
    }
}

// ---------------------------------------------------------------------------
// Identity provider
// ---------------------------------------------------------------------------

struct IdentityInner {
    current: RwLock<Option<Identity>>,
    events: broadcast::Sender<AuthEvent>,
    session_delay: RwLock<Option<Duration>>,
    sign_outs: AtomicUsize,
}

/// In-memory identity provider.
#[derive(Clone)]
pub struct MemoryIdentity {
    inner: Arc<IdentityInner>,
}

impl Default for MemoryIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentity {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_BUFFER);
        Self {
            inner: Arc::new(IdentityInner {
                current: RwLock::new(None),
                events,
                session_delay: RwLock::new(None),
                sign_outs: AtomicUsize::new(0),
            }),
        }
    }

    /// Starts a session and announces it.
    pub fn sign_in(&self, identity: Identity) {
        self.set_current(Some(identity.clone()));
        let _ = self.inner.events.send(AuthEvent::SignedIn(identity));
    }

    /// Announces a token refresh for the current identity.
    pub fn refresh_token(&self) {
        if let Some(identity) = self.current() {
            let _ = self.inner.events.send(AuthEvent::TokenRefreshed(identity));
        }
    }

    /// Removes the current user and announces it.
    pub fn delete_user(&self) {
        self.set_current(None);
        let _ = self.inner.events.send(AuthEvent::UserDeleted);
    }

    /// Delays `get_session` by `delay`.
    pub fn set_session_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.inner.session_delay.write() {
            *slot = delay;
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.inner.current.read().map(|c| c.clone()).unwrap_or(None)
    }

    /// Number of `sign_out` calls received.
    pub fn sign_out_count(&self) -> usize {
        self.inner.sign_outs.load(Ordering::SeqCst)
    }

    fn set_current(&self, identity: Option<Identity>) {
        if let Ok(mut current) = self.inner.current.write() {
            *current = identity;
        }
    }

    fn session_delay(&self) -> Option<Duration> {
        self.inner.session_delay.read().map(|d| *d).unwrap_or(None)
    }
}

impl IdentityProvider for MemoryIdentity {
    fn get_session(&self) -> BoxFuture<'_, Result<Option<Identity>>> {
        let delay = self.session_delay();
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.current())
        }
        .boxed()
    }

    fn sign_out(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.inner.sign_outs.fetch_add(1, Ordering::SeqCst);
            self.set_current(None);
            let _ = self.inner.events.send(AuthEvent::SignedOut);
            Ok(())
        }
        .boxed()
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum UploadFault {
    Permanent,
    Transient { remaining: u32 },
}

/// Storage paths end in `{uuid}-{file_name}`, so a fault keyed by file name
/// must match that whole segment and not any longer name sharing its tail.
fn stored_name_matches(path: &str, name: &str) -> bool {
    let object = path.rsplit('/').next().unwrap_or(path);
    object == name
        || object
            .strip_suffix(name)
            .is_some_and(|prefix| prefix.ends_with('-'))
}

#[derive(Default)]
struct BlobInner {
    objects: RwLock<HashMap<String, Bytes>>,
    upload_faults: Mutex<HashMap<String, UploadFault>>,
    fail_removal: AtomicBool,
    step_delay: RwLock<Option<Duration>>,
    upload_attempts: AtomicUsize,
}

impl BlobInner {
    /// Consumes one injected fault matching `path`, if any.
    fn take_fault(&self, path: &str) -> Result<()> {
        let mut faults = self
            .upload_faults
            .lock()
            .map_err(|_| poisoned("upload faults"))?;
        let Some((name, fault)) = faults
            .iter_mut()
            .find(|(name, _)| stored_name_matches(path, name.as_str()))
        else {
            return Ok(());
        };

        match fault {
            UploadFault::Permanent => Err(VaultError::Storage(format!("upload rejected: {}", name))),
            UploadFault::Transient { remaining } => {
                let err = VaultError::TransientNetwork(format!("connection reset: {}", name));
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    let name = name.clone();
                    faults.remove(&name);
                }
                Err(err)
            }
        }
    }

    fn step_delay(&self) -> Option<Duration> {
        self.step_delay.read().map(|d| *d).unwrap_or(None)
    }
}

/// In-memory object store.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<BlobInner>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every upload whose path ends with `file_name` fail.
    pub fn fail_upload(&self, file_name: impl Into<String>) {
        if let Ok(mut faults) = self.inner.upload_faults.lock() {
            faults.insert(file_name.into(), UploadFault::Permanent);
        }
    }

    /// Makes the next `times` uploads of `file_name` fail transiently.
    pub fn fail_upload_transiently(&self, file_name: impl Into<String>, times: u32) {
        if let Ok(mut faults) = self.inner.upload_faults.lock() {
            faults.insert(file_name.into(), UploadFault::Transient { remaining: times });
        }
    }

    /// Makes `remove` fail while set.
    pub fn fail_removal(&self, fail: bool) {
        self.inner.fail_removal.store(fail, Ordering::SeqCst);
    }

    /// Delays each progress step of an upload by `delay`.
    pub fn set_step_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.inner.step_delay.write() {
            *slot = delay;
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner
            .objects
            .read()
            .map(|o| o.contains_key(path))
            .unwrap_or(false)
    }

    pub fn object_count(&self) -> usize {
        self.inner.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    /// Total upload attempts received, failed ones included.
    pub fn upload_attempts(&self) -> usize {
        self.inner.upload_attempts.load(Ordering::SeqCst)
    }
}

impl BlobStore for MemoryBlobStore {
    fn upload(
        &self,
        path: String,
        bytes: Bytes,
        _content_type: String,
        progress: ProgressFn,
    ) -> BoxFuture<'_, Result<String>> {
        let inner = Arc::clone(&self.inner);
        async move {
            inner.upload_attempts.fetch_add(1, Ordering::SeqCst);
            let total = bytes.len() as u64;

            for step in 1..=UPLOAD_STEPS {
                if let Some(delay) = inner.step_delay() {
                    tokio::time::sleep(delay).await;
                }
                progress(total * step / UPLOAD_STEPS, total);
                if step == 1 {
                    inner.take_fault(&path)?;
                }
            }

            inner
                .objects
                .write()
                .map_err(|_| poisoned("objects"))?
                .insert(path.clone(), bytes);
            Ok(format!("memory://media/{}", path))
        }
        .boxed()
    }

    fn remove(&self, paths: Vec<String>) -> BoxFuture<'_, Result<()>> {
        let inner = Arc::clone(&self.inner);
        async move {
            if inner.fail_removal.load(Ordering::SeqCst) {
                return Err(VaultError::TransientNetwork(
                    "object store unreachable".to_string(),
                ));
            }
            let mut objects = inner.objects.write().map_err(|_| poisoned("objects"))?;
            for path in &paths {
                objects.remove(path);
            }
            Ok(())
        }
        .boxed()
    }
}
