//! External collaborators of the engine.
//!
//! The engine never talks to a concrete service. It depends on these traits:
//! - [`IdentityProvider`]: the current session and auth state changes
//! - [`RelationalStore`]: vaults, memberships, folders, assets and likes
//! - [`ChangeFeed`]: per-vault change notifications
//! - [`BlobStore`]: the object store holding the media bytes
//!
//! The traits are object safe and return boxed futures so the engine can
//! hold them as `Arc<dyn Trait>`. [`memory`] provides in-process
//! implementations with fault injection.

pub mod memory;

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use model::{
    AssetId, Folder, FolderId, Identity, LikeRecord, MediaAsset, Member, Result, UserId, Vault,
    VaultId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

pub use memory::{MemoryBlobStore, MemoryIdentity, MemoryStore};

/// Auth state changes reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(Identity),
    SignedOut,
    TokenRefreshed(Identity),
    UserDeleted,
}

/// Source of the current identity.
pub trait IdentityProvider: Send + Sync {
    /// Returns the identity of the active session, if any.
    fn get_session(&self) -> BoxFuture<'_, Result<Option<Identity>>>;

    /// Ends the active session.
    fn sign_out(&self) -> BoxFuture<'_, Result<()>>;

    /// Returns a receiver for auth state changes.
    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;
}

/// Remote tables the change feed reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Assets,
    Folders,
}

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single row-change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub vault_id: VaultId,
    pub table: Table,
    pub kind: ChangeKind,
}

/// Authoritative storage for vault metadata.
pub trait RelationalStore: Send + Sync {
    fn get_vault(&self, vault_id: VaultId) -> BoxFuture<'_, Result<Option<Vault>>>;

    /// Looks up a vault by its join code. The comparison is exact.
    fn find_vault_by_code(&self, code: String) -> BoxFuture<'_, Result<Option<VaultId>>>;

    fn get_membership(
        &self,
        vault_id: VaultId,
        user_id: UserId,
    ) -> BoxFuture<'_, Result<Option<Member>>>;

    /// Inserts a membership. A duplicate (vault, user) pair reports
    /// `VaultError::Conflict`.
    fn insert_membership(&self, member: Member) -> BoxFuture<'_, Result<()>>;

    fn get_folder(&self, folder_id: FolderId) -> BoxFuture<'_, Result<Option<Folder>>>;

    /// Folders directly under `parent` (`None` = root level).
    fn list_folders(
        &self,
        vault_id: VaultId,
        parent: Option<FolderId>,
    ) -> BoxFuture<'_, Result<Vec<Folder>>>;

    /// Every folder of the vault, at any depth.
    fn all_folders(&self, vault_id: VaultId) -> BoxFuture<'_, Result<Vec<Folder>>>;

    fn insert_folder(&self, folder: Folder) -> BoxFuture<'_, Result<()>>;

    /// Assets directly inside `folder` (`None` = root level).
    fn list_assets(
        &self,
        vault_id: VaultId,
        folder: Option<FolderId>,
    ) -> BoxFuture<'_, Result<Vec<MediaAsset>>>;

    /// Assets directly inside any of the given folders.
    fn assets_in_folders(&self, folder_ids: Vec<FolderId>)
        -> BoxFuture<'_, Result<Vec<MediaAsset>>>;

    fn insert_asset(&self, asset: MediaAsset) -> BoxFuture<'_, Result<()>>;

    /// Deletes the given asset rows in one transaction.
    fn delete_assets(&self, ids: Vec<AssetId>) -> BoxFuture<'_, Result<()>>;

    /// Deletes the given folder rows in one transaction.
    fn delete_folders(&self, ids: Vec<FolderId>) -> BoxFuture<'_, Result<()>>;

    fn has_like(&self, like: LikeRecord) -> BoxFuture<'_, Result<bool>>;

    /// Inserts a like. A duplicate reports `VaultError::Conflict`.
    fn insert_like(&self, like: LikeRecord) -> BoxFuture<'_, Result<()>>;

    /// Deletes a like. Deleting a missing like is not an error.
    fn delete_like(&self, like: LikeRecord) -> BoxFuture<'_, Result<()>>;

    fn like_count(&self, asset_id: AssetId) -> BoxFuture<'_, Result<u64>>;
}

/// Per-vault change-notification feed.
pub trait ChangeFeed: Send + Sync {
    /// Opens a subscription for the given tables of one vault. Dropping the
    /// receiver closes the subscription.
    fn subscribe(
        &self,
        vault_id: VaultId,
        tables: Vec<Table>,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<ChangeNotification>>>;
}

/// Progress callback: `(bytes_sent, total_bytes)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Object store for media bytes.
pub trait BlobStore: Send + Sync {
    /// Uploads bytes to `path` and returns the public URL.
    fn upload(
        &self,
        path: String,
        bytes: Bytes,
        content_type: String,
        progress: ProgressFn,
    ) -> BoxFuture<'_, Result<String>>;

    /// Removes the objects at the given paths.
    fn remove(&self, paths: Vec<String>) -> BoxFuture<'_, Result<()>>;
}

/// The remote services one engine instance works against.
#[derive(Clone)]
pub struct Backends {
    pub identity: Arc<dyn IdentityProvider>,
    pub store: Arc<dyn RelationalStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Backends {
    /// Wires up the in-memory implementations, returning handles to each for
    /// seeding and fault injection.
    pub fn in_memory() -> (Self, MemoryIdentity, MemoryStore, MemoryBlobStore) {
        let identity = MemoryIdentity::new();
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        let backends = Self {
            identity: Arc::new(identity.clone()),
            store: Arc::new(store.clone()),
            feed: Arc::new(store.clone()),
            blobs: Arc::new(blobs.clone()),
        };
        (backends, identity, store, blobs)
    }
}
