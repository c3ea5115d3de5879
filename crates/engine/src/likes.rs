//! Likes and the persisted anonymous guest identity.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use model::{Actor, AssetId, GuestId, Identity, LikeRecord, Result};
use serde::{Deserialize, Serialize};

use crate::auth::MiddlewareChain;
use crate::backend::RelationalStore;

/// File name of the guest identity inside the data directory.
pub const GUEST_FILE: &str = "guest.json";

/// Like state of one asset for one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LikeState {
    pub liked: bool,
    pub count: u64,
}

/// Toggles likes.
pub struct LikeService {
    store: Arc<dyn RelationalStore>,
    middleware: Arc<MiddlewareChain>,
}

impl LikeService {
    pub fn new(store: Arc<dyn RelationalStore>, middleware: Arc<MiddlewareChain>) -> Self {
        Self { store, middleware }
    }

    /// Likes the asset if the actor has not liked it yet, unlikes it
    /// otherwise.
    pub async fn toggle(&self, asset_id: AssetId, actor: &Actor) -> Result<LikeState> {
        match self.try_toggle(asset_id, actor).await {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!(asset_id = %asset_id, actor = %actor, error = %e, "Like toggle failed");
                self.middleware.observe(&e).await;
                Err(e)
            }
        }
    }

    pub async fn state(&self, asset_id: AssetId, actor: &Actor) -> Result<LikeState> {
        let record = LikeRecord {
            asset_id,
            actor: actor.clone(),
        };
        let liked = self.store.has_like(record).await?;
        let count = self.store.like_count(asset_id).await?;
        Ok(LikeState { liked, count })
    }

    async fn try_toggle(&self, asset_id: AssetId, actor: &Actor) -> Result<LikeState> {
        let record = LikeRecord {
            asset_id,
            actor: actor.clone(),
        };

        let liked = if self.store.has_like(record.clone()).await? {
            self.store.delete_like(record).await?;
            false
        } else {
            match self.store.insert_like(record).await {
                Ok(()) => true,
                // A concurrent toggle already inserted it.
                Err(e) if e.is_swallowed() => true,
                Err(e) => return Err(e),
            }
        };

        let count = self.store.like_count(asset_id).await?;
        tracing::debug!(asset_id = %asset_id, actor = %actor, liked, count, "Toggled like");
        Ok(LikeState { liked, count })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GuestFile {
    version: u32,
    guest_id: GuestId,
}

/// Anonymous guest id, persisted so likes survive restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestIdentity {
    id: GuestId,
    path: PathBuf,
}

impl GuestIdentity {
    /// Loads the guest id from `path`, creating and saving a new one if the
    /// file does not exist.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> AnyResult<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read guest identity: {}", path.display()))?;
            let data: GuestFile = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse guest identity: {}", path.display()))?;
            tracing::debug!(guest_id = %data.guest_id, "Loaded guest identity");
            return Ok(Self {
                id: data.guest_id,
                path,
            });
        }

        let guest = Self {
            id: GuestId::new(),
            path,
        };
        guest.save()?;
        tracing::info!(guest_id = %guest.id, "Created guest identity");
        Ok(guest)
    }

    pub fn id(&self) -> GuestId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The actor to use: the identity when signed in, the guest otherwise.
    pub fn actor(&self, identity: Option<&Identity>) -> Actor {
        Actor::from_parts(identity, self.id)
    }

    fn save(&self) -> AnyResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create guest identity directory: {}", parent.display())
            })?;
        }

        let contents = serde_json::to_string_pretty(&GuestFile {
            version: 1,
            guest_id: self.id,
        })
        .context("Failed to serialize guest identity")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp guest identity: {}", temp_path.display())
        })?;
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp guest identity {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use model::{MediaAsset, MediaKind, UserId, VaultId};
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn seeded_store() -> (MemoryStore, AssetId) {
        let store = MemoryStore::new();
        let asset = MediaAsset {
            id: AssetId::new(),
            vault_id: VaultId::new(),
            folder_id: None,
            uploader_id: None,
            url: String::new(),
            storage_path: "v/a.jpg".to_string(),
            file_name: "a.jpg".to_string(),
            kind: MediaKind::Image,
            size_bytes: 1,
            like_count: 0,
            created_at: SystemTime::now(),
        };
        let id = asset.id;
        store.seed_asset(asset).unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_toggle_twice_restores_state() {
        let (store, asset) = seeded_store();
        let likes = LikeService::new(Arc::new(store), MiddlewareChain::new());
        let actor = Actor::Anonymous(GuestId::new());

        let liked = likes.toggle(asset, &actor).await.unwrap();
        assert_eq!(liked, LikeState { liked: true, count: 1 });

        let unliked = likes.toggle(asset, &actor).await.unwrap();
        assert_eq!(unliked, LikeState { liked: false, count: 0 });
    }

    #[tokio::test]
    async fn test_actors_like_independently() {
        let (store, asset) = seeded_store();
        let likes = LikeService::new(Arc::new(store), MiddlewareChain::new());
        let guest = Actor::Anonymous(GuestId::new());
        let user = Actor::Authenticated(UserId::new());

        likes.toggle(asset, &guest).await.unwrap();
        let state = likes.toggle(asset, &user).await.unwrap();
        assert_eq!(state.count, 2);
        assert!(likes.state(asset, &guest).await.unwrap().liked);
    }

    #[test]
    fn test_guest_identity_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join(GUEST_FILE);

        let first = GuestIdentity::load_or_create(&path).unwrap();
        let second = GuestIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.id(), second.id());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_guest_actor_prefers_identity() {
        let temp = TempDir::new().unwrap();
        let guest = GuestIdentity::load_or_create(temp.path().join(GUEST_FILE)).unwrap();
        let identity = Identity::new(UserId::new());

        assert_eq!(guest.actor(None), Actor::Anonymous(guest.id()));
        assert_eq!(
            guest.actor(Some(&identity)),
            Actor::Authenticated(identity.user_id)
        );
    }

    #[test]
    fn test_corrupt_guest_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(GUEST_FILE);
        fs::write(&path, "not json").unwrap();
        assert!(GuestIdentity::load_or_create(&path).is_err());
    }
}
