//! Folder and file listing for the current scope.

use model::{AssetId, Folder, FolderId, MediaAsset, MediaKind, Result, VaultId};
use serde::Serialize;

use crate::access::Permissions;
use crate::backend::RelationalStore;

/// Contents of one folder scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub folders: Vec<Folder>,
    pub files: Vec<MediaAsset>,
}

impl Listing {
    /// Fetches the folders and files directly inside `folder_id`.
    pub async fn load(
        store: &dyn RelationalStore,
        vault_id: VaultId,
        folder_id: Option<FolderId>,
    ) -> Result<Self> {
        let folders = store.list_folders(vault_id, folder_id).await?;
        let files = store.list_assets(vault_id, folder_id).await?;
        Ok(Self { folders, files })
    }

    /// Folders by name, files newest first.
    fn sorted(mut self) -> Self {
        self.folders.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
        self.files.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self
    }
}

/// Position in the folder tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breadcrumb {
    pub vault_name: String,
    /// The current folder, `None` at the root.
    pub folder: Option<(FolderId, String)>,
}

/// The listing of one vault scope, plus view-local state.
#[derive(Debug, Clone)]
pub struct CollectionView {
    vault_id: VaultId,
    vault_name: String,
    folder_id: Option<FolderId>,
    folder_name: Option<String>,
    listing: Listing,
    search: String,
}

impl CollectionView {
    pub fn new(vault_id: VaultId, vault_name: impl Into<String>) -> Self {
        Self {
            vault_id,
            vault_name: vault_name.into(),
            folder_id: None,
            folder_name: None,
            listing: Listing::default(),
            search: String::new(),
        }
    }

    pub fn vault_id(&self) -> VaultId {
        self.vault_id
    }

    pub fn folder_id(&self) -> Option<FolderId> {
        self.folder_id
    }

    /// Moves to another folder. The listing is emptied until the next load.
    pub fn set_scope(&mut self, folder_id: Option<FolderId>, folder_name: Option<String>) {
        self.folder_id = folder_id;
        self.folder_name = folder_name;
        self.listing = Listing::default();
    }

    /// Replaces the listing wholesale.
    pub fn replace(&mut self, listing: Listing) {
        self.listing = listing.sorted();
    }

    /// A copy of the current listing.
    pub fn listing(&self) -> Listing {
        self.listing.clone()
    }

    pub fn folders(&self) -> &[Folder] {
        &self.listing.folders
    }

    pub fn files(&self) -> &[MediaAsset] {
        &self.listing.files
    }

    pub fn file(&self, id: AssetId) -> Option<&MediaAsset> {
        self.listing.files.iter().find(|f| f.id == id)
    }

    pub fn contains_asset(&self, id: AssetId) -> bool {
        self.file(id).is_some()
    }

    pub fn contains_folder(&self, id: FolderId) -> bool {
        self.listing.folders.iter().any(|f| f.id == id)
    }

    /// Removes the given items, returning the ids that were present.
    pub fn remove(
        &mut self,
        asset_ids: &[AssetId],
        folder_ids: &[FolderId],
    ) -> (Vec<AssetId>, Vec<FolderId>) {
        let removed_assets: Vec<AssetId> = asset_ids
            .iter()
            .copied()
            .filter(|id| self.contains_asset(*id))
            .collect();
        let removed_folders: Vec<FolderId> = folder_ids
            .iter()
            .copied()
            .filter(|id| self.contains_folder(*id))
            .collect();

        self.listing.files.retain(|f| !removed_assets.contains(&f.id));
        self.listing.folders.retain(|f| !removed_folders.contains(&f.id));
        (removed_assets, removed_folders)
    }

    pub fn set_search(&mut self, query: impl Into<String>) {
        self.search = query.into();
    }

    pub fn search(&self) -> &str {
        &self.search
    }

    /// Files whose name contains the search query, ignoring case.
    pub fn visible_files(&self) -> Vec<&MediaAsset> {
        let query = self.search.trim().to_lowercase();
        self.listing
            .files
            .iter()
            .filter(|f| query.is_empty() || f.file_name.to_lowercase().contains(&query))
            .collect()
    }

    pub fn breadcrumb(&self) -> Breadcrumb {
        Breadcrumb {
            vault_name: self.vault_name.clone(),
            folder: self
                .folder_id
                .map(|id| (id, self.folder_name.clone().unwrap_or_default())),
        }
    }

    /// The image after `current` in view order, stopping at the end.
    pub fn preview_next(&self, current: AssetId) -> Option<&MediaAsset> {
        self.preview_step(current, 1)
    }

    /// The image before `current` in view order, stopping at the start.
    pub fn preview_previous(&self, current: AssetId) -> Option<&MediaAsset> {
        self.preview_step(current, -1)
    }

    fn preview_step(&self, current: AssetId, step: isize) -> Option<&MediaAsset> {
        let images: Vec<&MediaAsset> = self
            .listing
            .files
            .iter()
            .filter(|f| f.kind == MediaKind::Image)
            .collect();
        let index = images.iter().position(|f| f.id == current)?;
        let target = index.checked_add_signed(step)?;
        images.get(target).copied()
    }

    /// Whether "download all" is offered.
    pub fn can_download_all(&self, permissions: &Permissions) -> bool {
        permissions.can_download && !self.listing.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn asset(vault_id: VaultId, name: &str, kind: MediaKind, age_secs: u64) -> MediaAsset {
        MediaAsset {
            id: AssetId::new(),
            vault_id,
            folder_id: None,
            uploader_id: None,
            url: String::new(),
            storage_path: format!("{}/{}", vault_id, name),
            file_name: name.to_string(),
            kind,
            size_bytes: 1,
            like_count: 0,
            created_at: SystemTime::UNIX_EPOCH + Duration::from_secs(10_000 - age_secs),
        }
    }

    fn view() -> (CollectionView, Vec<MediaAsset>) {
        let vault_id = VaultId::new();
        let mut view = CollectionView::new(vault_id, "Wedding");
        let files = vec![
            asset(vault_id, "old.jpg", MediaKind::Image, 300),
            asset(vault_id, "clip.mp4", MediaKind::Video, 200),
            asset(vault_id, "new.JPG", MediaKind::Image, 100),
            asset(vault_id, "mid.png", MediaKind::Image, 150),
        ];
        view.replace(Listing {
            folders: vec![
                Folder::new(vault_id, None, "zeta"),
                Folder::new(vault_id, None, "Alpha"),
            ],
            files: files.clone(),
        });
        (view, files)
    }

    #[test]
    fn test_sorting() {
        let (view, _) = view();
        let folders: Vec<&str> = view.folders().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(folders, vec!["Alpha", "zeta"]);

        let files: Vec<&str> = view.files().iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(files, vec!["new.JPG", "mid.png", "clip.mp4", "old.jpg"]);
    }

    #[test]
    fn test_search_ignores_case() {
        let (mut view, _) = view();
        view.set_search("jpg");
        assert_eq!(view.visible_files().len(), 2);
        view.set_search("");
        assert_eq!(view.visible_files().len(), 4);
    }

    #[test]
    fn test_preview_walks_images_only() {
        let (view, files) = view();
        let newest = files[2].id;
        let mid = files[3].id;
        let oldest = files[0].id;

        assert_eq!(view.preview_next(newest).map(|f| f.id), Some(mid));
        assert_eq!(view.preview_next(mid).map(|f| f.id), Some(oldest));
        assert!(view.preview_next(oldest).is_none());
        assert!(view.preview_previous(newest).is_none());
        assert!(view.preview_next(files[1].id).is_none());
    }

    #[test]
    fn test_remove_reports_present_ids_only() {
        let (mut view, files) = view();
        let missing = AssetId::new();

        let (assets, folders) = view.remove(&[files[0].id, missing], &[]);
        assert_eq!(assets, vec![files[0].id]);
        assert!(folders.is_empty());
        assert_eq!(view.files().len(), 3);
    }

    #[test]
    fn test_breadcrumb_and_scope_change() {
        let (mut view, _) = view();
        assert_eq!(view.breadcrumb().folder, None);

        let folder = FolderId::new();
        view.set_scope(Some(folder), Some("Ceremony".to_string()));
        assert!(view.files().is_empty());
        assert_eq!(
            view.breadcrumb(),
            Breadcrumb {
                vault_name: "Wedding".to_string(),
                folder: Some((folder, "Ceremony".to_string())),
            }
        );
    }

    #[test]
    fn test_download_all_availability() {
        let (view, _) = view();
        let mut permissions = Permissions::none();
        assert!(!view.can_download_all(&permissions));
        permissions.can_download = true;
        assert!(view.can_download_all(&permissions));
    }
}
