//! Multi-select state and bulk-action availability.

use std::collections::BTreeSet;

use model::{AssetId, FolderId};
use serde::Serialize;

use crate::access::Permissions;

/// An item that can be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionItem {
    Asset(AssetId),
    Folder(FolderId),
}

/// Bulk actions available for the current selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkActions {
    pub can_delete: bool,
    pub can_download: bool,
}

/// Selected assets and folders of the current scope.
///
/// Cleared by a successful bulk action, folder navigation or an explicit
/// cancel. A background reload never touches it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionModel {
    assets: BTreeSet<AssetId>,
    folders: BTreeSet<FolderId>,
}

impl SelectionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips one item. Returns whether it is selected afterwards.
    pub fn toggle(&mut self, item: SelectionItem) -> bool {
        match item {
            SelectionItem::Asset(id) => flip(&mut self.assets, id),
            SelectionItem::Folder(id) => flip(&mut self.folders, id),
        }
    }

    /// Selects every item of the scope, or clears the selection if the
    /// scope is already fully selected.
    pub fn select_all(
        &mut self,
        scope_assets: impl IntoIterator<Item = AssetId>,
        scope_folders: impl IntoIterator<Item = FolderId>,
    ) {
        let assets: BTreeSet<AssetId> = scope_assets.into_iter().collect();
        let folders: BTreeSet<FolderId> = scope_folders.into_iter().collect();

        let fully_selected =
            assets.is_subset(&self.assets) && folders.is_subset(&self.folders);
        if fully_selected {
            self.clear();
        } else {
            self.assets = assets;
            self.folders = folders;
        }
    }

    /// Whether taps toggle selection instead of opening a preview.
    pub fn is_selecting(&self) -> bool {
        !self.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty() && self.folders.is_empty()
    }

    pub fn len(&self) -> usize {
        self.assets.len() + self.folders.len()
    }

    pub fn contains(&self, item: SelectionItem) -> bool {
        match item {
            SelectionItem::Asset(id) => self.assets.contains(&id),
            SelectionItem::Folder(id) => self.folders.contains(&id),
        }
    }

    pub fn clear(&mut self) {
        self.assets.clear();
        self.folders.clear();
    }

    pub fn assets(&self) -> Vec<AssetId> {
        self.assets.iter().copied().collect()
    }

    pub fn folders(&self) -> Vec<FolderId> {
        self.folders.iter().copied().collect()
    }

    /// Drops the given ids from the selection.
    pub fn remove(&mut self, asset_ids: &[AssetId], folder_ids: &[FolderId]) {
        for id in asset_ids {
            self.assets.remove(id);
        }
        for id in folder_ids {
            self.folders.remove(id);
        }
    }

    /// Bulk actions allowed for this selection under `permissions`.
    pub fn actions(&self, permissions: &Permissions) -> BulkActions {
        if self.is_empty() {
            return BulkActions::default();
        }
        BulkActions {
            // Folder deletes cascade over other people's uploads.
            can_delete: permissions.is_admin
                || (permissions.can_upload && self.folders.is_empty()),
            can_download: permissions.can_download && !self.assets.is_empty(),
        }
    }
}

fn flip<T: Ord>(set: &mut BTreeSet<T>, id: T) -> bool {
    if set.remove(&id) {
        false
    } else {
        set.insert(id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_flips_membership() {
        let mut selection = SelectionModel::new();
        let asset = AssetId::new();

        assert!(selection.toggle(SelectionItem::Asset(asset)));
        assert!(selection.is_selecting());
        assert!(!selection.toggle(SelectionItem::Asset(asset)));
        assert!(!selection.is_selecting());
    }

    #[test]
    fn test_select_all_twice_returns_to_empty() {
        let mut selection = SelectionModel::new();
        let assets = vec![AssetId::new(), AssetId::new()];
        let folders = vec![FolderId::new()];

        selection.select_all(assets.clone(), folders.clone());
        assert_eq!(selection.len(), 3);

        selection.select_all(assets, folders);
        assert!(selection.is_empty());
    }

    #[test]
    fn test_select_all_completes_partial_selection() {
        let mut selection = SelectionModel::new();
        let assets = vec![AssetId::new(), AssetId::new()];
        selection.toggle(SelectionItem::Asset(assets[0]));

        selection.select_all(assets.clone(), Vec::new());
        assert_eq!(selection.assets().len(), 2);
    }

    #[test]
    fn test_select_all_on_empty_scope_stays_empty() {
        let mut selection = SelectionModel::new();
        selection.select_all(Vec::new(), Vec::new());
        assert!(selection.is_empty());
    }

    #[test]
    fn test_actions() {
        let mut selection = SelectionModel::new();
        let viewer = Permissions {
            can_view: true,
            can_download: true,
            ..Permissions::none()
        };
        assert_eq!(selection.actions(&viewer), BulkActions::default());

        selection.toggle(SelectionItem::Asset(AssetId::new()));
        assert_eq!(
            selection.actions(&viewer),
            BulkActions {
                can_delete: false,
                can_download: true
            }
        );

        let admin = Permissions {
            is_admin: true,
            ..viewer
        };
        assert!(selection.actions(&admin).can_delete);

        let uploader = Permissions {
            can_upload: true,
            ..viewer
        };
        assert!(selection.actions(&uploader).can_delete);
        selection.toggle(SelectionItem::Folder(FolderId::new()));
        assert!(!selection.actions(&uploader).can_delete);
        assert!(selection.actions(&admin).can_delete);
    }
}
