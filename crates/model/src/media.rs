//! Media assets and likes.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::actor::Actor;
use crate::ids::{AssetId, FolderId, UserId, VaultId};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "heic", "avif"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "ogg", "m4v", "3gp", "mkv"];

/// Content type used when the uploader supplies none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Broad media category of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    File,
}

impl MediaKind {
    /// Classifies a file from its declared content type, falling back to the
    /// file extension.
    pub fn classify(file_name: &str, content_type: &str) -> Self {
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        if content_type.starts_with("image/") || IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            Self::Image
        } else if content_type.starts_with("video/")
            || VIDEO_EXTENSIONS.contains(&extension.as_str())
        {
            Self::Video
        } else {
            Self::File
        }
    }
}

/// A stored media file belonging to a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: AssetId,
    pub vault_id: VaultId,
    pub folder_id: Option<FolderId>,
    pub uploader_id: Option<UserId>,
    /// Public URL of the backing blob.
    pub url: String,
    /// Path of the backing blob inside the object store.
    pub storage_path: String,
    pub file_name: String,
    pub kind: MediaKind,
    pub size_bytes: u64,
    pub like_count: u64,
    pub created_at: SystemTime,
}

/// A like on an asset. At most one record exists per (asset, actor).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LikeRecord {
    pub asset_id: AssetId,
    pub actor: Actor,
}
