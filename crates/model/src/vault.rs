//! Vaults, memberships and folders.

use serde::{Deserialize, Serialize};

use crate::ids::{FolderId, UserId, VaultId};

/// A shared media collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub id: VaultId,
    pub owner_id: UserId,
    pub name: String,
    /// Public vaults are viewable without a passkey.
    pub is_public: bool,
    pub allow_uploads: bool,
    pub allow_downloads: bool,
    /// Shared secret for private vaults. `None` means no passkey can ever
    /// grant access.
    pub passkey: Option<String>,
    /// Human-entered join code.
    pub code: String,
}

impl Vault {
    /// Creates a private vault with uploads disabled and downloads enabled.
    pub fn new(owner_id: UserId, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: VaultId::new(),
            owner_id,
            name: name.into(),
            is_public: false,
            allow_uploads: false,
            allow_downloads: true,
            passkey: None,
            code: code.into(),
        }
    }

    pub fn with_passkey(mut self, passkey: impl Into<String>) -> Self {
        self.passkey = Some(passkey.into());
        self
    }

    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    pub fn uploads(mut self, allow: bool) -> Self {
        self.allow_uploads = allow;
        self
    }

    pub fn downloads(mut self, allow: bool) -> Self {
        self.allow_downloads = allow;
        self
    }

    /// Checks an entered passkey against the vault's passkey.
    ///
    /// Surrounding whitespace of the input is ignored; the comparison is
    /// otherwise exact and case-sensitive. A vault without a passkey never
    /// matches, not even the empty string.
    pub fn passkey_matches(&self, input: &str) -> bool {
        match &self.passkey {
            Some(passkey) => input.trim() == passkey,
            None => false,
        }
    }
}

/// Role of a member within a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Viewer,
}

impl MemberRole {
    /// Owners and admins hold full access to the vault.
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

/// A durable membership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub vault_id: VaultId,
    pub user_id: UserId,
    pub role: MemberRole,
}

impl Member {
    pub fn new(vault_id: VaultId, user_id: UserId, role: MemberRole) -> Self {
        Self {
            vault_id,
            user_id,
            role,
        }
    }

    pub fn viewer(vault_id: VaultId, user_id: UserId) -> Self {
        Self::new(vault_id, user_id, MemberRole::Viewer)
    }
}

/// A folder in a vault's tree. `parent_id == None` is the root level.
///
/// Folders are never re-parented after creation, so the tree cannot grow
/// cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub vault_id: VaultId,
    pub parent_id: Option<FolderId>,
    pub name: String,
}

impl Folder {
    pub fn new(vault_id: VaultId, parent_id: Option<FolderId>, name: impl Into<String>) -> Self {
        Self {
            id: FolderId::new(),
            vault_id,
            parent_id,
            name: name.into(),
        }
    }
}
