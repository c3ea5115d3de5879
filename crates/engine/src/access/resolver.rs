//! Effective permissions for one visitor of one vault.
//!
//! Permissions are derived fresh on every call from the identity, the
//! vault flags, the visitor's membership and the session grants. Nothing
//! is cached across vault or identity changes.

use std::sync::Arc;

use model::{Identity, MediaAsset, Member, MemberRole, Result, Vault, VaultError};
use serde::{Deserialize, Serialize};

use super::grants::SessionGrants;
use crate::auth::MiddlewareChain;
use crate::backend::RelationalStore;

/// What a visitor may do in a vault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub can_view: bool,
    pub can_upload: bool,
    pub can_download: bool,
    pub is_owner: bool,
    pub is_admin: bool,
}

impl Permissions {
    /// No access at all.
    pub fn none() -> Self {
        Self::default()
    }

    fn full(is_owner: bool) -> Self {
        Self {
            can_view: true,
            can_upload: true,
            can_download: true,
            is_owner,
            is_admin: true,
        }
    }

    /// Whether `identity` may delete `asset`: admins delete anything,
    /// uploaders delete their own files while uploads are allowed.
    pub fn can_delete_asset(&self, identity: Option<&Identity>, asset: &MediaAsset) -> bool {
        if self.is_admin {
            return true;
        }
        match (identity, asset.uploader_id) {
            (Some(identity), Some(uploader)) => self.can_upload && identity.user_id == uploader,
            _ => false,
        }
    }
}

/// Which rule granted view access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessBasis {
    Owner,
    AdminMember,
    Member,
    Public,
    Grant,
    Denied,
}

/// Result of the pure permission derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Derivation {
    pub permissions: Permissions,
    pub basis: AccessBasis,
    /// A viewer membership should be created for the identity.
    pub insert_viewer: bool,
}

/// Applies the resolution order without touching any backend.
pub fn derive(
    identity: Option<&Identity>,
    vault: &Vault,
    membership: Option<&Member>,
    has_grant: bool,
) -> Derivation {
    let basis = if identity.is_some_and(|i| i.user_id == vault.owner_id) {
        AccessBasis::Owner
    } else if membership.is_some_and(|m| m.role.is_admin()) {
        AccessBasis::AdminMember
    } else if membership.is_some() {
        AccessBasis::Member
    } else if vault.is_public {
        AccessBasis::Public
    } else if has_grant {
        AccessBasis::Grant
    } else {
        AccessBasis::Denied
    };

    let permissions = match basis {
        AccessBasis::Owner => Permissions::full(true),
        AccessBasis::AdminMember => Permissions::full(false),
        AccessBasis::Denied => Permissions::none(),
        AccessBasis::Member | AccessBasis::Public | AccessBasis::Grant => Permissions {
            can_view: true,
            can_upload: vault.allow_uploads,
            can_download: vault.allow_downloads,
            is_owner: false,
            is_admin: false,
        },
    };

    Derivation {
        permissions,
        basis,
        insert_viewer: basis == AccessBasis::Public && identity.is_some(),
    }
}

/// Resolves permissions and handles the join protocol.
pub struct AccessResolver {
    store: Arc<dyn RelationalStore>,
    grants: Arc<SessionGrants>,
    middleware: Arc<MiddlewareChain>,
}

impl AccessResolver {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        grants: Arc<SessionGrants>,
        middleware: Arc<MiddlewareChain>,
    ) -> Self {
        Self {
            store,
            grants,
            middleware,
        }
    }

    pub fn grants(&self) -> &Arc<SessionGrants> {
        &self.grants
    }

    /// Resolves the visitor's permissions for `vault`.
    ///
    /// Remote failures never escape: a failed membership lookup counts as
    /// no membership and the remaining rules still apply.
    pub async fn resolve(&self, identity: Option<&Identity>, vault: &Vault) -> Permissions {
        let membership = match identity {
            Some(identity) => self.lookup_membership(vault, identity).await,
            None => None,
        };

        let derivation = derive(
            identity,
            vault,
            membership.as_ref(),
            self.grants.has(vault.id),
        );

        if derivation.insert_viewer {
            if let Some(identity) = identity {
                self.insert_viewer(vault, identity).await;
            }
        }

        tracing::debug!(
            vault_id = %vault.id,
            basis = ?derivation.basis,
            can_view = derivation.permissions.can_view,
            can_upload = derivation.permissions.can_upload,
            can_download = derivation.permissions.can_download,
            "Resolved access"
        );

        derivation.permissions
    }

    /// Validates a passkey for `vault`.
    ///
    /// The error never says why the passkey was rejected. On success a
    /// session grant is recorded and, for an identity without membership,
    /// a viewer membership is created.
    pub async fn request_join(
        &self,
        identity: Option<&Identity>,
        vault: &Vault,
        passkey: &str,
    ) -> Result<()> {
        if !vault.passkey_matches(passkey) {
            tracing::info!(vault_id = %vault.id, "Join rejected");
            return Err(VaultError::AccessDenied("invalid passkey".to_string()));
        }

        self.grants.record(vault.id);

        if let Some(identity) = identity {
            if identity.user_id != vault.owner_id
                && self.lookup_membership(vault, identity).await.is_none()
            {
                self.insert_viewer(vault, identity).await;
            }
        }

        tracing::info!(vault_id = %vault.id, "Join accepted");
        Ok(())
    }

    async fn lookup_membership(&self, vault: &Vault, identity: &Identity) -> Option<Member> {
        match self.store.get_membership(vault.id, identity.user_id).await {
            Ok(membership) => membership,
            Err(e) => {
                tracing::warn!(
                    vault_id = %vault.id,
                    error = %e,
                    "Membership lookup failed, treating as no membership"
                );
                self.middleware.observe(&e).await;
                None
            }
        }
    }

    async fn insert_viewer(&self, vault: &Vault, identity: &Identity) {
        let member = Member::new(vault.id, identity.user_id, MemberRole::Viewer);
        match self.store.insert_membership(member).await {
            Ok(()) => {
                tracing::info!(vault_id = %vault.id, user_id = %identity.user_id, "Created viewer membership");
            }
            Err(e) if e.is_swallowed() => {
                tracing::debug!(vault_id = %vault.id, "Viewer membership already exists");
            }
            Err(e) => {
                tracing::warn!(vault_id = %vault.id, error = %e, "Failed to create viewer membership");
                self.middleware.observe(&e).await;
            }
        }
    }
}
