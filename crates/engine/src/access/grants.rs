//! Session-local passkey grants.

use dashmap::DashSet;
use model::VaultId;

/// Vaults whose passkey was validated during this session.
///
/// Grants are never persisted; a new session starts empty and the visitor
/// is prompted again.
#[derive(Debug, Default)]
pub struct SessionGrants {
    granted: DashSet<VaultId>,
}

impl SessionGrants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the passkey for `vault_id` was accepted.
    pub fn record(&self, vault_id: VaultId) {
        if self.granted.insert(vault_id) {
            tracing::debug!(vault_id = %vault_id, "Recorded session grant");
        }
    }

    pub fn has(&self, vault_id: VaultId) -> bool {
        self.granted.contains(&vault_id)
    }

    pub fn revoke(&self, vault_id: VaultId) -> bool {
        self.granted.remove(&vault_id).is_some()
    }

    pub fn clear(&self) {
        self.granted.clear();
    }

    pub fn len(&self) -> usize {
        self.granted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_revoke() {
        let grants = SessionGrants::new();
        let vault = VaultId::new();

        assert!(!grants.has(vault));
        grants.record(vault);
        grants.record(vault);
        assert!(grants.has(vault));
        assert_eq!(grants.len(), 1);

        assert!(grants.revoke(vault));
        assert!(!grants.revoke(vault));
        assert!(grants.is_empty());
    }

    #[test]
    fn test_clear() {
        let grants = SessionGrants::new();
        grants.record(VaultId::new());
        grants.record(VaultId::new());
        grants.clear();
        assert!(grants.is_empty());
    }
}
