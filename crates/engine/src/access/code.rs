//! Join-code resolution.

use std::sync::Arc;

use model::{Lookup, VaultId};
use rand::Rng;

use crate::backend::RelationalStore;

/// Length of generated vault codes.
pub const VAULT_CODE_LEN: usize = 6;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generates a random upper-case alphanumeric vault code.
pub fn generate_vault_code() -> String {
    let mut rng = rand::thread_rng();
    (0..VAULT_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Maps a human-entered code to a vault id.
pub struct CodeResolver {
    store: Arc<dyn RelationalStore>,
}

impl CodeResolver {
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self { store }
    }

    /// Tries the code as entered, then upper-cased.
    pub async fn resolve(&self, code: &str) -> Lookup<VaultId> {
        let code = code.trim();
        if code.is_empty() {
            return Lookup::NotFound;
        }

        let exact = self.lookup(code).await;
        if !matches!(exact, Lookup::NotFound) {
            return exact;
        }

        let upper = code.to_uppercase();
        if upper == code {
            return Lookup::NotFound;
        }
        self.lookup(&upper).await
    }

    async fn lookup(&self, code: &str) -> Lookup<VaultId> {
        let lookup = Lookup::from_result(self.store.find_vault_by_code(code.to_string()).await);
        if let Lookup::Error(reason) = &lookup {
            tracing::warn!(code, reason = %reason, "Code lookup failed");
        }
        lookup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use model::{UserId, Vault};

    #[test]
    fn test_generated_code_shape() {
        for _ in 0..32 {
            let code = generate_vault_code();
            assert_eq!(code.len(), VAULT_CODE_LEN);
            assert!(code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_resolve_exact_and_upper_cased() {
        let store = MemoryStore::new();
        let vault = Vault::new(UserId::new(), "party", "PARTY1");
        store.add_vault(vault.clone()).unwrap();
        let resolver = CodeResolver::new(Arc::new(store));

        assert_eq!(resolver.resolve("PARTY1").await, Lookup::Found(vault.id));
        assert_eq!(resolver.resolve("  party1 ").await, Lookup::Found(vault.id));
        assert_eq!(resolver.resolve("NOPE").await, Lookup::NotFound);
        assert_eq!(resolver.resolve("   ").await, Lookup::NotFound);
    }

    #[tokio::test]
    async fn test_resolve_reports_backend_error() {
        let store = MemoryStore::new();
        store.expire_session(true).unwrap();
        let resolver = CodeResolver::new(Arc::new(store));

        assert!(matches!(resolver.resolve("X").await, Lookup::Error(_)));
    }
}
