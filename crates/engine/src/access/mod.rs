//! Vault access.
//!
//! - [`resolver`]: permission derivation and the passkey join protocol
//! - [`grants`]: session-local record of accepted passkeys
//! - [`code`]: join-code lookup and generation

pub mod code;
pub mod grants;
pub mod resolver;

pub use code::{generate_vault_code, CodeResolver, VAULT_CODE_LEN};
pub use grants::SessionGrants;
pub use resolver::{derive, AccessBasis, AccessResolver, Derivation, Permissions};
