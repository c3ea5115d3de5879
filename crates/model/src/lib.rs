//! # EventVault Model
//!
//! Plain data types shared by the EventVault engine and its storage
//! backends.
//!
//! ## Overview
//!
//! - **Vaults**: shared media collections with visibility flags and an
//!   optional passkey
//! - **Members**: durable (vault, user, role) records
//! - **Folders and assets**: the contents of a vault
//! - **Actors**: an authenticated identity or an anonymous guest
//! - **Errors**: the failure taxonomy every operation reports through
//!
//! ## Example Usage
//!
//! ```rust
//! use model::{UserId, Vault};
//!
//! let vault = Vault::new(UserId::new(), "Team offsite", "K7Q2ZD")
//!     .with_passkey("1234");
//!
//! assert!(vault.passkey_matches("1234"));
//! assert!(!vault.passkey_matches("4321"));
//! ```
//!
//! ## Modules
//!
//! - [`ids`]: Strongly typed identifiers
//! - [`vault`]: Vaults, memberships and folders
//! - [`media`]: Media assets, classification and likes
//! - [`actor`]: Identities and actors
//! - [`error`]: Error types

pub mod actor;
pub mod error;
pub mod ids;
pub mod media;
pub mod vault;

pub use actor::{Actor, Identity};
pub use error::{Lookup, Result, VaultError};
pub use ids::{AssetId, FolderId, GuestId, TaskId, UserId, VaultId};
pub use media::{LikeRecord, MediaAsset, MediaKind, DEFAULT_CONTENT_TYPE};
pub use vault::{Folder, Member, MemberRole, Vault};
