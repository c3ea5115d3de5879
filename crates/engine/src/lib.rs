//! # EventVault Engine
//!
//! The client-side engine behind EventVault shared media vaults: who may
//! see a vault, how uploads progress, how deletes stay consistent with the
//! remote store, and how the local view follows remote changes.
//!
//! ## Overview
//!
//! - **Access**: permissions derived from ownership, membership, the public
//!   flag and session-local passkey grants
//! - **Uploads**: concurrent, independently progressing upload tasks with
//!   monotonic progress and per-file terminal states
//! - **Deletes**: optimistic removal from the local view with rollback when
//!   the remote delete fails
//! - **Sync**: change-feed subscription that reloads the active scope
//! - **Selection and listing**: multi-select, bulk-action availability,
//!   sorted folder and file listing
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                            Engine                             │
//! │  identity session · middleware · session grants · uploads     │
//! ├───────────────────────────────────────────────────────────────┤
//! │                         VaultSession                          │
//! │                                                               │
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────────────┐  │
//! │  │    Access    │  │   Mutation   │  │     SyncChannel     │  │
//! │  │   Resolver   │  │    Ledger    │  │                     │  │
//! │  └──────────────┘  └──────────────┘  └─────────────────────┘  │
//! │  ┌─────────────────────────┐  ┌─────────────────────────────┐ │
//! │  │     CollectionView      │  │       SelectionModel        │ │
//! │  └─────────────────────────┘  └─────────────────────────────┘ │
//! ├───────────────────────────────────────────────────────────────┤
//! │  IdentityProvider · RelationalStore · ChangeFeed · BlobStore  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use engine::backend::Backends;
//! use engine::{Config, Engine};
//! use model::GuestId;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (backends, _identity, _store, _blobs) = Backends::in_memory();
//!     let engine = Engine::start(Config::default(), backends, GuestId::new()).await?;
//!
//!     if let Some(vault_id) = engine.resolve_code("K7Q2ZD").await.found() {
//!         let session = engine.open_vault(vault_id).await?;
//!         println!("can view: {}", session.permissions().can_view);
//!         session.close().await;
//!     }
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`backend`]: Traits for the remote services and in-memory implementations
//! - [`auth`]: Identity bootstrap and remote-failure middleware
//! - [`access`]: Permission resolution, join protocol, join codes
//! - [`upload`]: Upload queue
//! - [`ledger`]: Optimistic deletes
//! - [`sync`]: Change-feed subscription
//! - [`selection`]: Multi-select
//! - [`collection`]: Folder and file listing
//! - [`likes`]: Likes and the guest identity
//! - [`session`]: One opened vault
//! - [`orchestrator`]: Engine-wide state

pub mod access;
pub mod auth;
pub mod backend;
pub mod collection;
pub mod config;
pub mod ledger;
pub mod likes;
pub mod orchestrator;
pub mod selection;
pub mod session;
pub mod sync;
pub mod upload;

pub use model;

pub use config::{Config, ConfigError};

pub use access::{AccessResolver, CodeResolver, Permissions, SessionGrants};

pub use auth::{ExpiredSessionInterceptor, IdentitySession, Interceptor, MiddlewareChain};

pub use backend::{BlobStore, ChangeFeed, IdentityProvider, RelationalStore};

pub use upload::{UploadError, UploadEvent, UploadFile, UploadQueue, UploadStatus, UploadTask};

pub use ledger::{DeleteOutcome, MutationLedger};

pub use sync::{Subscription, SyncChannel};

pub use selection::{BulkActions, SelectionItem, SelectionModel};

pub use collection::{Breadcrumb, CollectionView, Listing};

pub use likes::{GuestIdentity, LikeService, LikeState};

pub use session::{SessionEvent, VaultSession};

pub use orchestrator::Engine;
