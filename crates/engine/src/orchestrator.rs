//! Engine orchestrator.
//!
//! The `Engine` owns everything that outlives a single opened vault: the
//! identity session, the middleware chain with the expired-session
//! interceptor, the session grants and the upload queue. Vaults are opened
//! from it as [`VaultSession`]s.

use std::sync::Arc;

use anyhow::{Context, Result};
use model::{Actor, GuestId, Identity, Lookup, VaultId};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::access::{CodeResolver, SessionGrants};
use crate::auth::{ExpiredSessionInterceptor, IdentitySession, MiddlewareChain, Registration};
use crate::backend::Backends;
use crate::config::Config;
use crate::likes::LikeService;
use crate::session::VaultSession;
use crate::upload::UploadQueue;

/// Long-lived engine state shared by every opened vault.
pub struct Engine {
    config: Config,
    backends: Backends,
    middleware: Arc<MiddlewareChain>,
    identity: Arc<IdentitySession>,
    grants: Arc<SessionGrants>,
    uploads: UploadQueue,
    guest: GuestId,
    expired_session: Option<Registration>,
    auth_listener: Option<JoinHandle<()>>,
}

impl Engine {
    /// Bootstraps the identity and wires up the shared components.
    pub async fn start(config: Config, backends: Backends, guest: GuestId) -> Result<Self> {
        let identity = Arc::new(
            IdentitySession::bootstrap(
                backends.identity.as_ref(),
                config.session.bootstrap_timeout(),
            )
            .await,
        );
        let auth_listener = identity.spawn_listener(Arc::clone(&backends.identity));

        let middleware = MiddlewareChain::new();
        let expired_session = middleware
            .register(Arc::new(ExpiredSessionInterceptor::new(
                Arc::clone(&backends.identity),
                Arc::clone(&identity),
            )))
            .context("Failed to register expired-session middleware")?;

        let uploads = UploadQueue::new(
            config.upload.clone(),
            config.sync.event_buffer,
            Arc::clone(&backends.store),
            Arc::clone(&backends.blobs),
            Arc::clone(&middleware),
        );

        info!(
            outcome = ?identity.outcome(),
            guest_id = %guest,
            "Engine started"
        );

        Ok(Self {
            config,
            backends,
            middleware,
            identity,
            grants: Arc::new(SessionGrants::new()),
            uploads,
            guest,
            expired_session: Some(expired_session),
            auth_listener: Some(auth_listener),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn middleware(&self) -> &Arc<MiddlewareChain> {
        &self.middleware
    }

    pub fn identity_session(&self) -> &Arc<IdentitySession> {
        &self.identity
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.identity()
    }

    pub fn grants(&self) -> &Arc<SessionGrants> {
        &self.grants
    }

    /// The upload queue. Uploads keep running when a vault is closed.
    pub fn uploads(&self) -> &UploadQueue {
        &self.uploads
    }

    pub fn guest(&self) -> GuestId {
        self.guest
    }

    /// The actor for likes and uploads right now.
    pub fn actor(&self) -> Actor {
        Actor::from_parts(self.identity().as_ref(), self.guest)
    }

    pub fn likes(&self) -> LikeService {
        LikeService::new(Arc::clone(&self.backends.store), Arc::clone(&self.middleware))
    }

    /// Maps a human-entered code to a vault id.
    pub async fn resolve_code(&self, code: &str) -> Lookup<VaultId> {
        CodeResolver::new(Arc::clone(&self.backends.store))
            .resolve(code)
            .await
    }

    /// Opens a vault.
    pub async fn open_vault(&self, vault_id: VaultId) -> model::Result<VaultSession> {
        VaultSession::open(self, vault_id).await
    }

    /// Removes the middleware and stops following auth events.
    pub fn shutdown(mut self) {
        self.teardown();
        info!("Engine stopped");
    }

    fn teardown(&mut self) {
        if let Some(registration) = self.expired_session.take() {
            registration.teardown();
        }
        if let Some(listener) = self.auth_listener.take() {
            listener.abort();
            debug!("Auth listener stopped");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}
