//! Remote-failure middleware.
//!
//! Interceptors are registered explicitly on a [`MiddlewareChain`] and see
//! every remote failure the engine observes. Each interceptor name can be
//! registered at most once per chain; the returned [`Registration`] removes
//! it again on [`Registration::teardown`] or drop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use model::VaultError;
use thiserror::Error;

use super::session::IdentitySession;
use crate::backend::IdentityProvider;

/// Errors from registering middleware.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MiddlewareError {
    /// An interceptor with this name is already installed.
    #[error("interceptor already registered: {0}")]
    AlreadyRegistered(&'static str),

    /// The chain lock was poisoned.
    #[error("middleware chain lock poisoned")]
    LockPoisoned,
}

/// Observer of remote failures.
pub trait Interceptor: Send + Sync {
    /// Unique name of the interceptor within a chain.
    fn name(&self) -> &'static str;

    /// Called for every remote failure, in registration order.
    fn on_remote_error<'a>(&'a self, error: &'a VaultError) -> BoxFuture<'a, ()>;
}

/// Ordered set of installed interceptors.
#[derive(Default)]
pub struct MiddlewareChain {
    interceptors: RwLock<BTreeMap<usize, Arc<dyn Interceptor>>>,
    next_slot: AtomicUsize,
}

impl MiddlewareChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Installs an interceptor.
    pub fn register(
        self: &Arc<Self>,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<Registration, MiddlewareError> {
        let name = interceptor.name();
        let mut interceptors = self
            .interceptors
            .write()
            .map_err(|_| MiddlewareError::LockPoisoned)?;

        if interceptors.values().any(|i| i.name() == name) {
            return Err(MiddlewareError::AlreadyRegistered(name));
        }

        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        interceptors.insert(slot, interceptor);

        tracing::debug!(interceptor = name, "Registered middleware");

        Ok(Registration {
            chain: Arc::downgrade(self),
            slot,
            name,
            active: true,
        })
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.interceptors
            .read()
            .map(|i| i.values().any(|i| i.name() == name))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.interceptors.read().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Passes a remote failure through every installed interceptor.
    pub async fn observe(&self, error: &VaultError) {
        let interceptors: Vec<Arc<dyn Interceptor>> = match self.interceptors.read() {
            Ok(i) => i.values().cloned().collect(),
            Err(_) => {
                tracing::error!("Middleware chain lock poisoned, failure not observed");
                return;
            }
        };

        for interceptor in interceptors {
            interceptor.on_remote_error(error).await;
        }
    }

    fn remove(&self, slot: usize) -> bool {
        self.interceptors
            .write()
            .map(|mut i| i.remove(&slot).is_some())
            .unwrap_or(false)
    }
}

/// Handle to an installed interceptor.
#[must_use = "dropping a Registration uninstalls the interceptor"]
pub struct Registration {
    chain: Weak<MiddlewareChain>,
    slot: usize,
    name: &'static str,
    active: bool,
}

impl Registration {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Uninstalls the interceptor.
    pub fn teardown(mut self) {
        self.uninstall();
    }

    fn uninstall(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(chain) = self.chain.upgrade() {
            if chain.remove(self.slot) {
                tracing::debug!(interceptor = self.name, "Tore down middleware");
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.uninstall();
    }
}

/// Signs the user out when the remote side reports an expired session.
///
/// Recovery runs once per expired session; further failures are ignored
/// until the identity session holds an identity again.
pub struct ExpiredSessionInterceptor {
    provider: Arc<dyn IdentityProvider>,
    session: Arc<IdentitySession>,
    recoveries: AtomicUsize,
}

impl ExpiredSessionInterceptor {
    pub const NAME: &'static str = "expired-session";

    pub fn new(provider: Arc<dyn IdentityProvider>, session: Arc<IdentitySession>) -> Self {
        Self {
            provider,
            session,
            recoveries: AtomicUsize::new(0),
        }
    }

    /// Number of sign-out recoveries performed.
    pub fn recoveries(&self) -> usize {
        self.recoveries.load(Ordering::SeqCst)
    }
}

impl Interceptor for ExpiredSessionInterceptor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_remote_error<'a>(&'a self, error: &'a VaultError) -> BoxFuture<'a, ()> {
        async move {
            if !matches!(error, VaultError::SessionExpired(_)) {
                return;
            }
            if self.session.identity().is_none() {
                tracing::debug!("Session already cleared, skipping recovery");
                return;
            }

            tracing::warn!(error = %error, "Auth session conflict detected, signing out");
            self.recoveries.fetch_add(1, Ordering::SeqCst);

            if let Err(e) = self.provider.sign_out().await {
                tracing::error!(error = %e, "Sign-out during session recovery failed");
            }
            self.session.clear();
        }
        .boxed()
    }
}
