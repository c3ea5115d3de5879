//! Identity session bootstrap and auth state tracking.

use std::sync::Arc;
use std::time::Duration;

use model::Identity;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::backend::{AuthEvent, IdentityProvider};

/// How the initial identity check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// A session was found.
    Authenticated,
    /// The provider reported no session.
    Anonymous,
    /// The provider did not answer within the safety timeout.
    TimedOut,
    /// The provider failed; treated as anonymous.
    Failed,
}

/// The current identity, updated from auth state changes.
///
/// Observers subscribe to a watch channel so that every identity change
/// can trigger a fresh permission resolution.
pub struct IdentitySession {
    current: watch::Sender<Option<Identity>>,
    outcome: BootstrapOutcome,
}

impl IdentitySession {
    /// Creates a session with a known identity, skipping the provider.
    pub fn with_identity(identity: Option<Identity>) -> Self {
        let outcome = if identity.is_some() {
            BootstrapOutcome::Authenticated
        } else {
            BootstrapOutcome::Anonymous
        };
        let (current, _) = watch::channel(identity);
        Self { current, outcome }
    }

    /// Asks the provider for the active session.
    ///
    /// A slow or failing provider degrades to the unauthenticated posture
    /// once `timeout` elapses instead of blocking the caller.
    pub async fn bootstrap(provider: &dyn IdentityProvider, timeout: Duration) -> Self {
        let (identity, outcome) = match tokio::time::timeout(timeout, provider.get_session()).await
        {
            Ok(Ok(Some(identity))) => (Some(identity), BootstrapOutcome::Authenticated),
            Ok(Ok(None)) => (None, BootstrapOutcome::Anonymous),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Identity bootstrap failed, continuing unauthenticated");
                (None, BootstrapOutcome::Failed)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Identity bootstrap timed out, continuing unauthenticated"
                );
                (None, BootstrapOutcome::TimedOut)
            }
        };

        tracing::info!(outcome = ?outcome, "Identity session initialized");

        let (current, _) = watch::channel(identity);
        Self { current, outcome }
    }

    pub fn outcome(&self) -> BootstrapOutcome {
        self.outcome
    }

    /// Returns the current identity.
    pub fn identity(&self) -> Option<Identity> {
        self.current.borrow().clone()
    }

    /// Returns a receiver notified on every identity change.
    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }

    /// Applies an auth state change.
    pub fn apply(&self, event: &AuthEvent) {
        let next = match event {
            AuthEvent::SignedOut | AuthEvent::UserDeleted => None,
            AuthEvent::SignedIn(identity) | AuthEvent::TokenRefreshed(identity) => {
                Some(identity.clone())
            }
        };

        tracing::debug!(event = ?event, "Applying auth state change");

        self.current.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Drops the identity locally.
    pub fn clear(&self) {
        self.apply(&AuthEvent::SignedOut);
    }

    /// Follows the provider's auth events until the provider goes away.
    pub fn spawn_listener(
        self: &Arc<Self>,
        provider: Arc<dyn IdentityProvider>,
    ) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let mut events = provider.auth_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => session.apply(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed auth events, re-reading session");
                        match provider.get_session().await {
                            Ok(Some(identity)) => session.apply(&AuthEvent::SignedIn(identity)),
                            Ok(None) => session.clear(),
                            Err(e) => tracing::error!(error = %e, "Failed to re-read session"),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Auth event listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryIdentity;
    use model::UserId;

    #[tokio::test]
    async fn test_bootstrap_authenticated() {
        let provider = MemoryIdentity::new();
        let identity = Identity::new(UserId::new());
        provider.sign_in(identity.clone());

        let session = IdentitySession::bootstrap(&provider, Duration::from_secs(1)).await;
        assert_eq!(session.outcome(), BootstrapOutcome::Authenticated);
        assert_eq!(session.identity(), Some(identity));
    }

    #[tokio::test]
    async fn test_bootstrap_anonymous() {
        let provider = MemoryIdentity::new();
        let session = IdentitySession::bootstrap(&provider, Duration::from_secs(1)).await;
        assert_eq!(session.outcome(), BootstrapOutcome::Anonymous);
        assert!(session.identity().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_times_out_to_unauthenticated() {
        let provider = MemoryIdentity::new();
        provider.sign_in(Identity::new(UserId::new()));
        provider.set_session_delay(Some(Duration::from_secs(30)));

        let session = IdentitySession::bootstrap(&provider, Duration::from_secs(3)).await;
        assert_eq!(session.outcome(), BootstrapOutcome::TimedOut);
        assert!(session.identity().is_none());
    }

    #[test]
    fn test_apply_events() {
        let session = IdentitySession::with_identity(None);
        let mut rx = session.subscribe();
        let identity = Identity::new(UserId::new());

        session.apply(&AuthEvent::SignedIn(identity.clone()));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert_eq!(session.identity(), Some(identity.clone()));

        // Refresh with the same identity is not a change.
        session.apply(&AuthEvent::TokenRefreshed(identity));
        assert!(!rx.has_changed().unwrap());

        session.apply(&AuthEvent::UserDeleted);
        assert!(session.identity().is_none());
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_listener_follows_provider() {
        let provider = MemoryIdentity::new();
        let session = Arc::new(IdentitySession::with_identity(None));
        let mut rx = session.subscribe();
        let _listener = session.spawn_listener(Arc::new(provider.clone()));

        let identity = Identity::new(UserId::new());
        provider.sign_in(identity.clone());
        rx.changed().await.unwrap();
        assert_eq!(session.identity(), Some(identity));

        provider.sign_out().await.unwrap();
        rx.changed().await.unwrap();
        assert!(session.identity().is_none());
    }
}
