//! Change-feed subscription driving collection reloads.
//!
//! Every notification for the vault's assets or folders triggers a full
//! reload of the active scope. Notifications that pile up while a reload
//! runs are folded into the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use model::{Result, VaultId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::MiddlewareChain;
use crate::backend::{ChangeFeed, ChangeNotification, Table};

/// Callback run for each batch of notifications.
pub type ReloadFn = Arc<dyn Fn(ChangeNotification) -> BoxFuture<'static, ()> + Send + Sync>;

/// Opens change-feed subscriptions.
pub struct SyncChannel {
    feed: Arc<dyn ChangeFeed>,
    middleware: Arc<MiddlewareChain>,
}

impl SyncChannel {
    pub fn new(feed: Arc<dyn ChangeFeed>, middleware: Arc<MiddlewareChain>) -> Self {
        Self { feed, middleware }
    }

    /// Subscribes to asset and folder changes of `vault_id`.
    pub async fn subscribe(&self, vault_id: VaultId, on_change: ReloadFn) -> Result<Subscription> {
        let rx = match self
            .feed
            .subscribe(vault_id, vec![Table::Assets, Table::Folders])
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(vault_id = %vault_id, error = %e, "Failed to open change feed");
                self.middleware.observe(&e).await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let reloads = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(listen(
            vault_id,
            rx,
            on_change,
            cancel.clone(),
            Arc::clone(&reloads),
        ));

        tracing::info!(vault_id = %vault_id, "Change feed subscription opened");

        Ok(Subscription {
            vault_id,
            cancel,
            handle: Some(handle),
            reloads,
        })
    }
}

async fn listen(
    vault_id: VaultId,
    mut rx: mpsc::Receiver<ChangeNotification>,
    on_change: ReloadFn,
    cancel: CancellationToken,
    reloads: Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            notification = rx.recv() => {
                let Some(mut notification) = notification else {
                    tracing::info!(vault_id = %vault_id, "Change feed closed by remote");
                    break;
                };

                let mut coalesced = 0;
                while let Ok(next) = rx.try_recv() {
                    notification = next;
                    coalesced += 1;
                }

                tracing::debug!(
                    vault_id = %vault_id,
                    table = ?notification.table,
                    kind = ?notification.kind,
                    coalesced,
                    "Change notification, reloading scope"
                );

                on_change(notification).await;
                reloads.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

/// Handle to an open subscription. Dropping it cancels the subscription.
pub struct Subscription {
    vault_id: VaultId,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    reloads: Arc<AtomicU64>,
}

impl Subscription {
    pub fn vault_id(&self) -> VaultId {
        self.vault_id
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Number of reloads triggered so far.
    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Closes the subscription and waits for the listener to stop.
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(vault_id = %self.vault_id, error = %e, "Change feed listener panicked");
            }
        }
        tracing::info!(vault_id = %self.vault_id, "Change feed subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChangeKind, MemoryStore};
    use futures_util::FutureExt;
    use tokio::sync::mpsc::unbounded_channel;

    fn forwarding(tx: mpsc::UnboundedSender<ChangeNotification>) -> ReloadFn {
        Arc::new(move |n| {
            let _ = tx.send(n);
            futures_util::future::ready(()).boxed()
        })
    }

    #[tokio::test]
    async fn test_notification_triggers_reload() {
        let store = MemoryStore::new();
        let sync = SyncChannel::new(Arc::new(store.clone()), MiddlewareChain::new());
        let vault = VaultId::new();
        let (tx, mut rx) = unbounded_channel();

        let subscription = sync.subscribe(vault, forwarding(tx)).await.unwrap();
        assert!(subscription.is_active());

        store.notify(vault, Table::Folders, ChangeKind::Delete);
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.table, Table::Folders);

        subscription.unsubscribe().await;
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_other_vaults_are_ignored() {
        let store = MemoryStore::new();
        let sync = SyncChannel::new(Arc::new(store.clone()), MiddlewareChain::new());
        let vault = VaultId::new();
        let (tx, mut rx) = unbounded_channel();

        let subscription = sync.subscribe(vault, forwarding(tx)).await.unwrap();
        store.notify(VaultId::new(), Table::Assets, ChangeKind::Insert);
        store.notify(vault, Table::Assets, ChangeKind::Update);

        assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Update);
        assert!(rx.try_recv().is_err());
        drop(subscription);
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_reported() {
        let store = MemoryStore::new();
        store.expire_session(true).unwrap();
        let sync = SyncChannel::new(Arc::new(store.clone()), MiddlewareChain::new());
        let (tx, _rx) = unbounded_channel();

        assert!(sync.subscribe(VaultId::new(), forwarding(tx)).await.is_err());
    }
}
