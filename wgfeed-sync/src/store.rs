//! Store and runtime boundaries.
//!
//! The sync engine does not own persistence or the tunnel runtime; it
//! drives them through these traits. The composition root supplies real
//! implementations; [`memory`] provides in-memory ones for tests.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::subscription::{
    ManagedTunnel, Subscription, SubscriptionId, TunnelConfig, TunnelId,
};

/// Persistence for subscription rows.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, id: SubscriptionId) -> SyncResult<Option<Subscription>>;

    async fn get_by_feed_id(&self, feed_id: &str) -> SyncResult<Option<Subscription>>;

    /// Non-terminal subscriptions in polling mode.
    async fn list_polling(&self) -> SyncResult<Vec<Subscription>>;

    /// Non-terminal subscriptions in realtime mode.
    async fn list_realtime(&self) -> SyncResult<Vec<Subscription>>;

    /// Inserts a new subscription, assigning its id. Returns the stored row.
    async fn insert(&self, subscription: Subscription) -> SyncResult<Subscription>;

    async fn update(&self, subscription: &Subscription) -> SyncResult<()>;

    /// Deletes a subscription; its managed-tunnel mappings cascade.
    async fn delete(&self, id: SubscriptionId) -> SyncResult<()>;
}

/// Persistence for managed-tunnel mappings.
#[async_trait]
pub trait ManagedTunnelStore: Send + Sync {
    async fn list_for_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> SyncResult<Vec<ManagedTunnel>>;

    /// Inserts or replaces the mapping for (subscription, feed tunnel id).
    async fn upsert(&self, mapping: ManagedTunnel) -> SyncResult<()>;

    async fn delete_by_feed_tunnel_ids(
        &self,
        subscription_id: SubscriptionId,
        feed_tunnel_ids: &[String],
    ) -> SyncResult<()>;
}

/// Persistence for local tunnel configs (externally owned).
///
/// Names are case-sensitive and unique process-wide; `save` on a config
/// without an id assigns one.
#[async_trait]
pub trait TunnelStore: Send + Sync {
    async fn list_all(&self) -> SyncResult<Vec<TunnelConfig>>;

    async fn get_by_id(&self, id: TunnelId) -> SyncResult<Option<TunnelConfig>>;

    async fn find_by_name(&self, name: &str) -> SyncResult<Option<TunnelConfig>>;

    /// Saves a config, assigning an id when absent. Returns the stored row.
    async fn save(&self, config: TunnelConfig) -> SyncResult<TunnelConfig>;

    async fn delete(&self, id: TunnelId) -> SyncResult<()>;
}

/// The external tunnel lifecycle manager.
#[async_trait]
pub trait TunnelRuntime: Send + Sync {
    /// Ids of currently running tunnels.
    async fn active_tunnel_ids(&self) -> HashSet<TunnelId>;

    async fn start(&self, config: &TunnelConfig) -> SyncResult<()>;

    async fn stop(&self, id: TunnelId) -> SyncResult<()>;
}

/// In-memory store and runtime implementations for tests.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryInner {
        subscriptions: HashMap<SubscriptionId, Subscription>,
        mappings: Vec<ManagedTunnel>,
        tunnels: HashMap<TunnelId, TunnelConfig>,
        next_subscription_id: SubscriptionId,
        next_tunnel_id: TunnelId,
    }

    /// In-memory subscription/mapping/tunnel store.
    #[derive(Default)]
    pub struct MemoryStore {
        inner: Mutex<MemoryInner>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Test helper: all stored tunnel names, sorted.
        pub fn tunnel_names(&self) -> Vec<String> {
            let mut names: Vec<String> =
                self.lock().tunnels.values().map(|t| t.name.clone()).collect();
            names.sort();
            names
        }
    }

    #[async_trait]
    impl SubscriptionStore for MemoryStore {
        async fn get(&self, id: SubscriptionId) -> SyncResult<Option<Subscription>> {
            Ok(self.lock().subscriptions.get(&id).cloned())
        }

        async fn get_by_feed_id(&self, feed_id: &str) -> SyncResult<Option<Subscription>> {
            Ok(self
                .lock()
                .subscriptions
                .values()
                .find(|s| s.feed_id == feed_id)
                .cloned())
        }

        async fn list_polling(&self) -> SyncResult<Vec<Subscription>> {
            let mut subs: Vec<Subscription> = self
                .lock()
                .subscriptions
                .values()
                .filter(|s| s.sync_mode == crate::SyncMode::Polling && !s.is_sync_terminal)
                .cloned()
                .collect();
            subs.sort_by_key(|s| s.id);
            Ok(subs)
        }

        async fn list_realtime(&self) -> SyncResult<Vec<Subscription>> {
            let mut subs: Vec<Subscription> = self
                .lock()
                .subscriptions
                .values()
                .filter(|s| s.sync_mode == crate::SyncMode::Realtime && !s.is_sync_terminal)
                .cloned()
                .collect();
            subs.sort_by_key(|s| s.id);
            Ok(subs)
        }

        async fn insert(&self, mut subscription: Subscription) -> SyncResult<Subscription> {
            let mut inner = self.lock();
            inner.next_subscription_id += 1;
            subscription.id = inner.next_subscription_id;
            inner
                .subscriptions
                .insert(subscription.id, subscription.clone());
            Ok(subscription)
        }

        async fn update(&self, subscription: &Subscription) -> SyncResult<()> {
            self.lock()
                .subscriptions
                .insert(subscription.id, subscription.clone());
            Ok(())
        }

        async fn delete(&self, id: SubscriptionId) -> SyncResult<()> {
            let mut inner = self.lock();
            inner.subscriptions.remove(&id);
            inner.mappings.retain(|m| m.subscription_id != id);
            Ok(())
        }
    }

    #[async_trait]
    impl ManagedTunnelStore for MemoryStore {
        async fn list_for_subscription(
            &self,
            subscription_id: SubscriptionId,
        ) -> SyncResult<Vec<ManagedTunnel>> {
            Ok(self
                .lock()
                .mappings
                .iter()
                .filter(|m| m.subscription_id == subscription_id)
                .cloned()
                .collect())
        }

        async fn upsert(&self, mapping: ManagedTunnel) -> SyncResult<()> {
            let mut inner = self.lock();
            inner.mappings.retain(|m| {
                !(m.subscription_id == mapping.subscription_id
                    && m.feed_tunnel_id == mapping.feed_tunnel_id)
            });
            inner.mappings.push(mapping);
            Ok(())
        }

        async fn delete_by_feed_tunnel_ids(
            &self,
            subscription_id: SubscriptionId,
            feed_tunnel_ids: &[String],
        ) -> SyncResult<()> {
            self.lock().mappings.retain(|m| {
                m.subscription_id != subscription_id
                    || !feed_tunnel_ids.contains(&m.feed_tunnel_id)
            });
            Ok(())
        }
    }

    #[async_trait]
    impl TunnelStore for MemoryStore {
        async fn list_all(&self) -> SyncResult<Vec<TunnelConfig>> {
            let mut tunnels: Vec<TunnelConfig> = self.lock().tunnels.values().cloned().collect();
            tunnels.sort_by_key(|t| t.id);
            Ok(tunnels)
        }

        async fn get_by_id(&self, id: TunnelId) -> SyncResult<Option<TunnelConfig>> {
            Ok(self.lock().tunnels.get(&id).cloned())
        }

        async fn find_by_name(&self, name: &str) -> SyncResult<Option<TunnelConfig>> {
            Ok(self
                .lock()
                .tunnels
                .values()
                .find(|t| t.name == name)
                .cloned())
        }

        async fn save(&self, mut config: TunnelConfig) -> SyncResult<TunnelConfig> {
            let mut inner = self.lock();
            let id = match config.id {
                Some(id) => id,
                None => {
                    inner.next_tunnel_id += 1;
                    inner.next_tunnel_id
                }
            };
            config.id = Some(id);
            inner.tunnels.insert(id, config.clone());
            Ok(config)
        }

        async fn delete(&self, id: TunnelId) -> SyncResult<()> {
            self.lock().tunnels.remove(&id);
            Ok(())
        }
    }

    /// In-memory tunnel runtime recording start/stop calls.
    #[derive(Default)]
    pub struct MemoryRuntime {
        active: Mutex<HashSet<TunnelId>>,
        started: Mutex<Vec<TunnelId>>,
        stopped: Mutex<Vec<TunnelId>>,
    }

    impl MemoryRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        /// Marks a tunnel as running without going through `start`.
        pub fn set_active(&self, id: TunnelId) {
            self.active.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
        }

        /// Ids passed to `start`, in call order.
        pub fn started(&self) -> Vec<TunnelId> {
            self.started.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        /// Ids passed to `stop`, in call order.
        pub fn stopped(&self) -> Vec<TunnelId> {
            self.stopped.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait]
    impl TunnelRuntime for MemoryRuntime {
        async fn active_tunnel_ids(&self) -> HashSet<TunnelId> {
            self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        async fn start(&self, config: &TunnelConfig) -> SyncResult<()> {
            if let Some(id) = config.id {
                self.active.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
                self.started.lock().unwrap_or_else(|e| e.into_inner()).push(id);
            }
            Ok(())
        }

        async fn stop(&self, id: TunnelId) -> SyncResult<()> {
            self.active.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            self.stopped.lock().unwrap_or_else(|e| e.into_inner()).push(id);
            Ok(())
        }
    }
}
