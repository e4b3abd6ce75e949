//! Reconciliation engine.
//!
//! Diffs a validated feed document's tunnel list against the local
//! managed-tunnel mappings and drives create/update/delete/enforce on the
//! external tunnel store and runtime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};
use wgfeed_types::{validation, FeedDocument, FeedTunnel};

use crate::error::SyncResult;
use crate::store::{ManagedTunnelStore, TunnelRuntime, TunnelStore};
use crate::subscription::{ManagedTunnel, Subscription, TunnelConfig, TunnelId};

/// Counts of tunnel operations performed by one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Local id of the enforced target tunnel, when enforcement picked one.
    pub enforced_target: Option<TunnelId>,
}

/// Applies feed documents onto local tunnel configs.
pub struct Reconciler {
    tunnels: Arc<dyn TunnelStore>,
    mappings: Arc<dyn ManagedTunnelStore>,
    runtime: Arc<dyn TunnelRuntime>,
}

impl Reconciler {
    pub fn new(
        tunnels: Arc<dyn TunnelStore>,
        mappings: Arc<dyn ManagedTunnelStore>,
        runtime: Arc<dyn TunnelRuntime>,
    ) -> Self {
        Self {
            tunnels,
            mappings,
            runtime,
        }
    }

    /// Reconciles the document's tunnel list into local state.
    ///
    /// Each create/update is persisted independently; deletions of tunnels
    /// that are configured active or currently running are deferred (their
    /// mapping stays) so a later pass can complete them.
    pub async fn reconcile(
        &self,
        subscription: &Subscription,
        doc: &FeedDocument,
    ) -> SyncResult<ReconcileStats> {
        validation::validate_document(doc)?;

        let existing_mappings = self.mappings.list_for_subscription(subscription.id).await?;
        let mapping_by_feed_id: HashMap<&str, &ManagedTunnel> = existing_mappings
            .iter()
            .map(|m| (m.feed_tunnel_id.as_str(), m))
            .collect();

        let mut existing_names: HashSet<String> = self
            .tunnels
            .list_all()
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect();

        let mut stats = ReconcileStats::default();

        let current_feed_ids: HashSet<&str> = doc.tunnels.iter().map(|t| t.id.as_str()).collect();

        // Create/update in feed order.
        for feed_tunnel in &doc.tunnels {
            match mapping_by_feed_id.get(feed_tunnel.id.as_str()) {
                None => {
                    self.create_tunnel(subscription, feed_tunnel, &mut existing_names)
                        .await?;
                    stats.created += 1;
                }
                Some(mapping) => {
                    if self
                        .update_tunnel(subscription, feed_tunnel, mapping, &mut existing_names)
                        .await?
                    {
                        stats.updated += 1;
                    }
                }
            }
        }

        // Delete mappings whose feed tunnel disappeared, unless the local
        // tunnel is configured active or currently running.
        let active_ids = self.runtime.active_tunnel_ids().await;
        for mapping in &existing_mappings {
            if current_feed_ids.contains(mapping.feed_tunnel_id.as_str()) {
                continue;
            }

            let local = self.tunnels.get_by_id(mapping.tunnel_config_id).await?;
            let enabled_or_running = local.as_ref().is_some_and(|t| t.is_active)
                || active_ids.contains(&mapping.tunnel_config_id);
            if enabled_or_running {
                debug!(
                    "reconcile: defer delete of tunnel {} (active or running)",
                    mapping.tunnel_config_id
                );
                continue;
            }

            if local.is_some() {
                self.tunnels.delete(mapping.tunnel_config_id).await?;
            }
            self.mappings
                .delete_by_feed_tunnel_ids(
                    subscription.id,
                    std::slice::from_ref(&mapping.feed_tunnel_id),
                )
                .await?;
            stats.deleted += 1;
        }

        stats.enforced_target = if !subscription.ignore_server_state {
            self.enforce_desired_state(subscription, doc).await?
        } else {
            None
        };

        info!(
            "reconcile: subscription {} created={} updated={} deleted={}",
            subscription.id, stats.created, stats.updated, stats.deleted
        );

        Ok(stats)
    }

    async fn create_tunnel(
        &self,
        subscription: &Subscription,
        feed_tunnel: &FeedTunnel,
        existing_names: &mut HashSet<String>,
    ) -> SyncResult<()> {
        let name = unique_name(&feed_tunnel.name, existing_names);

        // When not forced, `enabled` is only a default for newly created
        // tunnels. Forced tunnels' runtime state is decided by enforcement.
        let is_active =
            !subscription.ignore_server_state && !feed_tunnel.forced && feed_tunnel.enabled;

        let config = TunnelConfig {
            id: None,
            name: name.clone(),
            wg_quick: feed_tunnel.wg_quick_config.clone(),
            am_quick: String::new(),
            is_active,
            display_title: non_blank(&feed_tunnel.display_info.title),
            display_description: feed_tunnel
                .display_info
                .description
                .as_deref()
                .and_then(non_blank),
            display_icon_url: feed_tunnel.display_info.icon_url.clone(),
            feed_subscription_id: Some(subscription.id),
            is_readonly: true,
            is_restart_required: false,
        };

        let saved = self.tunnels.save(config).await?;
        existing_names.insert(name);

        let Some(tunnel_id) = saved.id else {
            warn!("reconcile: store did not assign an id for {}", saved.name);
            return Ok(());
        };

        self.mappings
            .upsert(ManagedTunnel {
                subscription_id: subscription.id,
                feed_tunnel_id: feed_tunnel.id.clone(),
                tunnel_config_id: tunnel_id,
                is_forced: feed_tunnel.forced,
            })
            .await?;

        Ok(())
    }

    async fn update_tunnel(
        &self,
        subscription: &Subscription,
        feed_tunnel: &FeedTunnel,
        mapping: &ManagedTunnel,
        existing_names: &mut HashSet<String>,
    ) -> SyncResult<bool> {
        let Some(local) = self.tunnels.get_by_id(mapping.tunnel_config_id).await? else {
            // Drift: the mapped config vanished. Recreate and remap.
            self.create_tunnel(subscription, feed_tunnel, existing_names)
                .await?;
            return Ok(true);
        };

        let mut updated = local.clone();
        let mut did_update = false;
        let mut payload_changed = false;

        if local.wg_quick != feed_tunnel.wg_quick_config || !local.am_quick.is_empty() {
            updated.wg_quick = feed_tunnel.wg_quick_config.clone();
            updated.am_quick = String::new();
            did_update = true;
            payload_changed = true;
        }

        // Managed tunnels stay read-only and linked to their subscription.
        let desired_title = non_blank(&feed_tunnel.display_info.title);
        let desired_description = feed_tunnel
            .display_info
            .description
            .as_deref()
            .and_then(non_blank);
        let desired_icon = feed_tunnel.display_info.icon_url.clone();

        if updated.display_title != desired_title
            || updated.display_description != desired_description
            || updated.display_icon_url != desired_icon
            || updated.feed_subscription_id != Some(subscription.id)
            || !updated.is_readonly
        {
            updated.display_title = desired_title;
            updated.display_description = desired_description;
            updated.display_icon_url = desired_icon;
            updated.feed_subscription_id = Some(subscription.id);
            updated.is_readonly = true;
            did_update = true;
        }

        let running = self
            .runtime
            .active_tunnel_ids()
            .await
            .contains(&mapping.tunnel_config_id);
        let restart_required = if payload_changed && running {
            true
        } else {
            updated.is_restart_required
        };
        if updated.is_restart_required != restart_required {
            updated.is_restart_required = restart_required;
            did_update = true;
        }

        if did_update {
            self.tunnels.save(updated).await?;
        }

        self.mappings
            .upsert(ManagedTunnel {
                is_forced: feed_tunnel.forced,
                ..mapping.clone()
            })
            .await?;

        Ok(did_update)
    }

    /// Enforces forced tunnels' declared state.
    ///
    /// forced+disabled tunnels must be down. Among forced+enabled tunnels
    /// the first in document order is the single enforced target: other
    /// running forced+enabled tunnels are stopped, the target is started if
    /// not already running. Non-forced tunnels are never touched.
    async fn enforce_desired_state(
        &self,
        subscription: &Subscription,
        doc: &FeedDocument,
    ) -> SyncResult<Option<TunnelId>> {
        let mappings: HashMap<String, ManagedTunnel> = self
            .mappings
            .list_for_subscription(subscription.id)
            .await?
            .into_iter()
            .map(|m| (m.feed_tunnel_id.clone(), m))
            .collect();

        let active_ids = self.runtime.active_tunnel_ids().await;

        for tunnel in &doc.tunnels {
            if !tunnel.forced || tunnel.enabled {
                continue;
            }
            let Some(local_id) = mappings.get(&tunnel.id).map(|m| m.tunnel_config_id) else {
                continue;
            };
            if active_ids.contains(&local_id) {
                info!("reconcile: stopping forced-disabled tunnel {local_id}");
                self.runtime.stop(local_id).await?;
            }
        }

        let target_id = doc
            .tunnels
            .iter()
            .find(|t| t.forced && t.enabled)
            .and_then(|t| mappings.get(&t.id).map(|m| m.tunnel_config_id));

        let Some(target_id) = target_id else {
            return Ok(None);
        };

        let forced_enabled_ids: HashSet<TunnelId> = doc
            .tunnels
            .iter()
            .filter(|t| t.forced && t.enabled)
            .filter_map(|t| mappings.get(&t.id).map(|m| m.tunnel_config_id))
            .collect();

        for id in &active_ids {
            if *id != target_id && forced_enabled_ids.contains(id) {
                info!("reconcile: stopping non-target forced tunnel {id}");
                self.runtime.stop(*id).await?;
            }
        }

        if !active_ids.contains(&target_id) {
            if let Some(config) = self.tunnels.get_by_id(target_id).await? {
                info!("reconcile: starting enforced target tunnel {target_id}");
                self.runtime.start(&config).await?;
            }
        }

        Ok(Some(target_id))
    }
}

fn non_blank(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Deduplicates `base` against `used` by appending `-1`, `-2`, ...
fn unique_name(base: &str, used: &HashSet<String>) -> String {
    if !used.contains(base) {
        return base.to_string();
    }
    let mut counter = 1u32;
    loop {
        let candidate = format!("{base}-{counter}");
        if !used.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
