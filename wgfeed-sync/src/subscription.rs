//! Subscription and managed-tunnel models.

use serde::{Deserialize, Serialize};

use crate::endpoints;

/// Store-assigned subscription id.
pub type SubscriptionId = i64;

/// Store-assigned local tunnel config id.
pub type TunnelId = i64;

/// How a subscription is kept in sync with its feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Only explicit user-triggered syncs.
    Manual,
    /// Periodic conditional GETs driven by the external scheduler.
    Polling,
    /// Long-lived SSE stream.
    Realtime,
}

/// Client-side record of following one feed.
///
/// Mutated on every sync attempt (success, no-change, or error); the
/// stores persist it between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,

    /// Feed id from the document; blank until the first successful apply,
    /// immutable afterwards (a change is terminal).
    pub feed_id: String,

    /// JSON-encoded ordered endpoint list (see [`endpoints::encode`]).
    pub endpoints_json: String,

    /// Full age secret key string derived from the setup URL fragment.
    /// The setup URL itself is never persisted.
    pub age_secret_key: Option<String>,

    /// Ignore enabled/disabled state declared by the server feed.
    pub ignore_server_state: bool,

    pub sync_mode: SyncMode,

    /// Last time a sync attempt ran (including 304s and errors).
    pub last_checked_at_ms: i64,

    /// Last time server state was applied into local tunnels
    /// (revision change or explicit sync).
    pub last_synced_at_ms: i64,

    /// Latest revision fetched, validated and attempted to apply.
    /// Not a guarantee that reconciliation succeeded; it is what
    /// conditional requests send as If-None-Match.
    pub last_known_revision: Option<String>,

    /// Server-declared minimum re-check interval.
    pub ttl_seconds: i64,

    /// Whether the server advertised SSE support.
    pub supports_sse: bool,

    pub display_title: String,
    pub display_description: Option<String>,
    pub display_icon_url: Option<String>,

    pub warning_message: Option<String>,
    pub last_error: Option<String>,

    /// Once set, no further sync attempts run until user intervention.
    pub is_sync_terminal: bool,
}

impl Subscription {
    /// Decoded, ordered endpoint list.
    pub fn endpoint_list(&self) -> Vec<String> {
        endpoints::decode(&self.endpoints_json)
    }

    /// When the next poll attempt is due, in epoch millis.
    ///
    /// Never-checked subscriptions are due immediately.
    pub fn next_poll_due_at_ms(&self, now_ms: i64) -> i64 {
        if self.last_checked_at_ms <= 0 {
            now_ms
        } else {
            self.last_checked_at_ms + self.ttl_seconds.max(0) * 1000
        }
    }
}

/// Associates one feed-declared tunnel with one local tunnel config.
///
/// At most one mapping per (subscription, feed tunnel id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedTunnel {
    pub subscription_id: SubscriptionId,
    /// Feed-local tunnel id, unique within the subscription.
    pub feed_tunnel_id: String,
    pub tunnel_config_id: TunnelId,
    /// Copied from the feed tunnel; forced tunnels' runtime state is
    /// enforced rather than treated as a default.
    pub is_forced: bool,
}

/// A locally stored tunnel configuration (externally owned).
///
/// Configs referenced by a [`ManagedTunnel`] mapping are owned by that
/// subscription for editing purposes; their lifecycle stays with the
/// external tunnel runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// `None` until the store assigns an id on save.
    pub id: Option<TunnelId>,

    /// Unique, case-sensitive name.
    pub name: String,

    /// Tunnel configuration payload.
    pub wg_quick: String,

    /// Manual override of the payload; cleared whenever the feed payload
    /// replaces the config.
    pub am_quick: String,

    /// Configured-active flag (distinct from actually running).
    pub is_active: bool,

    pub display_title: Option<String>,
    pub display_description: Option<String>,
    pub display_icon_url: Option<String>,

    /// Owning subscription, if feed-managed.
    pub feed_subscription_id: Option<SubscriptionId>,

    /// Feed-managed configs are read-only from the user's perspective.
    pub is_readonly: bool,

    /// Set when the payload changed while the tunnel was running.
    pub is_restart_required: bool,
}
