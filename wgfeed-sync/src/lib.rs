//! Synchronization and reconciliation engine for wg-feed subscriptions.
//!
//! A subscription follows one feed: a server-published, versioned document
//! declaring a set of tunnel configurations. This crate keeps the local
//! tunnel set converged onto whatever the feed currently declares.
//!
//! # Components
//!
//! - **Endpoints**: pure set algebra over a subscription's candidate URLs
//!   (merge server lists, demote failures, strip fragments)
//! - **Store**: traits for the externally-owned subscription, mapping and
//!   tunnel stores plus the tunnel runtime
//! - **Apply**: given a fetched+validated document, updates subscription
//!   metadata and decides whether reconciliation must run
//! - **Poller**: one conditional-GET sync attempt with endpoint fallback
//! - **Realtime**: long-lived SSE stream per subscription with rotation
//!   on connect failure
//! - **Reconcile**: diffs the feed's tunnel list against local managed
//!   tunnels and drives create/update/delete/enforce
//!
//! # Sync flow
//!
//! An external scheduler calls [`PollingSyncer::sync_once`] per polling
//! subscription when its TTL is due, or keeps [`RealtimeSyncer`] running
//! for realtime ones. Both funnel fetched documents through
//! [`ApplyService::apply_document`], which reconciles on revision change
//! (or explicit request). Terminal conditions (feed identity change,
//! decrypt-class failures, non-retriable protocol errors) stop all sync
//! for a subscription until user intervention.

pub mod apply;
pub mod endpoints;
mod error;
pub mod poller;
pub mod realtime;
pub mod reconcile;
pub mod sse;
pub mod store;
mod subscription;

pub use apply::{ApplyOutcome, ApplyService, ParseError, ParsedFeed};
pub use error::{SyncError, SyncResult};
pub use poller::{PollingSyncer, SyncOutcome};
pub use realtime::RealtimeSyncer;
pub use reconcile::{ReconcileStats, Reconciler};
pub use sse::{SseEvent, SseParser, SseStatus};
pub use store::{ManagedTunnelStore, SubscriptionStore, TunnelRuntime, TunnelStore};
pub use subscription::{
    ManagedTunnel, Subscription, SubscriptionId, SyncMode, TunnelConfig, TunnelId,
};
