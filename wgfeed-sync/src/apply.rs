//! Apply/revision service.
//!
//! Owns the core logic that, given a freshly fetched and validated
//! document:
//! - updates the subscription row (metadata, endpoint ordering/demotion,
//!   latest-known revision)
//! - triggers reconciliation when the revision changed (or the sync was
//!   explicit)
//!
//! Both sync paths (polling and realtime) funnel documents through
//! [`ApplyService::apply_document`]. To keep their read-modify-writes from
//! interleaving, the service serializes apply and error persistence per
//! subscription id and re-reads the latest row under that lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use wgfeed_types::{validation, FeedDocument, SuccessEnvelope, ValidationError};

use crate::endpoints;
use crate::error::SyncResult;
use crate::reconcile::Reconciler;
use crate::store::SubscriptionStore;
use crate::subscription::{Subscription, SubscriptionId};

/// Failure to turn a response body into a validated feed document.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The body is not valid envelope JSON.
    #[error("Invalid wg-feed JSON")]
    InvalidJson,

    /// The envelope or document violated the schema.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// The feed is encrypted and no usable key is stored.
    #[error("Missing encryption key")]
    MissingKey,

    /// The stored key could not decrypt the payload.
    #[error("Decryption failed: {0}")]
    DecryptFailed(String),

    /// Decryption succeeded but the plaintext is not a document.
    #[error("Invalid decrypted feed JSON")]
    InvalidDecryptedJson,
}

impl ParseError {
    /// Whether this failure cannot be fixed by retrying without new key
    /// material. Decrypt-class failures are terminal for the subscription.
    pub fn is_terminal_decrypt(&self) -> bool {
        matches!(
            self,
            ParseError::MissingKey
                | ParseError::DecryptFailed(_)
                | ParseError::InvalidDecryptedJson
        )
    }
}

/// Classifies a persisted error message as a terminal decrypt-class error.
///
/// Used where only the stored message string survives (e.g. re-inspecting
/// `last_error`); [`ParseError::is_terminal_decrypt`] is the typed form.
pub fn is_terminal_decrypt_error_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("missing encryption key")
        || lower.contains("decryption failed")
        || lower.contains("invalid decrypted feed json")
}

/// Parsed and validated wg-feed response data.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub document: FeedDocument,
    pub revision: String,
    pub ttl_seconds: i64,
    pub supports_sse: bool,
    pub warning_message: Option<String>,
}

/// Parses a success-envelope body, decrypting the document when needed.
///
/// `secret_key` is the stored full age secret key string, if any.
pub fn parse_success_body(secret_key: Option<&str>, body: &str) -> Result<ParsedFeed, ParseError> {
    let envelope: SuccessEnvelope =
        serde_json::from_str(body).map_err(|_| ParseError::InvalidJson)?;

    validation::validate_success_envelope(&envelope)?;

    let document = if envelope.encrypted {
        let identity = wgfeed_crypto::identity_from_secret_key(secret_key)
            .ok_or(ParseError::MissingKey)?;

        let armored = envelope.encrypted_data.as_deref().unwrap_or_default();
        let plaintext = wgfeed_crypto::decrypt_armored(armored, &identity)
            .map_err(|e| ParseError::DecryptFailed(e.to_string()))?;

        let document: FeedDocument =
            serde_json::from_str(&plaintext).map_err(|_| ParseError::InvalidDecryptedJson)?;
        validation::validate_document(&document)?;
        document
    } else {
        // Presence is guaranteed by envelope validation.
        envelope
            .data
            .ok_or_else(|| ParseError::Validation(ValidationError::Schema("Missing data".into())))?
    };

    Ok(ParsedFeed {
        revision: envelope.revision,
        ttl_seconds: envelope.ttl_seconds,
        supports_sse: envelope.supports_sse,
        warning_message: document.warning_message.clone(),
        document,
    })
}

/// Result of applying a fetched document to a subscription.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied {
        subscription: Subscription,
        /// Whether reconciliation ran (revision change or explicit).
        reconciled: bool,
        revision_changed: bool,
    },
    Terminal {
        subscription: Subscription,
        message: String,
    },
}

/// Updates subscription state from fetched documents and runs
/// reconciliation when required.
pub struct ApplyService {
    subscriptions: Arc<dyn SubscriptionStore>,
    reconciler: Arc<Reconciler>,
    /// Per-subscription write locks; apply and error persistence for one
    /// subscription never interleave across the polling/realtime paths.
    locks: Mutex<HashMap<SubscriptionId, Arc<Mutex<()>>>>,
}

impl ApplyService {
    pub fn new(subscriptions: Arc<dyn SubscriptionStore>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            subscriptions,
            reconciler,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, id: SubscriptionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_default().clone()
    }

    /// Applies a fetched+validated document onto a subscription.
    ///
    /// `failed_endpoints` are endpoints that triggered fallback conditions
    /// during the current attempt; they are demoted in the persisted order.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_document(
        &self,
        old: &Subscription,
        document: &FeedDocument,
        revision: &str,
        ttl_seconds: i64,
        supports_sse: bool,
        now_ms: i64,
        failed_endpoints: &HashSet<String>,
        explicit: bool,
    ) -> SyncResult<ApplyOutcome> {
        let lock = self.lock_for(old.id).await;
        let _guard = lock.lock().await;

        // Re-read the latest row; the other sync path may have written
        // since the caller took its snapshot.
        let latest = self
            .subscriptions
            .get(old.id)
            .await?
            .unwrap_or_else(|| old.clone());

        // Feed identity is immutable post-creation.
        if !latest.feed_id.is_empty() && latest.feed_id != document.id {
            let message = "Feed ID changed".to_string();
            let updated = Subscription {
                last_checked_at_ms: now_ms,
                last_error: Some(message.clone()),
                is_sync_terminal: true,
                ..latest
            };
            self.subscriptions.update(&updated).await?;
            return Ok(ApplyOutcome::Terminal {
                subscription: updated,
                message,
            });
        }

        let merged =
            endpoints::merge_preserve_local_order(&latest.endpoint_list(), &document.endpoints);
        let final_endpoints = endpoints::demote_failed(&merged, failed_endpoints);

        let revision_changed = latest.last_known_revision.as_deref() != Some(revision);

        info!(
            "apply: subscription {} revision_changed={revision_changed} explicit={explicit} \
             ttl={ttl_seconds}s failed_endpoints={}",
            latest.id,
            failed_endpoints.len()
        );

        let mut updated = Subscription {
            feed_id: document.id.clone(),
            endpoints_json: endpoints::encode(&final_endpoints),
            last_checked_at_ms: now_ms,
            last_known_revision: Some(revision.to_string()),
            ttl_seconds,
            supports_sse,
            display_title: document.display_info.title.clone(),
            display_description: document.display_info.description.clone(),
            display_icon_url: document.display_info.icon_url.clone(),
            warning_message: document.warning_message.clone(),
            last_error: None,
            is_sync_terminal: false,
            ..latest
        };

        self.subscriptions.update(&updated).await?;

        let should_reconcile = explicit || revision_changed;
        if should_reconcile {
            self.reconciler.reconcile(&updated, document).await?;

            updated.last_synced_at_ms = now_ms;
            self.subscriptions.update(&updated).await?;
        }

        Ok(ApplyOutcome::Applied {
            subscription: updated,
            reconciled: should_reconcile,
            revision_changed,
        })
    }

    /// Stamps an error onto a subscription without touching revision or
    /// endpoints. The terminal flag is sticky.
    pub fn with_sync_error(
        subscription: &Subscription,
        now_ms: i64,
        message: &str,
        terminal: bool,
    ) -> Subscription {
        Subscription {
            last_checked_at_ms: now_ms,
            last_error: Some(message.to_string()),
            is_sync_terminal: terminal || subscription.is_sync_terminal,
            ..subscription.clone()
        }
    }

    /// Persists an error stamp onto the latest subscription row.
    pub async fn persist_sync_error(
        &self,
        subscription: &Subscription,
        now_ms: i64,
        message: &str,
        terminal: bool,
    ) -> SyncResult<Subscription> {
        let lock = self.lock_for(subscription.id).await;
        let _guard = lock.lock().await;

        let latest = self
            .subscriptions
            .get(subscription.id)
            .await?
            .unwrap_or_else(|| subscription.clone());
        let updated = Self::with_sync_error(&latest, now_ms, message, terminal);
        self.subscriptions.update(&updated).await?;
        Ok(updated)
    }
}
