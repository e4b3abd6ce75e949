//! Polling sync client.
//!
//! One call to [`PollingSyncer::sync_once`] is one sync attempt for one
//! subscription: endpoints are tried strictly in persisted order with a
//! conditional GET, the first success wins, and failure bookkeeping feeds
//! endpoint demotion and the draft-00 terminal rule (an attempt where the
//! only failures were non-retriable protocol errors is terminal).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::header;
use reqwest::StatusCode;
use tracing::{info, warn};
use wgfeed_types::{validation, ErrorEnvelope};

use crate::apply::{parse_success_body, ApplyOutcome, ApplyService, ParsedFeed};
use crate::endpoints;
use crate::error::{SyncError, SyncResult};
use crate::store::SubscriptionStore;
use crate::subscription::{Subscription, SyncMode};

/// Result of one polling sync attempt.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// A document was fetched and applied, or the server answered 304.
    Success {
        subscription: Subscription,
        /// Whether the revision changed (false for 304).
        changed: bool,
    },
    /// Manual mode and the call was not explicit; nothing was done.
    Disabled { subscription: Subscription },
    /// The attempt failed; the error was persisted, non-terminal.
    Error {
        subscription: Subscription,
        message: String,
    },
    /// The subscription is (or became) terminal.
    Terminal {
        subscription: Subscription,
        message: String,
    },
}

/// Performs one-shot polling sync attempts.
pub struct PollingSyncer {
    client: reqwest::Client,
    subscriptions: Arc<dyn SubscriptionStore>,
    apply: Arc<ApplyService>,
    /// Allow plain-HTTP endpoints (local development only).
    allow_insecure_endpoints: bool,
}

impl PollingSyncer {
    pub fn new(
        client: reqwest::Client,
        subscriptions: Arc<dyn SubscriptionStore>,
        apply: Arc<ApplyService>,
    ) -> Self {
        Self {
            client,
            subscriptions,
            apply,
            allow_insecure_endpoints: false,
        }
    }

    /// Permits `http://` endpoints. For local development and tests.
    pub fn with_insecure_endpoints(mut self) -> Self {
        self.allow_insecure_endpoints = true;
        self
    }

    /// Performs one sync attempt.
    ///
    /// Reconciliation triggers only when a document is fetched (HTTP 200)
    /// and its revision differs from the last known one, or when
    /// `explicit` is true. Explicit syncs bypass conditional caching.
    pub async fn sync_once(&self, subscription: &Subscription, explicit: bool) -> SyncOutcome {
        if !explicit && subscription.sync_mode == SyncMode::Manual {
            return SyncOutcome::Disabled {
                subscription: subscription.clone(),
            };
        }
        if subscription.is_sync_terminal {
            return SyncOutcome::Terminal {
                subscription: subscription.clone(),
                message: subscription.last_error.clone().unwrap_or_default(),
            };
        }

        let now = now_ms();

        match self.attempt(subscription, explicit, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = e.to_string();
                warn!(
                    "polling: attempt failed for subscription {}: {message}",
                    subscription.id
                );
                let updated = self
                    .apply
                    .persist_sync_error(subscription, now, &message, false)
                    .await
                    .unwrap_or_else(|persist_err| {
                        warn!("polling: failed to persist sync error: {persist_err}");
                        ApplyService::with_sync_error(subscription, now, &message, false)
                    });
                SyncOutcome::Error {
                    subscription: updated,
                    message,
                }
            }
        }
    }

    async fn attempt(
        &self,
        subscription: &Subscription,
        explicit: bool,
        now: i64,
    ) -> SyncResult<SyncOutcome> {
        let endpoints = subscription.endpoint_list();
        if endpoints.is_empty() {
            return self.persist_error(subscription, now, "No endpoints").await;
        }

        info!(
            "polling: sync subscription {} explicit={explicit} last_known_revision={:?} \
             endpoints={}",
            subscription.id,
            subscription.last_known_revision,
            endpoints.len()
        );

        // Endpoints that triggered fallback conditions in this attempt.
        let mut failed_this_attempt: HashSet<String> = HashSet::new();

        let mut last_error: Option<String> = None;
        let mut saw_retriable_false = false;
        let mut saw_retriable_true_or_unknown = false;

        for endpoint in &endpoints {
            self.validate_endpoint(endpoint)?;

            let origin = endpoints::endpoint_origin(endpoint);
            let conditional = !explicit && subscription.last_known_revision.is_some();
            info!(
                "polling: GET subscription {} endpoint={origin} conditional={conditional}",
                subscription.id
            );

            let revision = if explicit {
                None
            } else {
                subscription.last_known_revision.as_deref()
            };

            let response = match self.http_get(endpoint, revision).await {
                Ok(response) => response,
                Err(e) => {
                    last_error = Some(e.to_string());
                    failed_this_attempt.insert(endpoint.clone());
                    saw_retriable_true_or_unknown = true;
                    continue;
                }
            };

            let status = response.status();
            info!(
                "polling: response subscription {} status={status} endpoint={origin}",
                subscription.id
            );

            if status == StatusCode::OK {
                let body = response.text().await?;

                let parsed = match parse_success_body(subscription.age_secret_key.as_deref(), &body)
                {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        let message = e.to_string();
                        last_error = Some(message.clone());

                        if e.is_terminal_decrypt() {
                            let updated = self
                                .apply
                                .persist_sync_error(subscription, now, &message, true)
                                .await?;
                            return Ok(SyncOutcome::Terminal {
                                subscription: updated,
                                message,
                            });
                        }

                        failed_this_attempt.insert(endpoint.clone());
                        saw_retriable_true_or_unknown = true;
                        continue;
                    }
                };

                let ParsedFeed {
                    document,
                    revision,
                    ttl_seconds,
                    supports_sse,
                    ..
                } = parsed;

                let applied = self
                    .apply
                    .apply_document(
                        subscription,
                        &document,
                        &revision,
                        ttl_seconds,
                        supports_sse,
                        now,
                        &failed_this_attempt,
                        explicit,
                    )
                    .await?;

                return Ok(match applied {
                    ApplyOutcome::Terminal {
                        subscription,
                        message,
                    } => SyncOutcome::Terminal {
                        subscription,
                        message,
                    },
                    ApplyOutcome::Applied {
                        subscription,
                        revision_changed,
                        ..
                    } => SyncOutcome::Success {
                        subscription,
                        changed: revision_changed,
                    },
                });
            }

            if status == StatusCode::NOT_MODIFIED {
                // Successful sync with no updated document. Still demote
                // endpoints that failed earlier in this same attempt.
                let final_endpoints = endpoints::demote_failed(&endpoints, &failed_this_attempt);
                let updated = Subscription {
                    endpoints_json: endpoints::encode(&final_endpoints),
                    last_checked_at_ms: now,
                    last_error: None,
                    ..subscription.clone()
                };
                self.subscriptions.update(&updated).await?;
                info!("polling: 304 subscription {} unchanged", subscription.id);
                return Ok(SyncOutcome::Success {
                    subscription: updated,
                    changed: false,
                });
            }

            // Any other status: look for a structured error envelope.
            match parse_error_body(response).await {
                Some(envelope) => {
                    last_error = Some(envelope.message.clone());
                    if envelope.retriable {
                        failed_this_attempt.insert(endpoint.clone());
                        saw_retriable_true_or_unknown = true;
                    } else {
                        // Not a fallback condition; still try the rest.
                        saw_retriable_false = true;
                    }
                }
                None => {
                    last_error = Some(format!("HTTP {}", status.as_u16()));
                    failed_this_attempt.insert(endpoint.clone());
                    saw_retriable_true_or_unknown = true;
                }
            }
        }

        // Terminal only when non-retriable protocol errors were the sole
        // failure kind across the whole attempt.
        if saw_retriable_false && !saw_retriable_true_or_unknown {
            let message = last_error.unwrap_or_else(|| "Terminal error".to_string());
            let updated = self
                .apply
                .persist_sync_error(subscription, now, &message, true)
                .await?;
            return Ok(SyncOutcome::Terminal {
                subscription: updated,
                message,
            });
        }

        let message = last_error.unwrap_or_else(|| "Sync failed".to_string());
        self.persist_error(subscription, now, &message).await
    }

    /// Fetches and validates a candidate setup URL without touching any
    /// persisted state. Used to vet a subscription before creating it.
    pub async fn preview(&self, url: &str) -> SyncResult<ParsedFeed> {
        let normalized = url.trim();
        self.validate_endpoint(normalized)?;

        let response = self.http_get(normalized, None).await?;
        let status = response.status();
        if status != StatusCode::OK {
            let message = match parse_error_body(response).await {
                Some(envelope) => envelope.message,
                None => format!("HTTP {}", status.as_u16()),
            };
            return Err(SyncError::Protocol(message));
        }

        let body = response.text().await?;
        let secret_key = wgfeed_crypto::secret_key_from_setup_url(normalized);
        parse_success_body(secret_key.as_deref(), &body)
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }

    fn validate_endpoint(&self, url: &str) -> SyncResult<()> {
        if self.allow_insecure_endpoints {
            validation::require_http_or_https_url(url)?;
        } else {
            validation::require_https_url(url)?;
        }
        Ok(())
    }

    async fn http_get(
        &self,
        url: &str,
        revision: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let request_url = endpoints::strip_fragment(url);
        let mut request = self
            .client
            .get(request_url)
            .header(header::ACCEPT, "application/json")
            .header(header::CACHE_CONTROL, "no-cache");
        if let Some(revision) = revision {
            request = request.header(header::IF_NONE_MATCH, if_none_match_value(revision));
        }
        request.send().await
    }

    async fn persist_error(
        &self,
        subscription: &Subscription,
        now: i64,
        message: &str,
    ) -> SyncResult<SyncOutcome> {
        let updated = self
            .apply
            .persist_sync_error(subscription, now, message, false)
            .await?;
        Ok(SyncOutcome::Error {
            subscription: updated,
            message: message.to_string(),
        })
    }
}

/// Strong-ETag form required by draft-00: `"<revision>"`, preserving
/// quotes the caller already stored.
fn if_none_match_value(revision: &str) -> String {
    let trimmed = revision.trim();
    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        trimmed.to_string()
    } else {
        format!("\"{trimmed}\"")
    }
}

/// Parses a response body as a valid wg-feed error envelope, if it is one.
pub(crate) async fn parse_error_body(response: reqwest::Response) -> Option<ErrorEnvelope> {
    let body = response.text().await.ok()?;
    parse_error_text(&body)
}

pub(crate) fn parse_error_text(body: &str) -> Option<ErrorEnvelope> {
    let envelope: ErrorEnvelope = serde_json::from_str(body).ok()?;
    validation::validate_error_envelope(&envelope).ok()?;
    Some(envelope)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
