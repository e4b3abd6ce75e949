//! Realtime sync client.
//!
//! Maintains one long-lived SSE connection per realtime subscription.
//! Policy distinction from polling: endpoint rotation happens only when a
//! connection *fails to establish* — a previously successful endpoint is
//! retried before rotating, even after the stream drops. The
//! failed-endpoint set accumulates for the task's lifetime (not per
//! connection) and is demoted in the persisted endpoint order.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use reqwest::{header, StatusCode};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wgfeed_types::validation;

use crate::apply::{parse_success_body, ApplyOutcome, ApplyService};
use crate::endpoints;
use crate::poller::{now_ms, parse_error_text};
use crate::sse::{SseParser, SseStatus};
use crate::store::SubscriptionStore;
use crate::subscription::{Subscription, SubscriptionId, SyncMode};

/// Delay between connection-loop iterations.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Delay before re-checking a subscription with no endpoints.
const EMPTY_ENDPOINTS_DELAY: Duration = Duration::from_secs(5);

/// How one connection attempt (and its stream, if established) ended.
enum StreamEnd {
    /// The connection was established; the stream later ended or failed.
    /// Retry the same endpoint.
    Established,
    /// The connection never established. Rotate to the next endpoint.
    ConnectFailed(String),
    /// Non-retriable protocol error at connect time. Terminal.
    FatalProtocol(String),
    /// A feed event produced a terminal condition; the task must stop.
    Stop,
}

/// Maintains realtime SSE streams for subscriptions.
pub struct RealtimeSyncer {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    subscriptions: Arc<dyn SubscriptionStore>,
    apply: Arc<ApplyService>,
    allow_insecure_endpoints: bool,
    tasks: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    statuses: RwLock<HashMap<SubscriptionId, SseStatus>>,
}

impl RealtimeSyncer {
    pub fn new(
        client: reqwest::Client,
        subscriptions: Arc<dyn SubscriptionStore>,
        apply: Arc<ApplyService>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                subscriptions,
                apply,
                allow_insecure_endpoints: false,
                tasks: Mutex::new(HashMap::new()),
                statuses: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Permits `http://` endpoints. For local development and tests.
    /// Must be called before any task is started.
    pub fn with_insecure_endpoints(mut self) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.allow_insecure_endpoints = true;
        }
        self
    }

    /// Starts (or restarts) the stream task for a subscription.
    ///
    /// No-op when the subscription is not realtime-eligible.
    pub fn start(&self, subscription: &Subscription) {
        if subscription.sync_mode != SyncMode::Realtime || subscription.is_sync_terminal {
            return;
        }

        info!(
            "realtime: start subscription {} endpoints={}",
            subscription.id,
            subscription.endpoint_list().len()
        );

        self.stop(subscription.id);

        let inner = self.inner.clone();
        let subscription_id = subscription.id;
        let handle = tokio::spawn(async move {
            run_loop(inner, subscription_id).await;
        });

        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subscription_id, handle);
    }

    /// Stops the stream task for one subscription. Idempotent.
    pub fn stop(&self, subscription_id: SubscriptionId) {
        let handle = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&subscription_id);
        if let Some(handle) = handle {
            info!("realtime: stop subscription {subscription_id}");
            handle.abort();
        }
        self.inner.clear_status(subscription_id);
    }

    /// Stops all stream tasks. Idempotent.
    pub fn stop_all(&self) {
        let handles: Vec<(SubscriptionId, JoinHandle<()>)> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (id, handle) in handles {
            info!("realtime: stop subscription {id}");
            handle.abort();
            self.inner.clear_status(id);
        }
    }

    /// Current connection state for a subscription.
    pub fn status(&self, subscription_id: SubscriptionId) -> SseStatus {
        self.inner
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&subscription_id)
            .copied()
            .unwrap_or(SseStatus::Disconnected)
    }

    /// Connection state of every tracked subscription.
    pub fn statuses(&self) -> HashMap<SubscriptionId, SseStatus> {
        self.inner
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

async fn run_loop(inner: Arc<Inner>, subscription_id: SubscriptionId) {
    let mut endpoint_index: usize = 0;
    // Endpoints that failed to establish during this task's lifetime.
    let mut failed_endpoints: HashSet<String> = HashSet::new();

    loop {
        let latest = match inner.subscriptions.get(subscription_id).await {
            Ok(Some(subscription)) => subscription,
            Ok(None) => break,
            Err(e) => {
                warn!("realtime: store read failed for subscription {subscription_id}: {e}");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        if latest.sync_mode != SyncMode::Realtime || latest.is_sync_terminal {
            info!(
                "realtime: stop condition met for subscription {subscription_id} terminal={}",
                latest.is_sync_terminal
            );
            break;
        }

        let endpoints = latest.endpoint_list();
        if endpoints.is_empty() {
            inner.set_status(subscription_id, SseStatus::Disconnected);
            tokio::time::sleep(EMPTY_ENDPOINTS_DELAY).await;
            continue;
        }

        if endpoint_index >= endpoints.len() {
            endpoint_index = 0;
        }
        let endpoint = endpoints[endpoint_index].clone();
        let origin = endpoints::endpoint_origin(&endpoint);

        inner.set_status(subscription_id, SseStatus::Connecting);
        info!("realtime: connect subscription {subscription_id} endpoint={origin}");

        match inner
            .connect_and_stream(&latest, &endpoint, &failed_endpoints)
            .await
        {
            StreamEnd::Established => {
                // The stream dropped after establishing; retry the same
                // endpoint rather than rotating.
                debug!("realtime: disconnect subscription {subscription_id} endpoint={origin}");
                inner.set_status(subscription_id, SseStatus::Disconnected);
            }
            StreamEnd::ConnectFailed(message) => {
                warn!(
                    "realtime: connect failed subscription {subscription_id} \
                     endpoint={origin}: {message}"
                );
                inner.set_status(subscription_id, SseStatus::Error);
                if let Err(e) = inner
                    .apply
                    .persist_sync_error(&latest, now_ms(), &message, false)
                    .await
                {
                    warn!("realtime: failed to persist sync error: {e}");
                }
                failed_endpoints.insert(endpoint.clone());
                inner
                    .persist_demotion(subscription_id, &failed_endpoints)
                    .await;
                endpoint_index = (endpoint_index + 1) % endpoints.len();
                inner.set_status(subscription_id, SseStatus::Disconnected);
            }
            StreamEnd::FatalProtocol(message) => {
                warn!(
                    "realtime: non-retriable error for subscription {subscription_id}: {message}"
                );
                inner.set_status(subscription_id, SseStatus::Error);
                if let Err(e) = inner
                    .apply
                    .persist_sync_error(&latest, now_ms(), &message, true)
                    .await
                {
                    warn!("realtime: failed to persist terminal error: {e}");
                }
                inner.set_status(subscription_id, SseStatus::Disconnected);
                break;
            }
            StreamEnd::Stop => break,
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }

    inner.clear_status(subscription_id);
}

impl Inner {
    fn set_status(&self, subscription_id: SubscriptionId, status: SseStatus) {
        self.statuses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subscription_id, status);
    }

    fn clear_status(&self, subscription_id: SubscriptionId) {
        self.statuses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&subscription_id);
    }

    async fn connect_and_stream(
        &self,
        old: &Subscription,
        endpoint: &str,
        failed_endpoints: &HashSet<String>,
    ) -> StreamEnd {
        let url_check = if self.allow_insecure_endpoints {
            validation::require_http_or_https_url(endpoint)
        } else {
            validation::require_https_url(endpoint)
        };
        if let Err(e) = url_check {
            return StreamEnd::ConnectFailed(e.to_string());
        }

        let stream_url = endpoints::strip_fragment(endpoint);
        let response = match self
            .client
            .get(stream_url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return StreamEnd::ConnectFailed(e.to_string()),
        };

        let status = response.status();
        if status != StatusCode::OK {
            // A connect-time error envelope with retriable=false is
            // terminal, unlike a generic connection failure.
            let body = response.text().await.unwrap_or_default();
            if let Some(envelope) = parse_error_text(&body) {
                if !envelope.retriable {
                    return StreamEnd::FatalProtocol(envelope.message);
                }
                return StreamEnd::ConnectFailed(envelope.message);
            }
            return StreamEnd::ConnectFailed(format!("HTTP {}", status.as_u16()));
        }

        self.set_status(old.id, SseStatus::Connected);
        info!("realtime: connected subscription {}", old.id);

        // Successful establishment clears any previously stored error.
        self.clear_last_error(old.id).await;

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut events = Vec::new();

        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    parser.push(&chunk, &mut events);
                    for event in events.drain(..) {
                        // `ping` keepalives and unknown event names are
                        // ignored; only `feed` carries an envelope.
                        if event.name != "feed" {
                            continue;
                        }
                        let data = event.data.trim();
                        if data.is_empty() {
                            continue;
                        }
                        if let ControlFlow::Break(()) =
                            self.handle_feed_event(old.id, data, failed_endpoints).await
                        {
                            return StreamEnd::Stop;
                        }
                    }
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    warn!(
                        "realtime: stream error for subscription {}: {message}",
                        old.id
                    );
                    if let Err(persist_err) = self
                        .apply
                        .persist_sync_error(old, now_ms(), &message, false)
                        .await
                    {
                        warn!("realtime: failed to persist stream error: {persist_err}");
                    }
                    return StreamEnd::Established;
                }
                None => return StreamEnd::Established,
            }
        }
    }

    /// Parses and applies one `feed` event. `Break` stops the task.
    async fn handle_feed_event(
        &self,
        subscription_id: SubscriptionId,
        data: &str,
        failed_endpoints: &HashSet<String>,
    ) -> ControlFlow<()> {
        let now = now_ms();

        let latest = match self.subscriptions.get(subscription_id).await {
            Ok(Some(subscription)) => subscription,
            Ok(None) => return ControlFlow::Break(()),
            Err(e) => {
                warn!("realtime: store read failed for subscription {subscription_id}: {e}");
                return ControlFlow::Continue(());
            }
        };

        if latest.sync_mode != SyncMode::Realtime || latest.is_sync_terminal {
            return ControlFlow::Break(());
        }

        debug!(
            "realtime: feed event subscription {subscription_id} bytes={}",
            data.len()
        );

        let parsed = match parse_success_body(latest.age_secret_key.as_deref(), data) {
            Ok(parsed) => parsed,
            Err(e) => {
                let terminal = e.is_terminal_decrypt();
                if let Err(persist_err) = self
                    .apply
                    .persist_sync_error(&latest, now, &e.to_string(), terminal)
                    .await
                {
                    warn!("realtime: failed to persist parse error: {persist_err}");
                }
                return if terminal {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                };
            }
        };

        match self
            .apply
            .apply_document(
                &latest,
                &parsed.document,
                &parsed.revision,
                parsed.ttl_seconds,
                parsed.supports_sse,
                now,
                failed_endpoints,
                false,
            )
            .await
        {
            Ok(ApplyOutcome::Terminal { .. }) => ControlFlow::Break(()),
            Ok(ApplyOutcome::Applied { .. }) => ControlFlow::Continue(()),
            Err(e) => {
                warn!("realtime: apply failed for subscription {subscription_id}: {e}");
                if let Err(persist_err) = self
                    .apply
                    .persist_sync_error(&latest, now, &e.to_string(), false)
                    .await
                {
                    warn!("realtime: failed to persist apply error: {persist_err}");
                }
                ControlFlow::Continue(())
            }
        }
    }

    /// Clears `last_error` on the latest row after a successful connect.
    async fn clear_last_error(&self, subscription_id: SubscriptionId) {
        let refreshed = match self.subscriptions.get(subscription_id).await {
            Ok(Some(subscription)) => subscription,
            _ => return,
        };
        if refreshed.last_error.is_some() {
            let updated = Subscription {
                last_error: None,
                ..refreshed
            };
            if let Err(e) = self.subscriptions.update(&updated).await {
                warn!("realtime: failed to clear last error: {e}");
            }
        }
    }

    /// Persists failed-endpoint demotion when it changes the stored order.
    async fn persist_demotion(
        &self,
        subscription_id: SubscriptionId,
        failed_endpoints: &HashSet<String>,
    ) {
        if failed_endpoints.is_empty() {
            return;
        }
        let refreshed = match self.subscriptions.get(subscription_id).await {
            Ok(Some(subscription)) => subscription,
            _ => return,
        };
        let current = refreshed.endpoint_list();
        let reordered = endpoints::demote_failed(&current, failed_endpoints);
        if reordered != current {
            let updated = Subscription {
                endpoints_json: endpoints::encode(&reordered),
                ..refreshed
            };
            if let Err(e) = self.subscriptions.update(&updated).await {
                warn!("realtime: failed to persist endpoint demotion: {e}");
            }
        }
    }
}

impl Drop for RealtimeSyncer {
    fn drop(&mut self) {
        // Abort any remaining tasks so dropped syncers don't leak streams.
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }
}
