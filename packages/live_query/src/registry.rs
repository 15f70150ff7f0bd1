//! SubscriptionRegistry: process-wide table of live query sessions.
//!
//! Keys are chosen by the caller. The registry allocates request ids, builds
//! each session with its own transport, and drives bulk teardown on quit or
//! pause and bulk renewal on resume.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::ClientConfig;
use crate::error::{LiveQueryError, Result};
use crate::handler::{EventHandler, LiveQueryCallbacks, TypedCallbacks};
use crate::protocol::{LiveQuery, subscribe_request};
use crate::session::SubscriptionSession;
use crate::transport::{TransportFactory, WebSocketTransportFactory};

/// Shared handle to one registered session.
pub type SessionHandle = Arc<Mutex<SubscriptionSession>>;

pub struct SubscriptionRegistry {
    config: ClientConfig,
    transports: Arc<dyn TransportFactory>,
    codec: Arc<dyn Codec>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    next_request_id: AtomicU64,
    paused: AtomicBool,
}

impl SubscriptionRegistry {
    pub fn new(config: ClientConfig, transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            config,
            transports,
            codec: Arc::new(JsonCodec),
            sessions: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            paused: AtomicBool::new(false),
        }
    }

    /// Registry whose sessions each open a native WebSocket.
    pub fn with_websocket(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(WebSocketTransportFactory))
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether the host has paused the registry and not resumed it yet.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Create, subscribe and register a session under `key`.
    ///
    /// Fails with [`LiveQueryError::DuplicateKey`] if `key` is taken, or with
    /// whatever `subscribe()` returned; in both cases nothing is stored.
    pub async fn add_subscription<H>(
        &self,
        key: &str,
        query: LiveQuery,
        handler: H,
    ) -> Result<SessionHandle>
    where
        H: EventHandler + 'static,
    {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(key) {
            warn!(key = %key, "live query subscription key already registered");
            return Err(LiveQueryError::DuplicateKey(key.to_string()));
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let envelope = subscribe_request(request_id, &query, self.config.session_token.as_deref());
        let mut session = SubscriptionSession::new(
            key,
            request_id,
            envelope,
            &self.config,
            self.transports.create(key),
            Box::new(handler),
        )
        .with_codec(self.codec.clone());
        // Sessions added while paused must not reconnect on their own either
        session.set_paused(self.paused.load(Ordering::SeqCst));
        session.subscribe()?;

        info!(key = %key, request_id, class = %query.class_name, "live query subscription added");
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(key.to_string(), handle.clone());
        Ok(handle)
    }

    /// [`SubscriptionRegistry::add_subscription`] with object payloads decoded
    /// into `T` before they reach `callbacks`.
    pub async fn add_typed_subscription<T, C>(
        &self,
        key: &str,
        query: LiveQuery,
        callbacks: C,
    ) -> Result<SessionHandle>
    where
        T: DeserializeOwned + 'static,
        C: LiveQueryCallbacks<T> + 'static,
    {
        self.add_subscription(key, query, TypedCallbacks::<T, C>::new(callbacks))
            .await
    }

    pub async fn get_subscription(&self, key: &str) -> Option<SessionHandle> {
        self.sessions.lock().await.get(key).cloned()
    }

    /// Unsubscribe `key`, wait (bounded) for the server to confirm, and
    /// delete the entry. Unknown keys are ignored.
    pub async fn remove_subscriptions(&self, key: &str) {
        let Some(handle) = self.get_subscription(key).await else {
            debug!(key = %key, "no live query subscription to remove");
            return;
        };
        self.close_session(&handle).await;
        self.forget(key, &handle).await;
        info!(key = %key, "live query subscription removed");
    }

    /// Tear down every session concurrently and clear the registry.
    pub async fn unsubscribe_all(&self) {
        let entries = self.snapshot().await;
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "unsubscribing all live queries");

        join_all(entries.iter().map(|(_, handle)| self.close_session(handle))).await;
        for (key, handle) in &entries {
            self.forget(key, handle).await;
        }
    }

    /// Close every session but keep the entries so [`SubscriptionRegistry::resume`]
    /// can renew them.
    pub async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let entries = self.snapshot().await;
        info!(count = entries.len(), "pausing live queries");
        for (_, handle) in &entries {
            handle.lock().await.set_paused(true);
        }
        join_all(entries.iter().map(|(_, handle)| self.close_session(handle))).await;
    }

    /// Clear the pause flag and renew every session. Returns how many were
    /// renewed; sessions the server refused to reconnect stay closed.
    pub async fn resume(&self) -> usize {
        self.paused.store(false, Ordering::SeqCst);
        let entries = self.snapshot().await;
        let renewals = entries.iter().map(|(key, handle)| async move {
            let mut session = handle.lock().await;
            session.set_paused(false);
            match session.renew_subscription() {
                Ok(()) => true,
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to renew live query subscription");
                    false
                }
            }
        });
        let renewed = join_all(renewals).await.into_iter().filter(|ok| *ok).count();
        info!(renewed, total = entries.len(), "live queries resumed");
        renewed
    }

    /// Pump every session once.
    pub async fn pump_all(&self) {
        for (_, handle) in self.snapshot().await {
            handle.lock().await.pump();
        }
    }

    /// Spawn a task that calls [`SubscriptionRegistry::pump_all`] every
    /// `interval` until `cancel` fires.
    pub fn spawn_pump_loop(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.pump_all().await,
                }
            }
            debug!("live query pump loop stopped");
        })
    }

    /// Registered keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    async fn snapshot(&self) -> Vec<(String, SessionHandle)> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(k, h)| (k.clone(), h.clone()))
            .collect()
    }

    /// Remove `key` only if it still maps to `handle`; a replacement added
    /// during teardown stays.
    async fn forget(&self, key: &str, handle: &SessionHandle) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(key).is_some_and(|h| Arc::ptr_eq(h, handle)) {
            sessions.remove(key);
        }
    }

    /// Unsubscribe and pump until the session closes, abandoning it once the
    /// teardown timeout elapses. The map lock is not held here.
    async fn close_session(&self, handle: &SessionHandle) {
        handle.lock().await.unsubscribe();

        let teardown = &self.config.teardown;
        let wait = async {
            loop {
                {
                    let mut session = handle.lock().await;
                    session.pump();
                    if session.state().is_terminal() {
                        return;
                    }
                }
                tokio::time::sleep(teardown.poll_interval).await;
            }
        };

        if tokio::time::timeout(teardown.timeout, wait).await.is_err() {
            let mut session = handle.lock().await;
            warn!(
                key = %session.key(),
                timeout_ms = teardown.timeout.as_millis() as u64,
                "live query unsubscribe not confirmed in time"
            );
            session.abandon();
        }
    }
}
