//! Handler registry: a multi-map from dispatch key to subscribed handlers.
//!
//! Dispatch snapshots the handlers for a key, releases the registry lock, and
//! runs every handler as its own task, returning once all of them have
//! finished. Each registration carries a gate that a handler holds shared for
//! the duration of its invocation and that [`Subscription::remove`] closes
//! exclusively, so once `remove` returns that handler will not run again.
//!
//! Consequences for handler authors:
//! - a handler must not `remove` its own subscription inline (it would wait on
//!   itself); spawn the removal instead
//! - a handler that never returns stalls the receive loop

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::frame::Frame;

/// Callback invoked with every frame dispatched under its key.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle(&self, frame: Arc<Frame>);
}

#[async_trait]
impl<F, Fut> FrameHandler for F
where
    F: Fn(Arc<Frame>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, frame: Arc<Frame>) {
        (self)(frame).await
    }
}

#[derive(Clone)]
struct Registration {
    id: u64,
    handler: Arc<dyn FrameHandler>,
    gate: Arc<RwLock<bool>>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    buckets: RwLock<HashMap<String, Vec<Registration>>>,
}

/// Shared handle to the registry. Clones see the same registrations.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<Inner>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `key` (case-insensitive).
    pub async fn add(&self, key: &str, handler: impl FrameHandler) -> Subscription {
        self.add_shared(key, Arc::new(handler)).await
    }

    pub async fn add_shared(&self, key: &str, handler: Arc<dyn FrameHandler>) -> Subscription {
        let key = key.to_lowercase();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(RwLock::new(true));

        self.inner
            .buckets
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .push(Registration {
                id,
                handler,
                gate: gate.clone(),
            });
        debug!(key = %key, id, "handler registered");

        Subscription {
            key,
            id,
            gate,
            registry: Arc::downgrade(&self.inner),
            removed: AtomicBool::new(false),
        }
    }

    /// Run every handler registered under the frame's dispatch key and wait
    /// for all of them. Returns how many handlers ran to completion.
    pub async fn dispatch(&self, frame: Arc<Frame>) -> usize {
        let Some(key) = frame.dispatch_key() else {
            debug!("frame has no dispatch key, dropping");
            return 0;
        };

        let targets: Vec<Registration> = {
            let buckets = self.inner.buckets.read().await;
            buckets.get(&key).cloned().unwrap_or_default()
        };
        if targets.is_empty() {
            debug!(key = %key, "no handlers for frame");
            return 0;
        }

        let mut tasks = JoinSet::new();
        for registration in targets {
            let frame = frame.clone();
            tasks.spawn(async move {
                let active = registration.gate.read().await;
                if !*active {
                    return false;
                }
                registration.handler.handle(frame).await;
                true
            });
        }

        let mut invoked = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => invoked += 1,
                Ok(false) => {}
                Err(e) => error!(key = %key, error = %e, "frame handler panicked"),
            }
        }
        debug!(key = %key, invoked, "frame dispatched");
        invoked
    }

    /// Number of handlers registered under `key`.
    pub async fn count(&self, key: &str) -> usize {
        self.inner
            .buckets
            .read()
            .await
            .get(&key.to_lowercase())
            .map_or(0, Vec::len)
    }

    /// Keys with at least one handler, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.buckets.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total number of registrations across all keys.
    pub async fn len(&self) -> usize {
        self.inner.buckets.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.buckets.read().await.is_empty()
    }
}

/// Removal token for one registration.
///
/// Dropping it leaves the handler registered; only [`Subscription::remove`]
/// unsubscribes.
pub struct Subscription {
    key: String,
    id: u64,
    gate: Arc<RwLock<bool>>,
    registry: Weak<Inner>,
    removed: AtomicBool,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Unsubscribe this handler, waiting for any invocation in progress.
    ///
    /// Returns `false` when it was already removed. Safe to call again after
    /// an earlier removal was cancelled part way.
    pub async fn remove(&self) -> bool {
        if self.is_removed() {
            return false;
        }

        if let Some(inner) = self.registry.upgrade() {
            let mut buckets = inner.buckets.write().await;
            if let Some(bucket) = buckets.get_mut(&self.key) {
                bucket.retain(|registration| registration.id != self.id);
                if bucket.is_empty() {
                    buckets.remove(&self.key);
                }
            }
        }

        *self.gate.write().await = false;
        let first = !self.removed.swap(true, Ordering::AcqRel);
        if first {
            debug!(key = %self.key, id = self.id, "handler removed");
        }
        first
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("removed", &self.is_removed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Payload, Response};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn response(method: &str) -> Arc<Frame> {
        Arc::new(Frame::response(Response {
            request_id: "1".into(),
            method: method.into(),
            object_id: None,
            data: Payload::default(),
        }))
    }

    fn counting(hits: &Arc<AtomicUsize>) -> impl FrameHandler {
        let hits = hits.clone();
        move |_frame: Arc<Frame>| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn dispatch_fans_out_to_every_handler() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            registry.add("Counter.read", counting(&hits)).await;
        }

        assert_eq!(registry.dispatch(response("Counter.read")).await, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn keys_are_case_insensitive() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.add("COUNTER.READ", counting(&hits)).await;

        assert_eq!(registry.count("counter.read").await, 1);
        assert_eq!(registry.dispatch(response("Counter.Read")).await, 1);
        assert_eq!(registry.keys().await, vec!["counter.read".to_string()]);
    }

    #[tokio::test]
    async fn remove_only_drops_its_own_handler() {
        let registry = HandlerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let sub = registry.add("Counter.read", counting(&first)).await;
        registry.add("Counter.read", counting(&second)).await;

        assert!(sub.remove().await);
        assert_eq!(registry.dispatch(response("Counter.read")).await, 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_remove_is_a_no_op() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = registry.add("Counter.read", counting(&hits)).await;

        assert!(sub.remove().await);
        assert!(!sub.remove().await);
        assert!(sub.is_removed());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn frames_without_key_reach_nobody() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.add("request", counting(&hits)).await;

        let frame = Arc::new(Frame::request(crate::frame::Request::new("Counter.read")));
        assert_eq!(registry.dispatch(frame).await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remove_waits_for_running_handler() {
        let registry = HandlerRegistry::new();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let sub = {
            let started = started.clone();
            let release = release.clone();
            registry
                .add("Counter.read", move |_frame: Arc<Frame>| {
                    let started = started.clone();
                    let release = release.clone();
                    async move {
                        started.notify_one();
                        release.notified().await;
                    }
                })
                .await
        };

        let dispatch = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.dispatch(response("Counter.read")).await })
        };
        started.notified().await;

        let sub = Arc::new(sub);
        let removal = {
            let sub = sub.clone();
            tokio::spawn(async move { sub.remove().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!removal.is_finished());

        release.notify_one();
        assert!(removal.await.unwrap());
        assert_eq!(dispatch.await.unwrap(), 1);
        assert_eq!(registry.dispatch(response("Counter.read")).await, 0);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_others() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry
            .add("Counter.read", |frame: Arc<Frame>| async move {
                if frame.counter.is_none() {
                    panic!("handler failure");
                }
            })
            .await;
        registry.add("Counter.read", counting(&hits)).await;

        assert_eq!(registry.dispatch(response("Counter.read")).await, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_returns_after_slow_handlers() {
        let registry = HandlerRegistry::new();
        let done = Arc::new(AtomicUsize::new(0));
        for delay in [30u64, 10, 20] {
            let done = done.clone();
            registry
                .add("Counter.read", move |_frame: Arc<Frame>| {
                    let done = done.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
        }

        registry.dispatch(response("Counter.read")).await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }
}
