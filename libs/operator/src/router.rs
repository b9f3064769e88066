//! C7 — Event Router (§4.7): fans a matched event out to every `GitTarget`
//! it binds to, attributing it to a real user via the `CorrelationStore`
//! when the admission webhook observed the same content first.

use std::collections::HashMap;
use std::sync::Arc;

use kube::api::DynamicObject;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::admission::content_hash;
use crate::correlation::CorrelationStore;
use crate::event::{ControlKind, Operation, StreamEvent, TargetRef, UserInfo};
use crate::identifier::ResourceIdentifier;
use crate::metrics::Metrics;
use crate::rules::RuleStore;
use crate::target_stream::TargetStream;

pub struct EventRouter {
    rule_store: Arc<RuleStore>,
    correlation: Arc<CorrelationStore>,
    metrics: Arc<Metrics>,
    streams: Mutex<HashMap<TargetRef, Arc<TargetStream>>>,
}

impl EventRouter {
    pub fn new(rule_store: Arc<RuleStore>, correlation: Arc<CorrelationStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            rule_store,
            correlation,
            metrics,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Called by the `GitTarget` lifecycle controller (C10) once a target's
    /// `EventStreamLive` gate is satisfied.
    pub async fn register_target(&self, target: TargetRef, stream: Arc<TargetStream>) {
        self.streams.lock().await.insert(target, stream);
    }

    pub async fn unregister_target(&self, target: &TargetRef) {
        self.streams.lock().await.remove(target);
    }

    pub async fn stream_state(&self, target: &TargetRef) -> Option<crate::target_stream::StreamState> {
        let stream = self.streams.lock().await.get(target).cloned()?;
        Some(stream.state().await)
    }

    /// `Route(event)`: matches `id`/`op` against the rule store, resolves the
    /// attributing user per binding (correlation hit, or `fallback_user`),
    /// and pushes one cloned `StreamEvent` per matched `(target, path)`.
    pub async fn route_resource(
        &self,
        object: Option<DynamicObject>,
        id: ResourceIdentifier,
        operation: Operation,
        fallback_user: UserInfo,
        sanitized: Option<String>,
    ) {
        // Namespace-label evaluation for `ClusterWatchRule.namespaceSelector`
        // is left permissive (matches unless proven otherwise) until a
        // Namespace-label cache lands — see DESIGN.md, "namespace selector
        // evaluation".
        let bindings = self
            .rule_store
            .match_event(&id, operation, object.as_ref(), None);
        if bindings.is_empty() {
            return;
        }

        let hash_key = match operation {
            Operation::Delete => id.to_string(),
            _ => content_hash(sanitized.as_deref().unwrap_or_default()),
        };
        // Mirror admission.rs's CREATE->UPDATE collapse: the informer never
        // reports CREATE (watch.rs only emits `Operation::Update` for
        // `Event::Apply`), so the correlation bucket the admission side
        // wrote under CREATE is probed here under UPDATE instead.
        let correlation_op = match operation {
            Operation::Create => Operation::Update.as_str(),
            other => other.as_str(),
        };
        let correlation_key = format!("{id}:{correlation_op}:{hash_key}");
        let username = self
            .correlation
            .take(&correlation_key)
            .map(|u| {
                self.metrics.correlation_hits.inc();
                u
            })
            .unwrap_or_else(|| {
                self.metrics.correlation_misses.inc();
                fallback_user.username.clone()
            });
        let user_info = UserInfo { username };

        let streams = self.streams.lock().await;
        for binding in bindings {
            let event = StreamEvent::resource(
                object.clone(),
                id.clone(),
                operation,
                user_info.clone(),
                binding.target.clone(),
                binding.path.clone(),
                sanitized.clone(),
            );
            match streams.get(&binding.target) {
                Some(stream) => stream.on_watch_event(event).await,
                None => {
                    debug!(target = %binding.target, %id, "no live event stream for target yet, dropping event (sweep will catch up)");
                }
            }
        }
    }

    /// Control events are addressed to one target directly, bypassing
    /// `match_event` entirely — they carry no resource identity to match on.
    /// `path` is the target's own path prefix, so the eventual branch worker
    /// knows which on-disk subtree a `SeedSync` should run orphan detection
    /// against (§4.9.3).
    pub async fn route_control(&self, kind: ControlKind, target: TargetRef, path: String) {
        let streams = self.streams.lock().await;
        match streams.get(&target) {
            Some(stream) => stream.on_watch_event(StreamEvent::control(kind, target, path)).await,
            None => warn!(%target, "no live event stream for control event, dropping"),
        }
    }

    /// Propagated from the Watch Manager whenever an informer starts or
    /// stops, so dedup state for a resurrected rule can't suppress its first
    /// re-forwarded commit.
    pub async fn purge_hashes_with_prefix(&self, prefix: &str) {
        let streams = self.streams.lock().await;
        for stream in streams.values() {
            stream.purge_hashes_with_prefix(prefix).await;
        }
    }
}
