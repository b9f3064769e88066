//! C8 — GitTarget Event Stream: the `StartupReconcile` -> `LiveProcessing`
//! state machine described in §4.8. One instance per `GitTarget`, holding
//! its `TargetState` behind a single `tokio::sync::Mutex` (single-threaded
//! by construction, per §5) so state transitions and the dedup table never
//! race each other.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::event::StreamEvent;
use crate::metrics::Metrics;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    StartupReconcile,
    LiveProcessing,
}

struct Inner {
    state: StreamState,
    buffered: Vec<StreamEvent>,
    last_forwarded_hash: HashMap<String, String>,
}

/// Per-`GitTarget` event stream. Control events (`SEED_SYNC`,
/// `RECONCILE_RESOURCE`) bypass buffering and dedup entirely — they carry no
/// identifier to dedup on and the worker's orphan-reconciliation pass needs
/// them regardless of whether the snapshot has completed yet.
pub struct TargetStream {
    inner: Mutex<Inner>,
    worker: WorkerHandle,
    metrics: Arc<Metrics>,
}

impl TargetStream {
    pub fn new(worker: WorkerHandle, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: StreamState::StartupReconcile,
                buffered: Vec::new(),
                last_forwarded_hash: HashMap::new(),
            }),
            worker,
            metrics,
        }
    }

    pub async fn state(&self) -> StreamState {
        self.inner.lock().await.state
    }

    /// `OnWatchEvent`: in `StartupReconcile`, append to the buffer with no
    /// dedup; in `LiveProcessing`, dedup against `lastForwardedHash` and
    /// forward only genuinely-changed content.
    ///
    /// A `SEED_SYNC` control event is the Watch Manager's own signal that
    /// this target's initial snapshot listing has completed (§4.5 step 5),
    /// so receiving one while still in `StartupReconcile` is exactly
    /// `OnReconciliationComplete()` (§4.8) firing for this target — the
    /// lifecycle controller only *observes* the resulting state via
    /// `EventRouter::stream_state`, it does not call this directly.
    pub async fn on_watch_event(&self, event: StreamEvent) {
        if event.is_control() {
            let is_seed_sync = matches!(event.body, crate::event::EventBody::Control(crate::event::ControlKind::SeedSync(_)));
            if is_seed_sync {
                self.complete_reconciliation().await;
            }
            self.worker.enqueue(event).await;
            return;
        }

        let mut inner = self.inner.lock().await;
        match inner.state {
            StreamState::StartupReconcile => {
                trace!(target = %event.target, "buffering event during startup reconcile");
                inner.buffered.push(event);
            }
            StreamState::LiveProcessing => {
                Self::forward_if_changed(&mut inner, event, &self.worker, &self.metrics).await;
            }
        }
    }

    /// `OnReconciliationComplete`: transition to `LiveProcessing`, then drain
    /// the buffer in arrival order through the same hash dedup, and empty it.
    /// A no-op once already `LiveProcessing` — later seed sweeps (periodic
    /// re-ticks) must not re-drain an already-empty buffer.
    pub async fn on_reconciliation_complete(&self) {
        self.complete_reconciliation().await;
    }

    async fn complete_reconciliation(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == StreamState::LiveProcessing {
            return;
        }
        inner.state = StreamState::LiveProcessing;
        let buffered = std::mem::take(&mut inner.buffered);
        debug!(count = buffered.len(), "draining buffered events after reconciliation complete");
        for event in buffered {
            Self::forward_if_changed(&mut inner, event, &self.worker, &self.metrics).await;
        }
    }

    /// Purge all `lastForwardedHash` entries for identifiers under `prefix`
    /// (a canonical `(group, version, resource, namespace)` string prefix),
    /// called by the Watch Manager whenever an informer is started or
    /// stopped so a resurrected rule can't suppress its first commit.
    pub async fn purge_hashes_with_prefix(&self, prefix: &str) {
        let mut inner = self.inner.lock().await;
        inner.last_forwarded_hash.retain(|k, _| !k.starts_with(prefix));
    }

    async fn forward_if_changed(
        inner: &mut Inner,
        event: StreamEvent,
        worker: &WorkerHandle,
        metrics: &Metrics,
    ) {
        let Some(identifier) = event.identifier().map(|i| i.to_string()) else {
            worker.enqueue(event).await;
            return;
        };
        let hash = event.hash();
        if let Some(hash) = &hash {
            if inner.last_forwarded_hash.get(&identifier) == Some(hash) {
                trace!(%identifier, "dropping duplicate event, content unchanged");
                return;
            }
            inner.last_forwarded_hash.insert(identifier.clone(), hash.clone());
        }
        if let Some(id) = event.identifier() {
            metrics.event_forwarded(&id.group, &id.resource);
        }
        worker.enqueue(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Operation, TargetRef, UserInfo};
    use crate::identifier::ResourceIdentifier;
    use crate::worker::test_support::mock_worker_handle;

    fn event(content: &str) -> StreamEvent {
        let id = ResourceIdentifier::new("", "v1", "configmaps", "default", "c");
        StreamEvent::resource(
            None,
            id,
            Operation::Update,
            UserInfo::system(),
            TargetRef::new("default", "t"),
            "apps".to_string(),
            Some(content.to_string()),
        )
    }

    #[tokio::test]
    async fn buffers_without_dedup_during_startup() {
        let (worker, mut rx) = mock_worker_handle();
        let stream = TargetStream::new(worker, Arc::new(Metrics::default()));
        stream.on_watch_event(event("v1")).await;
        stream.on_watch_event(event("v1")).await;
        assert!(rx.try_recv().is_err());
        stream.on_reconciliation_complete().await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "second identical event deduped on drain");
    }

    #[tokio::test]
    async fn live_processing_drops_identical_consecutive_content() {
        let (worker, mut rx) = mock_worker_handle();
        let stream = TargetStream::new(worker, Arc::new(Metrics::default()));
        stream.on_reconciliation_complete().await;
        stream.on_watch_event(event("v1")).await;
        stream.on_watch_event(event("v1")).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn live_processing_forwards_changed_content() {
        let (worker, mut rx) = mock_worker_handle();
        let stream = TargetStream::new(worker, Arc::new(Metrics::default()));
        stream.on_reconciliation_complete().await;
        stream.on_watch_event(event("v1")).await;
        stream.on_watch_event(event("v2")).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }
}
