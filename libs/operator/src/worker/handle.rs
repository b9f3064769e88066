//! `WorkerHandle`: the cloneable front door to a `BranchWorker`'s queue.
//!
//! The channel itself stays unbounded (events are never silently dropped),
//! but `enqueue` awaits a `Semaphore` permit once the soft high-water mark
//! worth of permits are checked out — "slow-enqueue" backpressure rather
//! than a bounded channel's hard reject.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::event::StreamEvent;

pub(super) struct QueuedEvent {
    pub event: StreamEvent,
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<QueuedEvent>,
    backpressure: Arc<Semaphore>,
    depth: Arc<AtomicI64>,
}

impl WorkerHandle {
    pub(super) fn new(
        tx: mpsc::UnboundedSender<QueuedEvent>,
        high_water_mark: usize,
    ) -> Self {
        Self {
            tx,
            backpressure: Arc::new(Semaphore::new(high_water_mark.max(1))),
            depth: Arc::new(AtomicI64::new(0)),
        }
    }

    pub async fn enqueue(&self, event: StreamEvent) {
        let permit = self.backpressure.clone().acquire_owned().await.ok();
        self.depth.fetch_add(1, Ordering::Relaxed);
        // Unbounded send only fails if the receiver (the worker's processing
        // loop) has shut down, which only happens once the worker itself has
        // been torn down by garbage collection; there is nothing useful to
        // do with the event at that point.
        let _ = self.tx.send(QueuedEvent {
            event,
            _permit: permit,
        });
    }

    pub fn depth(&self) -> i64 {
        self.depth.load(Ordering::Relaxed)
    }

    pub(super) fn record_dequeue(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;

    /// A `WorkerHandle` with no attached processing loop, for unit testing
    /// upstream components (C7/C8) in isolation.
    pub fn mock_worker_handle() -> (WorkerHandle, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedEvent>();
        let (fwd_tx, fwd_rx) = mpsc::unbounded_channel::<StreamEvent>();
        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let _ = fwd_tx.send(queued.event);
            }
        });
        (WorkerHandle::new(tx, 1_000), fwd_rx)
    }
}
