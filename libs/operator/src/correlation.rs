use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::trace;

/// One attributed arrival under a correlation key.
#[derive(Debug, Clone)]
struct CorrelationEntry {
    username: String,
    created_at: Instant,
}

struct Inner {
    /// FIFO queue of arrivals per canonical key.
    queues: HashMap<String, VecDeque<CorrelationEntry>>,
    /// Recency order for LRU eviction, most-recently-touched key at the back.
    recency: VecDeque<String>,
}

/// Short-TTL FIFO queue per content-key bridging the admission webhook
/// (user attribution) to the informer-driven event pipeline (authoritative
/// coverage).
///
/// A process-wide singleton, per the spec's Design Notes: wired once at
/// startup, torn down once at shutdown. Entries never re-appear once
/// `Take`n or swept — identical content from multiple users in rapid
/// succession is attributable strictly in arrival order, but there is no
/// ordering guarantee *across* keys.
pub struct CorrelationStore {
    inner: Mutex<Inner>,
    max_depth: usize,
    max_entries: usize,
    ttl: Duration,
}

impl CorrelationStore {
    pub fn new(max_depth: usize, max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                recency: VecDeque::new(),
            }),
            max_depth,
            max_entries,
            ttl,
        }
    }

    /// Defaults from §3 of the spec: max depth 10, max 10,000 keys, 60s TTL.
    pub fn with_defaults() -> Self {
        Self::new(10, 10_000, Duration::from_secs(60))
    }

    /// Append `username` to `key`'s FIFO. Drops the oldest entry if the
    /// queue would exceed `max_depth`; evicts the least-recently-touched key
    /// entirely if the store would exceed `max_entries`.
    pub fn put(&self, key: &str, username: impl Into<String>) {
        let mut inner = self.inner.lock().expect("correlation store poisoned");

        touch_recency(&mut inner.recency, key);

        let queue = inner.queues.entry(key.to_string()).or_default();
        queue.push_back(CorrelationEntry {
            username: username.into(),
            created_at: Instant::now(),
        });
        while queue.len() > self.max_depth {
            queue.pop_front();
        }

        while inner.queues.len() > self.max_entries {
            let Some(evict_key) = inner.recency.pop_front() else {
                break;
            };
            inner.queues.remove(&evict_key);
        }
    }

    /// Remove and return the oldest entry under `key`. Removes the key
    /// entirely once its queue empties. Evicted/expired entries never
    /// reappear.
    pub fn take(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("correlation store poisoned");
        let queue = inner.queues.get_mut(key)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            inner.queues.remove(key);
            inner.recency.retain(|k| k != key);
        }
        entry.map(|e| e.username)
    }

    /// Remove every entry older than `ttl`. Run from the background sweep
    /// loop every `ttl / 2`.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().expect("correlation store poisoned");
        let ttl = self.ttl;
        let now = Instant::now();
        let mut emptied = Vec::new();
        for (key, queue) in inner.queues.iter_mut() {
            queue.retain(|e| now.duration_since(e.created_at) < ttl);
            if queue.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in &emptied {
            inner.queues.remove(key);
        }
        inner.recency.retain(|k| !emptied.contains(k));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("correlation store poisoned").queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the background sweep task; cancels cooperatively via `token`,
    /// like every other long-running task in this process.
    pub fn spawn_sweeper(
        store: std::sync::Arc<Self>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let interval_duration = store.ttl / 2;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        trace!("correlation store sweeper shutting down");
                        return;
                    }
                    _ = interval.tick() => {
                        store.sweep();
                    }
                }
            }
        })
    }
}

fn touch_recency(recency: &mut VecDeque<String>, key: &str) {
    recency.retain(|k| k != key);
    recency.push_back(key.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_returns_entries_in_arrival_order() {
        let store = CorrelationStore::new(10, 10_000, Duration::from_secs(60));
        store.put("k", "alice");
        store.put("k", "bob");
        assert_eq!(store.take("k").as_deref(), Some("alice"));
        assert_eq!(store.take("k").as_deref(), Some("bob"));
        assert_eq!(store.take("k"), None);
    }

    #[test]
    fn key_is_removed_once_queue_empties() {
        let store = CorrelationStore::new(10, 10_000, Duration::from_secs(60));
        store.put("k", "alice");
        store.take("k");
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn max_depth_drops_oldest() {
        let store = CorrelationStore::new(2, 10_000, Duration::from_secs(60));
        store.put("k", "a");
        store.put("k", "b");
        store.put("k", "c");
        assert_eq!(store.take("k").as_deref(), Some("b"));
        assert_eq!(store.take("k").as_deref(), Some("c"));
    }

    #[test]
    fn max_entries_evicts_least_recently_touched_key() {
        let store = CorrelationStore::new(10, 1, Duration::from_secs(60));
        store.put("a", "1");
        store.put("b", "1");
        assert_eq!(store.len(), 1);
        assert_eq!(store.take("a"), None);
        assert_eq!(store.take("b").as_deref(), Some("1"));
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let store = CorrelationStore::new(10, 10_000, Duration::from_millis(1));
        store.put("k", "alice");
        std::thread::sleep(Duration::from_millis(5));
        store.sweep();
        assert_eq!(store.take("k"), None);
    }

    #[test]
    fn repeated_admission_review_yields_one_queue_of_depth_two() {
        let store = CorrelationStore::new(10, 10_000, Duration::from_secs(60));
        store.put("k", "alice");
        store.put("k", "alice");
        assert_eq!(store.take("k").as_deref(), Some("alice"));
        assert_eq!(store.take("k").as_deref(), Some("alice"));
        assert_eq!(store.take("k"), None);
    }
}
