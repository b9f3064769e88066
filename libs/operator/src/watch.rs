//! C5 — Watch Manager (§4.5): keeps one `kube::runtime::watcher` informer
//! alive per `(group, resource, namespace-or-cluster-wide)` requirement the
//! `RuleStore` currently reports, starting/stopping them as rules come and
//! go, seeding a synthetic `UPDATE` per existing object plus one
//! `SEED_SYNC` control event per affected target on every (re)start, and
//! retrying informer errors with jittered exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::discovery::{ApiResource, Discovery, Scope as DiscoveryScope};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::event::{ControlKind, Operation, SeedSnapshot, StreamEvent, TargetRef, UserInfo};
use crate::identifier::ResourceIdentifier;
use crate::metrics::Metrics;
use crate::router::EventRouter;
use crate::rules::RuleStore;
use crate::sanitize;

/// Desired informer key: `namespace == None` means cluster-wide, whether
/// because the resource itself is cluster-scoped or because some active
/// rule needs cross-namespace visibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InformerKey {
    group: String,
    resource: String,
    namespace: Option<String>,
}

struct ActiveInformer {
    cancel: CancellationToken,
}

pub struct WatchManager {
    client: Client,
    rule_store: Arc<RuleStore>,
    router: Arc<EventRouter>,
    metrics: Arc<Metrics>,
    config: RuntimeConfig,
    active: Mutex<HashMap<InformerKey, ActiveInformer>>,
}

impl WatchManager {
    pub fn new(
        client: Client,
        rule_store: Arc<RuleStore>,
        router: Arc<EventRouter>,
        metrics: Arc<Metrics>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            client,
            rule_store,
            router,
            metrics,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Periodic driver: on a `watchReconcileInterval` tick (and once at
    /// startup), compares `RuleStore::required_scopes` against the live
    /// informer set and starts/stops the difference.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.watch_reconcile_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("watch manager shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.reconcile_informers(cancel.child_token()).await;
                }
            }
        }
    }

    async fn reconcile_informers(&self, parent_cancel: CancellationToken) {
        let desired: Vec<InformerKey> = self
            .rule_store
            .required_scopes()
            .into_iter()
            .map(|(group, resource, namespace)| InformerKey {
                group,
                resource,
                namespace,
            })
            .collect();

        let discovery = match Discovery::new(self.client.clone()).run().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "discovery failed, keeping existing informer set this tick");
                return;
            }
        };

        let discoverable: Vec<InformerKey> = desired
            .into_iter()
            .filter(|key| self.resolve_api_resource(&discovery, key).is_some())
            .collect();

        let mut active = self.active.lock().await;

        let to_stop: Vec<InformerKey> = active
            .keys()
            .filter(|k| !discoverable.contains(k))
            .cloned()
            .collect();
        for key in to_stop {
            if let Some(informer) = active.remove(&key) {
                informer.cancel.cancel();
                self.router.purge_hashes_with_prefix(&informer_prefix(&key)).await;
                self.metrics.active_informers.dec();
                info!(group = %key.group, resource = %key.resource, namespace = ?key.namespace, "stopped informer");
            }
        }

        for key in &discoverable {
            if active.contains_key(key) {
                continue;
            }
            let Some(api_resource) = self.resolve_api_resource(&discovery, key) else {
                continue;
            };
            let cancel = parent_cancel.child_token();
            let api = match &key.namespace {
                Some(ns) => Api::<DynamicObject>::namespaced_with(self.client.clone(), ns, &api_resource),
                None => Api::<DynamicObject>::all_with(self.client.clone(), &api_resource),
            };
            self.spawn_informer(key.clone(), api, cancel.clone());
            active.insert(key.clone(), ActiveInformer { cancel });
            self.metrics.active_informers.inc();
            info!(group = %key.group, resource = %key.resource, namespace = ?key.namespace, "started informer");
        }
    }

    fn resolve_api_resource(&self, discovery: &Discovery, key: &InformerKey) -> Option<ApiResource> {
        for group in discovery.groups() {
            if group.name() != key.group {
                continue;
            }
            for (api_resource, capabilities) in group.recommended_resources() {
                if api_resource.plural == key.resource {
                    if key.namespace.is_some() && capabilities.scope == DiscoveryScope::Cluster {
                        return None;
                    }
                    return Some(api_resource);
                }
            }
        }
        None
    }

    fn spawn_informer(&self, key: InformerKey, api: Api<DynamicObject>, cancel: CancellationToken) {
        let router = self.router.clone();
        let metrics = self.metrics.clone();
        let rule_store = self.rule_store.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            run_informer(key, api, router, metrics, rule_store, config, cancel).await;
        });
    }
}

fn informer_prefix(key: &InformerKey) -> String {
    format!("{}/", key.group)
}

/// One informer's lifetime: initial list becomes a seed sweep (synthetic
/// UPDATE per object, then one `SEED_SYNC` control event per target bound to
/// this GVR), then the stream of live watch events is forwarded forever,
/// with jittered exponential backoff restarting the whole watch on error.
async fn run_informer(
    key: InformerKey,
    api: Api<DynamicObject>,
    router: Arc<EventRouter>,
    metrics: Arc<Metrics>,
    rule_store: Arc<RuleStore>,
    config: RuntimeConfig,
    cancel: CancellationToken,
) {
    let mut backoff = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_secs(60);

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let start = tokio::time::Instant::now();
        let (seeded_targets, snapshot) = seed_sweep(&key, &api, &router, &rule_store, &metrics).await;
        metrics.snapshot_duration.observe(start.elapsed().as_secs_f64());
        for (target, path) in &seeded_targets {
            router
                .route_control(ControlKind::SeedSync(snapshot.clone()), target.clone(), path.clone())
                .await;
        }

        // Consumed as the raw `Event<K>` stream rather than through
        // `.applied_objects()`: that combinator drops `Delete` entirely,
        // and DELETE is the one operation C9 cannot recover from a sanitized
        // snapshot alone (the file just has to go). `Init`/`InitDone` are
        // ignored — the seed sweep above already performs its own LIST.
        let stream = watcher::watcher(api.clone(), watcher::Config::default()).default_backoff();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => {
                    match next {
                        Some(Ok(Event::Apply(object) | Event::InitApply(object))) => {
                            backoff = Duration::from_secs(1);
                            handle_object_event(&key, object, Operation::Update, &router, &metrics).await;
                        }
                        Some(Ok(Event::Delete(object))) => {
                            backoff = Duration::from_secs(1);
                            handle_object_event(&key, object, Operation::Delete, &router, &metrics).await;
                        }
                        Some(Ok(Event::Init | Event::InitDone)) => {}
                        Some(Err(e)) => {
                            warn!(group = %key.group, resource = %key.resource, error = %e, "informer stream error, restarting with backoff");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
        let _ = &config;
    }
}

/// Lists `key`'s current objects, forwards each as a synthetic UPDATE, and
/// returns every `(target, path)` pair this GVR feeds plus the snapshot of
/// identifiers actually observed this round — the `S_live` the branch
/// worker's orphan sweep (§4.9.3) consults to tell "gone from the cluster"
/// apart from "structurally unmatched by any rule".
async fn seed_sweep(
    key: &InformerKey,
    api: &Api<DynamicObject>,
    router: &Arc<EventRouter>,
    rule_store: &Arc<RuleStore>,
    metrics: &Arc<Metrics>,
) -> (Vec<(TargetRef, String)>, Arc<SeedSnapshot>) {
    let mut targets = std::collections::HashSet::new();
    let mut observed = std::collections::HashSet::new();
    let list = match api.list(&Default::default()).await {
        Ok(list) => list,
        Err(e) => {
            warn!(group = %key.group, resource = %key.resource, error = %e, "seed list failed, skipping this round's snapshot");
            let empty_snapshot = Arc::new(SeedSnapshot {
                group: key.group.clone(),
                resource: key.resource.clone(),
                observed: std::collections::HashSet::new(),
            });
            return (Vec::new(), empty_snapshot);
        }
    };
    for object in list.items {
        if let Some(id) = identifier_of(&object, key) {
            observed.insert(id);
        }
        for binding in route_bindings(&object, key, rule_store) {
            targets.insert((binding.target.clone(), binding.path.clone()));
        }
        handle_object_event(key, object, Operation::Update, router, metrics).await;
    }
    let snapshot = Arc::new(SeedSnapshot {
        group: key.group.clone(),
        resource: key.resource.clone(),
        observed,
    });
    (targets.into_iter().collect(), snapshot)
}

fn route_bindings(
    object: &DynamicObject,
    key: &InformerKey,
    rule_store: &Arc<RuleStore>,
) -> Vec<crate::rules::TargetBinding> {
    let Some(id) = identifier_of(object, key) else {
        return Vec::new();
    };
    rule_store.match_event(&id, Operation::Update, Some(object), None)
}

fn identifier_of(object: &DynamicObject, key: &InformerKey) -> Option<ResourceIdentifier> {
    let name = object.metadata.name.clone()?;
    let namespace = object.metadata.namespace.clone().unwrap_or_default();
    let version = object
        .types
        .as_ref()
        .map(|t| t.api_version.rsplit('/').next().unwrap_or(&t.api_version).to_string())
        .unwrap_or_default();
    Some(ResourceIdentifier::new(key.group.clone(), version, key.resource.clone(), namespace, name))
}

async fn handle_object_event(
    key: &InformerKey,
    object: DynamicObject,
    operation: Operation,
    router: &Arc<EventRouter>,
    metrics: &Arc<Metrics>,
) {
    let Some(id) = identifier_of(&object, key) else {
        return;
    };
    metrics.event_received(&key.group, &key.resource);

    // DELETE carries no object and hashes on the identifier alone (§3);
    // the informer's `OldObject` is only useful for rule matching, not
    // for anything C9 writes to disk.
    if operation == Operation::Delete {
        router
            .route_resource(None, id, operation, UserInfo::system(), None)
            .await;
        return;
    }

    let sanitized = match sanitize::sanitize(&object, &sanitize::DEFAULT_ANNOTATION_DENYLIST
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>())
    {
        Ok(s) => Some(s),
        Err(e) => {
            debug!(%id, error = %e, "dropping unsanitizable object (poison)");
            metrics.events_dropped_poison.inc();
            return;
        }
    };
    router
        .route_resource(Some(object), id, operation, UserInfo::system(), sanitized)
        .await;
}
