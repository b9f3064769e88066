use crate::event::{Operation, TargetRef};
use crate::identifier::ResourceIdentifier;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::DynamicObject;

/// Whether a rule's source is namespace-scoped (`WatchRule`) or cluster-wide
/// (`ClusterWatchRule`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Cluster,
    Namespaced,
}

/// Identity of the CRD object a `CompiledRule` was compiled from, used to
/// replace or remove its contribution to the store atomically on reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleSourceKey {
    pub kind: RuleSourceKind,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleSourceKind {
    WatchRule,
    ClusterWatchRule,
}

/// A single compiled match predicate plus the `GitTarget` it's bound to.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub source: RuleSourceKey,
    pub target: TargetRef,
    pub path_prefix: String,
    pub operations: Vec<Operation>,
    pub api_groups: Vec<String>,
    pub api_versions: Vec<String>,
    pub resources: Vec<String>,
    pub scope: Scope,
    /// Restricts a `WatchRule`'s contribution to its own namespace; always
    /// `None` for a `ClusterWatchRule`, which watches cluster-wide and uses
    /// `namespace_selector` instead.
    pub namespace: Option<String>,
    pub object_selector: Option<LabelSelector>,
    pub namespace_selector: Option<LabelSelector>,
}

impl CompiledRule {
    fn has_wildcard_resource(&self) -> bool {
        self.resources.iter().any(|r| r == "*") || self.api_groups.iter().any(|g| g == "*")
    }

    fn matches_static(&self, id: &ResourceIdentifier, op: Operation) -> bool {
        if !self.operations.is_empty() && !self.operations.contains(&op) {
            return false;
        }
        let scope_ok = match self.scope {
            Scope::Cluster => id.cluster_scoped(),
            Scope::Namespaced => !id.cluster_scoped(),
        };
        if !scope_ok {
            return false;
        }
        if let Some(namespace) = &self.namespace {
            if namespace != &id.namespace {
                return false;
            }
        }
        let group_ok = self.api_groups.iter().any(|g| g == "*" || g == &id.group);
        let resource_ok = self
            .resources
            .iter()
            .any(|r| r == "*" || r == &id.resource);
        let version_ok = self.api_versions.is_empty()
            || self.api_versions.iter().any(|v| v == "*" || v == &id.version);
        group_ok && resource_ok && version_ok
    }

    fn matches_selectors(&self, obj: Option<&DynamicObject>, ns_labels: Option<&BTreeMap<String, String>>) -> bool {
        if let Some(selector) = &self.object_selector {
            let Some(obj) = obj else { return true };
            if !label_selector_matches(selector, obj.metadata.labels.as_ref()) {
                return false;
            }
        }
        if let Some(selector) = &self.namespace_selector {
            let Some(labels) = ns_labels else { return true };
            if !label_selector_matches(selector, Some(&bt_to_opt(labels))) {
                return false;
            }
        }
        true
    }
}

fn bt_to_opt(m: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    m.clone()
}

fn label_selector_matches(
    selector: &LabelSelector,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let value = labels.get(&expr.key);
            let op_matches = match expr.operator.as_str() {
                "In" => expr
                    .values
                    .as_ref()
                    .is_some_and(|vs| value.is_some_and(|v| vs.contains(v))),
                "NotIn" => expr
                    .values
                    .as_ref()
                    .is_none_or(|vs| value.is_none_or(|v| !vs.contains(v))),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => true,
            };
            if !op_matches {
                return false;
            }
        }
    }
    true
}

/// A matched `(GitTarget, path)` the event should be routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetBinding {
    pub target: TargetRef,
    pub path: String,
}

/// Key used to index compiled rules for O(1)-ish lookup in `Match`: every
/// rule is reachable by its concrete `(api_group, resource)` pairs, plus a
/// dedicated wildcard bucket consulted for every lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IndexKey {
    api_group: String,
    resource: String,
}

#[derive(Default)]
struct RuleSnapshot {
    by_source: HashMap<RuleSourceKey, Vec<Arc<CompiledRule>>>,
    index: HashMap<IndexKey, Vec<Arc<CompiledRule>>>,
    wildcard: Vec<Arc<CompiledRule>>,
    /// Rule sources with at least one rule that references an
    /// as-yet-undiscoverable wildcard GVR; surfaced as a warning condition
    /// by the owning controller.
    deferred: Vec<RuleSourceKey>,
}

fn rebuild_index(by_source: &HashMap<RuleSourceKey, Vec<Arc<CompiledRule>>>) -> (HashMap<IndexKey, Vec<Arc<CompiledRule>>>, Vec<Arc<CompiledRule>>) {
    let mut index: HashMap<IndexKey, Vec<Arc<CompiledRule>>> = HashMap::new();
    let mut wildcard = Vec::new();
    for rules in by_source.values() {
        for rule in rules {
            if rule.has_wildcard_resource() {
                wildcard.push(rule.clone());
                continue;
            }
            for group in &rule.api_groups {
                for resource in &rule.resources {
                    index
                        .entry(IndexKey {
                            api_group: group.clone(),
                            resource: resource.clone(),
                        })
                        .or_default()
                        .push(rule.clone());
                }
            }
        }
    }
    (index, wildcard)
}

/// Compiled, indexed matcher for `(operation, GVR, scope, selectors) ->
/// target bindings`. Reads (`match_event`) never block behind a writer: the
/// whole snapshot is replaced via `ArcSwap`, so `Match` is a single atomic
/// load plus pure computation — safe to call from every informer callback's
/// hot path.
pub struct RuleStore {
    snapshot: ArcSwap<RuleSnapshot>,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RuleSnapshot::default()),
        }
    }

    /// Atomically replace (or insert) the set of compiled rules contributed
    /// by one source object. Called from the owning controller's reconcile;
    /// never produces a partial view of that source's rules.
    pub fn replace_for_source(&self, source: RuleSourceKey, rules: Vec<CompiledRule>) {
        let current = self.snapshot.load();
        let mut by_source = current.by_source.clone();
        by_source.insert(source, rules.into_iter().map(Arc::new).collect());
        let (index, wildcard) = rebuild_index(&by_source);
        self.snapshot.store(Arc::new(RuleSnapshot {
            by_source,
            index,
            wildcard,
            deferred: current.deferred.clone(),
        }));
    }

    /// Remove all rules contributed by `source` (source object deleted).
    pub fn remove_source(&self, source: &RuleSourceKey) {
        let current = self.snapshot.load();
        let mut by_source = current.by_source.clone();
        by_source.remove(source);
        let (index, wildcard) = rebuild_index(&by_source);
        self.snapshot.store(Arc::new(RuleSnapshot {
            by_source,
            index,
            wildcard,
            deferred: current.deferred.clone(),
        }));
    }

    pub fn mark_deferred(&self, source: RuleSourceKey, deferred: bool) {
        let current = self.snapshot.load();
        let mut list = current.deferred.clone();
        list.retain(|s| s != &source);
        if deferred {
            list.push(source);
        }
        self.snapshot.store(Arc::new(RuleSnapshot {
            by_source: current.by_source.clone(),
            index: current.index.clone(),
            wildcard: current.wildcard.clone(),
            deferred: list,
        }));
    }

    pub fn is_deferred(&self, source: &RuleSourceKey) -> bool {
        self.snapshot.load().deferred.contains(source)
    }

    /// Pure, thread-safe match: every compiled rule whose predicate matches
    /// `(id, op, obj, namespace_labels)` contributes one `TargetBinding`.
    /// A resource overlapping N bindings intentionally produces N results —
    /// each target owns its own Git path.
    pub fn match_event(
        &self,
        id: &ResourceIdentifier,
        op: Operation,
        obj: Option<&DynamicObject>,
        namespace_labels: Option<&BTreeMap<String, String>>,
    ) -> Vec<TargetBinding> {
        let snapshot = self.snapshot.load();
        let key = IndexKey {
            api_group: id.group.clone(),
            resource: id.resource.clone(),
        };
        let mut out = Vec::new();
        let candidates = snapshot
            .index
            .get(&key)
            .into_iter()
            .flatten()
            .chain(snapshot.wildcard.iter());
        for rule in candidates {
            if rule.matches_static(id, op) && rule.matches_selectors(obj, namespace_labels) {
                out.push(TargetBinding {
                    target: rule.target.clone(),
                    path: rule.path_prefix.clone(),
                });
            }
        }
        out.sort_by(|a, b| (a.target.to_string(), &a.path).cmp(&(b.target.to_string(), &b.path)));
        out.dedup();
        out
    }

    /// All distinct `(GVR, scope)` pairs any active rule requires, used by
    /// the Watch Manager's `ComputeDesired`.
    pub fn required_gvrs(&self) -> Vec<(String, String, Scope)> {
        let snapshot = self.snapshot.load();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for rules in snapshot.by_source.values() {
            for rule in rules {
                for group in &rule.api_groups {
                    for resource in &rule.resources {
                        let key = (group.clone(), resource.clone(), rule.scope);
                        if seen.insert(key.clone()) {
                            out.push(key);
                        }
                    }
                }
            }
        }
        out
    }

    /// Distinct `(group, resource, namespace)` informer requirements, where
    /// `namespace` is `None` for a cluster-wide watch (any `ClusterWatchRule`
    /// contribution, or a wildcard resource) and `Some(ns)` for a `WatchRule`
    /// that only needs its own namespace. Feeds the Watch Manager's
    /// `ComputeDesired` (§4.5): a GVR needed both cluster-wide and by one
    /// namespace collapses to the cluster-wide informer alone.
    pub fn required_scopes(&self) -> Vec<(String, String, Option<String>)> {
        let snapshot = self.snapshot.load();
        let mut wants_cluster_wide: HashMap<(String, String), bool> = HashMap::new();
        let mut namespaces_wanted: HashMap<(String, String), std::collections::HashSet<String>> =
            HashMap::new();
        for rules in snapshot.by_source.values() {
            for rule in rules {
                for group in &rule.api_groups {
                    for resource in &rule.resources {
                        let key = (group.clone(), resource.clone());
                        match rule.scope {
                            Scope::Cluster => {
                                wants_cluster_wide.insert(key, true);
                            }
                            Scope::Namespaced => {
                                if let Some(ns) = &rule.namespace {
                                    namespaces_wanted.entry(key).or_default().insert(ns.clone());
                                } else {
                                    wants_cluster_wide.insert(key, true);
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut out = Vec::new();
        for (key, _) in &wants_cluster_wide {
            out.push((key.0.clone(), key.1.clone(), None));
        }
        for (key, namespaces) in namespaces_wanted {
            if wants_cluster_wide.contains_key(&key) {
                continue;
            }
            for ns in namespaces {
                out.push((key.0.clone(), key.1.clone(), Some(ns)));
            }
        }
        out
    }

    pub fn rules_for_source(&self, source: &RuleSourceKey) -> Vec<Arc<CompiledRule>> {
        self.snapshot
            .load()
            .by_source
            .get(source)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(target: &str, resources: Vec<&str>, groups: Vec<&str>) -> CompiledRule {
        CompiledRule {
            source: RuleSourceKey {
                kind: RuleSourceKind::WatchRule,
                namespace: "default".into(),
                name: "r".into(),
            },
            target: TargetRef::new("default", target),
            path_prefix: "apps".into(),
            operations: vec![],
            api_groups: groups.into_iter().map(String::from).collect(),
            api_versions: vec![],
            resources: resources.into_iter().map(String::from).collect(),
            scope: Scope::Namespaced,
            namespace: None,
            object_selector: None,
            namespace_selector: None,
        }
    }

    #[test]
    fn matches_concrete_gvr() {
        let store = RuleStore::new();
        store.replace_for_source(
            RuleSourceKey {
                kind: RuleSourceKind::WatchRule,
                namespace: "default".into(),
                name: "r".into(),
            },
            vec![rule("t", vec!["configmaps"], vec![""])],
        );
        let id = ResourceIdentifier::new("", "v1", "configmaps", "default", "my-config");
        let bindings = store.match_event(&id, Operation::Create, None, None);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].target, TargetRef::new("default", "t"));
    }

    #[test]
    fn wildcard_resource_matches_any() {
        let store = RuleStore::new();
        store.replace_for_source(
            RuleSourceKey {
                kind: RuleSourceKind::ClusterWatchRule,
                namespace: String::new(),
                name: "cw".into(),
            },
            vec![CompiledRule {
                scope: Scope::Cluster,
                ..rule("t", vec!["*"], vec!["example.com"])
            }],
        );
        let id = ResourceIdentifier::new("example.com", "v1", "widgets", "", "thing");
        let bindings = store.match_event(&id, Operation::Create, None, None);
        assert_eq!(bindings.len(), 1);
    }

    #[test]
    fn overlapping_bindings_both_survive_one_deletion() {
        let store = RuleStore::new();
        let source_a = RuleSourceKey {
            kind: RuleSourceKind::WatchRule,
            namespace: "default".into(),
            name: "a".into(),
        };
        let source_b = RuleSourceKey {
            kind: RuleSourceKind::WatchRule,
            namespace: "default".into(),
            name: "b".into(),
        };
        store.replace_for_source(source_a.clone(), vec![rule("t", vec!["configmaps"], vec![""])]);
        store.replace_for_source(source_b, vec![rule("t", vec!["configmaps"], vec![""])]);
        let id = ResourceIdentifier::new("", "v1", "configmaps", "default", "c");
        assert_eq!(store.match_event(&id, Operation::Create, None, None).len(), 1);
        store.remove_source(&source_a);
        assert_eq!(store.match_event(&id, Operation::Create, None, None).len(), 1);
    }

    #[test]
    fn remove_source_clears_its_contribution_only() {
        let store = RuleStore::new();
        let source_a = RuleSourceKey {
            kind: RuleSourceKind::WatchRule,
            namespace: "default".into(),
            name: "a".into(),
        };
        store.replace_for_source(source_a.clone(), vec![rule("t", vec!["configmaps"], vec![""])]);
        store.remove_source(&source_a);
        let id = ResourceIdentifier::new("", "v1", "configmaps", "default", "c");
        assert!(store.match_event(&id, Operation::Create, None, None).is_empty());
    }
}
