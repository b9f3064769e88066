//! Orphan reconciliation (§4.9.3), triggered by a `SEED_SYNC` control event:
//! walk the files a target already owns under one rule's `path`, and for any
//! file whose resource no longer matches an active binding for that same
//! `(target, path)`, synthesize a DELETE so the branch worker's normal batch
//! pipeline removes it.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::event::{ControlKind, Operation, SeedSnapshot, StreamEvent, TargetRef, UserInfo};
use crate::identifier::ResourceIdentifier;
use crate::rules::RuleStore;

/// Recursively lists `*.yaml` files under `root`, returning paths relative
/// to `root`.
fn list_yaml_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "yaml") {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_path_buf());
                }
            }
        }
    }
    out
}

/// Tries both the namespaced and cluster-scoped segmentations of a relative
/// path and keeps whichever `(group, resource)` pair a currently-active rule
/// still requires. Ambiguity only arises for the empty (core) group, since a
/// named group's segment count disambiguates on its own.
fn infer_identifier(rel_path: &Path, rule_store: &RuleStore) -> Option<ResourceIdentifier> {
    let segments: Vec<String> = rel_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let required: std::collections::HashSet<(String, String)> = rule_store
        .required_gvrs()
        .into_iter()
        .map(|(group, resource, _scope)| (group, resource))
        .collect();

    let strip_yaml = |s: &str| s.strip_suffix(".yaml").unwrap_or(s).to_string();

    match segments.as_slice() {
        [version, resource, namespace, name] => {
            let name = strip_yaml(name);
            if required.contains(&(String::new(), resource.clone())) {
                Some(ResourceIdentifier::new("", version.clone(), resource.clone(), namespace.clone(), name))
            } else {
                None
            }
        }
        [version, resource, name] => {
            let name = strip_yaml(name);
            Some(ResourceIdentifier::new("", version.clone(), resource.clone(), "", name))
        }
        [group, version, resource, namespace, name] => {
            let name = strip_yaml(name);
            Some(ResourceIdentifier::new(
                group.clone(),
                version.clone(),
                resource.clone(),
                namespace.clone(),
                name,
            ))
        }
        [group, version, resource, name] => {
            let name = strip_yaml(name);
            Some(ResourceIdentifier::new(group.clone(), version.clone(), resource.clone(), "", name))
        }
        _ => None,
    }
}

fn delete_event(id: ResourceIdentifier, target: &TargetRef, path_prefix: &str) -> StreamEvent {
    StreamEvent::resource(
        None,
        id,
        Operation::Delete,
        UserInfo::system(),
        target.clone(),
        path_prefix.to_string(),
        None,
    )
}

/// Scans the working tree under `path_prefix` and returns synthetic DELETE
/// events for every file that's an orphan per §4.9.3 / the glossary: "not
/// present in `S_live`, and not matched by any active binding for this
/// target". `snapshot` is this seed's `S_live`, scoped to the one
/// `(group, resource)` it actually listed — so it only settles the question
/// decisively for files of that same resource kind; everything else under
/// `path_prefix` (bound by a different rule's GVR) falls back to the
/// rule-match check alone, since this round observed nothing live for it.
pub fn find_orphans(
    workdir: &Path,
    path_prefix: &str,
    target: &TargetRef,
    rule_store: &RuleStore,
    snapshot: &SeedSnapshot,
) -> Vec<StreamEvent> {
    let root = workdir.join(path_prefix);
    if !root.is_dir() {
        return Vec::new();
    }
    let mut orphans = Vec::new();
    for rel_path in list_yaml_files(&root) {
        let Some(id) = infer_identifier(&rel_path, rule_store) else {
            continue;
        };

        let in_seeded_gvr = id.group == snapshot.group && id.resource == snapshot.resource;
        if in_seeded_gvr {
            if snapshot.observed.contains(&id) {
                continue;
            }
            // Absent from this seed's S_live: the object is gone from the
            // cluster. A still-active selector-less rule would otherwise
            // structurally match a None object unconditionally and keep
            // the stale file forever; S_live is the backstop for exactly
            // that case.
            debug!(%id, path = path_prefix, "orphan file absent from this seed's S_live");
            orphans.push(delete_event(id, target, path_prefix));
            continue;
        }

        let bindings = rule_store.match_event(&id, Operation::Delete, None, None);
        let still_claimed = bindings
            .iter()
            .any(|b| &b.target == target && b.path == path_prefix);
        if !still_claimed {
            debug!(%id, path = path_prefix, "orphan file no longer claimed by any active rule");
            orphans.push(delete_event(id, target, path_prefix));
        }
    }
    orphans
}

/// The seed snapshot carried by a `SEED_SYNC` control event, if this is one.
pub fn seed_snapshot(event: &StreamEvent) -> Option<&SeedSnapshot> {
    match &event.body {
        crate::event::EventBody::Control(ControlKind::SeedSync(snapshot)) => Some(snapshot),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBody;
    use crate::rules::{CompiledRule, RuleSourceKey, RuleSourceKind, Scope};

    fn configmaps_rule(target: &str, path: &str) -> CompiledRule {
        CompiledRule {
            source: RuleSourceKey {
                kind: RuleSourceKind::WatchRule,
                namespace: "default".into(),
                name: "r".into(),
            },
            target: TargetRef::new("default", target),
            path_prefix: path.into(),
            operations: vec![],
            api_groups: vec![String::new()],
            api_versions: vec![],
            resources: vec!["configmaps".into()],
            scope: Scope::Namespaced,
            namespace: None,
            object_selector: None,
            namespace_selector: None,
        }
    }

    fn write_stale_configmap(workdir: &Path) {
        let dir = workdir.join("apps/v1/configmaps/default");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("old-config.yaml"), b"kind: ConfigMap\n").unwrap();
    }

    /// A snapshot for a different `(group, resource)` than the one under
    /// test, so `find_orphans` falls back to the rule-match check alone —
    /// the behavior these tests were written to exercise before S_live
    /// scoping existed.
    fn unrelated_snapshot() -> SeedSnapshot {
        SeedSnapshot {
            group: "apps".into(),
            resource: "deployments".into(),
            observed: Default::default(),
        }
    }

    #[test]
    fn file_with_no_active_binding_for_target_is_orphaned() {
        let dir = tempfile::tempdir().unwrap();
        write_stale_configmap(dir.path());

        let rule_store = RuleStore::new();
        rule_store.replace_for_source(
            RuleSourceKey {
                kind: RuleSourceKind::WatchRule,
                namespace: "default".into(),
                name: "other".into(),
            },
            vec![configmaps_rule("other-target", "other-path")],
        );

        let target = TargetRef::new("default", "my-target");
        let snapshot = unrelated_snapshot();
        let orphans = find_orphans(dir.path(), "apps", &target, &rule_store, &snapshot);
        assert_eq!(orphans.len(), 1);
        let EventBody::Resource { identifier, operation, .. } = &orphans[0].body else {
            panic!("expected a resource event");
        };
        assert_eq!(*operation, Operation::Delete);
        assert_eq!(identifier.resource, "configmaps");
        assert_eq!(identifier.name, "old-config");
    }

    #[test]
    fn file_still_claimed_by_its_own_target_is_not_orphaned() {
        let dir = tempfile::tempdir().unwrap();
        write_stale_configmap(dir.path());

        let rule_store = RuleStore::new();
        rule_store.replace_for_source(
            RuleSourceKey {
                kind: RuleSourceKind::WatchRule,
                namespace: "default".into(),
                name: "mine".into(),
            },
            vec![configmaps_rule("my-target", "apps")],
        );

        let target = TargetRef::new("default", "my-target");
        let snapshot = unrelated_snapshot();
        assert!(find_orphans(dir.path(), "apps", &target, &rule_store, &snapshot).is_empty());
    }

    #[test]
    fn resource_type_no_longer_watched_at_all_is_skipped_not_orphaned() {
        let dir = tempfile::tempdir().unwrap();
        write_stale_configmap(dir.path());

        let rule_store = RuleStore::new();
        let target = TargetRef::new("default", "my-target");
        let snapshot = unrelated_snapshot();
        assert!(find_orphans(dir.path(), "apps", &target, &rule_store, &snapshot).is_empty());
    }

    #[test]
    fn missing_path_prefix_directory_yields_no_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let rule_store = RuleStore::new();
        let target = TargetRef::new("default", "my-target");
        let snapshot = unrelated_snapshot();
        assert!(find_orphans(dir.path(), "apps", &target, &rule_store, &snapshot).is_empty());
    }

    #[test]
    fn file_absent_from_seeded_gvr_snapshot_is_orphaned_even_under_selectorless_rule() {
        let dir = tempfile::tempdir().unwrap();
        write_stale_configmap(dir.path());

        let rule_store = RuleStore::new();
        let target = TargetRef::new("default", "my-target");
        rule_store.replace_for_source(
            RuleSourceKey {
                kind: RuleSourceKind::WatchRule,
                namespace: "default".into(),
                name: "mine".into(),
            },
            vec![configmaps_rule("my-target", "apps")],
        );

        // This round's seed swept ("", "configmaps") and never observed
        // old-config: it's gone from the cluster, even though the
        // selector-less rule above would still structurally match it.
        let snapshot = SeedSnapshot {
            group: String::new(),
            resource: "configmaps".into(),
            observed: Default::default(),
        };
        let orphans = find_orphans(dir.path(), "apps", &target, &rule_store, &snapshot);
        assert_eq!(orphans.len(), 1);
        let EventBody::Resource { identifier, operation, .. } = &orphans[0].body else {
            panic!("expected a resource event");
        };
        assert_eq!(*operation, Operation::Delete);
        assert_eq!(identifier.name, "old-config");
    }

    #[test]
    fn file_present_in_seeded_gvr_snapshot_is_not_orphaned() {
        let dir = tempfile::tempdir().unwrap();
        write_stale_configmap(dir.path());

        let rule_store = RuleStore::new();
        let target = TargetRef::new("default", "my-target");
        rule_store.replace_for_source(
            RuleSourceKey {
                kind: RuleSourceKind::WatchRule,
                namespace: "default".into(),
                name: "mine".into(),
            },
            vec![configmaps_rule("my-target", "apps")],
        );

        let id = infer_identifier(&PathBuf::from("v1/configmaps/default/old-config.yaml"), &rule_store)
            .expect("fixture path must resolve to an identifier");
        let mut observed = std::collections::HashSet::new();
        observed.insert(id);
        let snapshot = SeedSnapshot {
            group: String::new(),
            resource: "configmaps".into(),
            observed,
        };
        assert!(find_orphans(dir.path(), "apps", &target, &rule_store, &snapshot).is_empty());
    }
}
