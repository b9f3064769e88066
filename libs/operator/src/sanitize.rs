use crate::error::Error;
use crate::identifier::ResourceIdentifier;

use kube::api::DynamicObject;
use serde_yaml::{Mapping, Value};

/// Annotations stripped from every object in addition to the always-removed
/// server-managed metadata fields.
pub const DEFAULT_ANNOTATION_DENYLIST: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
];

const METADATA_DENYLIST: &[&str] = &[
    "managedFields",
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "selfLink",
];

/// Deterministic reduction of a Kubernetes object to the subset of it that
/// reflects user intent, emitted as canonical (key-sorted) YAML.
///
/// Removes `status`, the server-managed `metadata` fields, and any
/// annotation in `annotation_denylist`. Keys are emitted in a stable total
/// order so byte-identical inputs yield byte-identical outputs — this is the
/// "determinism" invariant in §8 of the spec and the cheapest possible
/// defence against dedup false-negatives from key reordering.
pub fn sanitize(object: &DynamicObject, annotation_denylist: &[String]) -> Result<String, Error> {
    let mut value = serde_yaml::to_value(object)
        .map_err(|e| Error::InvalidObject(format!("could not convert object to yaml: {e}")))?;

    if let Value::Mapping(ref mut root) = value {
        root.remove(Value::String("status".to_string()));

        if let Some(Value::Mapping(metadata)) = root.get_mut(Value::String("metadata".to_string()))
        {
            for field in METADATA_DENYLIST {
                metadata.remove(Value::String((*field).to_string()));
            }
            strip_annotations(metadata, annotation_denylist);
        }
    } else {
        return Err(Error::InvalidObject(
            "object did not serialize to a YAML mapping".to_string(),
        ));
    }

    let ordered = canonical_order(value);
    serde_yaml::to_string(&ordered).map_err(Error::SerializationError)
}

fn strip_annotations(metadata: &mut Mapping, denylist: &[String]) {
    let Some(Value::Mapping(annotations)) =
        metadata.get_mut(Value::String("annotations".to_string()))
    else {
        return;
    };
    for key in denylist {
        annotations.remove(Value::String(key.clone()));
    }
    if annotations.is_empty() {
        metadata.remove(Value::String("annotations".to_string()));
    }
}

/// Recursively rebuild every mapping with lexicographically sorted keys, so
/// that the textual YAML form is stable regardless of insertion/wire order.
fn canonical_order(value: Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut entries: Vec<(Value, Value)> = map
                .into_iter()
                .map(|(k, v)| (k, canonical_order(v)))
                .collect();
            entries.sort_by(|(a, _), (b, _)| {
                let a = serde_yaml::to_string(a).unwrap_or_default();
                let b = serde_yaml::to_string(b).unwrap_or_default();
                a.cmp(&b)
            });
            Value::Mapping(Mapping::from_iter(entries))
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(canonical_order).collect()),
        other => other,
    }
}

/// True iff the resource is a core `Secret` (or a configurable extra set),
/// used to route writes through the encryption pipeline.
pub fn is_secret_semantics(id: &ResourceIdentifier, extra_resources: &[(String, String)]) -> bool {
    let is_core_secret = id.group.is_empty() && id.resource == "secrets";
    is_core_secret
        || extra_resources
            .iter()
            .any(|(group, resource)| group == &id.group && resource == &id.resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::{ObjectMeta, TypeMeta};
    use serde_json::json;

    fn configmap(annotations: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some("my-config".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("12345".to_string()),
                uid: Some("abc-123".to_string()),
                annotations: serde_json::from_value(annotations).unwrap(),
                ..Default::default()
            },
            data: json!({"data": {"k": "v"}}),
        }
    }

    #[test]
    fn strips_server_managed_fields() {
        let obj = configmap(json!({}));
        let out = sanitize(&obj, &[]).unwrap();
        assert!(!out.contains("resourceVersion"));
        assert!(!out.contains("uid"));
    }

    #[test]
    fn strips_denylisted_annotations_but_keeps_others() {
        let obj = configmap(json!({
            "kubectl.kubernetes.io/last-applied-configuration": "{}",
            "team": "payments",
        }));
        let denylist: Vec<String> = DEFAULT_ANNOTATION_DENYLIST
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = sanitize(&obj, &denylist).unwrap();
        assert!(!out.contains("last-applied-configuration"));
        assert!(out.contains("team"));
    }

    #[test]
    fn deterministic_across_runs() {
        let obj = configmap(json!({"b": "1", "a": "2"}));
        let first = sanitize(&obj, &[]).unwrap();
        let second = sanitize(&obj, &[]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn secret_semantics_matches_core_secrets_only() {
        let secret = ResourceIdentifier::new("", "v1", "secrets", "default", "s");
        let configmap = ResourceIdentifier::new("", "v1", "configmaps", "default", "c");
        assert!(is_secret_semantics(&secret, &[]));
        assert!(!is_secret_semantics(&configmap, &[]));
    }
}
