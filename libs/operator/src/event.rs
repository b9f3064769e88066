use std::collections::HashSet;
use std::sync::Arc;

use crate::identifier::ResourceIdentifier;

use kube::api::DynamicObject;
use sha2::{Digest, Sha256};

/// Admission/informer operation kind carried alongside every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reference to the `GitTarget` a compiled rule binds to, plus the path
/// prefix the rule contributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetRef {
    pub namespace: String,
    pub name: String,
}

impl TargetRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Kubernetes user identity, attached from admission review attribution or
/// falling back to a system identity when correlation misses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserInfo {
    pub username: String,
}

impl UserInfo {
    pub const SYSTEM: &'static str = "gitops-reverser";

    pub fn system() -> Self {
        Self {
            username: Self::SYSTEM.to_string(),
        }
    }
}

/// One seed sweep's observed-identifier set (§4.9.3's `S_live`), scoped to
/// the single `(group, resource)` the sweep actually listed. A file under a
/// target's path whose inferred identifier falls in this `(group, resource)`
/// and is absent from `observed` is known-gone from the cluster, regardless
/// of whether a selector-less rule would still structurally match it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedSnapshot {
    pub group: String,
    pub resource: String,
    pub observed: HashSet<ResourceIdentifier>,
}

/// Control events carry no object and are addressed by target ref only.
#[derive(Debug, Clone)]
pub enum ControlKind {
    SeedSync(Arc<SeedSnapshot>),
}

#[derive(Debug, Clone)]
pub enum EventBody {
    Resource {
        object: Option<DynamicObject>,
        identifier: ResourceIdentifier,
        operation: Operation,
        user_info: UserInfo,
        /// Canonical sanitized YAML, precomputed at ingestion (C4/C5) so C8
        /// never re-serializes the object just to dedup it. `None` for
        /// DELETE, since DELETE hashes on the identifier alone.
        sanitized: Option<String>,
    },
    Control(ControlKind),
}

/// One unit of work flowing C5/C4 -> C7 -> C8 -> C9.
///
/// `object` is `None` for DELETE and for control events. The hash used for
/// dedup/content-addressing is `SHA256(operation ":" canonical-sanitized-yaml)`
/// for resource events carrying an object, and `SHA256(operation ":" identifier)`
/// for DELETE.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub body: EventBody,
    pub target: TargetRef,
    pub path: String,
}

impl StreamEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn resource(
        object: Option<DynamicObject>,
        identifier: ResourceIdentifier,
        operation: Operation,
        user_info: UserInfo,
        target: TargetRef,
        path: String,
        sanitized: Option<String>,
    ) -> Self {
        Self {
            body: EventBody::Resource {
                object,
                identifier,
                operation,
                user_info,
                sanitized,
            },
            target,
            path,
        }
    }

    pub fn control(kind: ControlKind, target: TargetRef, path: String) -> Self {
        Self {
            body: EventBody::Control(kind),
            target,
            path,
        }
    }

    pub fn identifier(&self) -> Option<&ResourceIdentifier> {
        match &self.body {
            EventBody::Resource { identifier, .. } => Some(identifier),
            EventBody::Control(_) => None,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self.body, EventBody::Control(_))
    }

    /// `SHA256(operation ":" canonical-sanitized-yaml)` for CREATE/UPDATE,
    /// `SHA256(operation ":" identifier)` for DELETE. `None` for control
    /// events, which carry no identifier to dedup on.
    pub fn hash(&self) -> Option<String> {
        match &self.body {
            EventBody::Resource {
                operation,
                identifier,
                sanitized,
                ..
            } => {
                let mut hasher = Sha256::new();
                match operation {
                    Operation::Delete => {
                        hasher.update(operation.as_str().as_bytes());
                        hasher.update(b":");
                        hasher.update(identifier.to_string().as_bytes());
                    }
                    _ => {
                        hasher.update(operation.as_str().as_bytes());
                        hasher.update(b":");
                        hasher.update(sanitized.as_deref().unwrap_or_default().as_bytes());
                    }
                }
                Some(hex::encode(hasher.finalize()))
            }
            EventBody::Control(_) => None,
        }
    }
}

/// Unique owner key for a `BranchWorker`: a `GitTarget` resolves to one
/// worker per (provider, branch) pair; distinct `path` values share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub provider_namespace: String,
    pub provider_name: String,
    pub branch: String,
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.provider_namespace, self.provider_name, self.branch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_hash_ignores_sanitized_field() {
        let id = ResourceIdentifier::new("", "v1", "configmaps", "default", "c");
        let with_sanitized = StreamEvent::resource(
            None,
            id.clone(),
            Operation::Delete,
            UserInfo::system(),
            TargetRef::new("default", "t"),
            "apps".to_string(),
            Some("ignored, should not matter".to_string()),
        );
        let without_sanitized = StreamEvent::resource(
            None,
            id,
            Operation::Delete,
            UserInfo::system(),
            TargetRef::new("default", "t"),
            "apps".to_string(),
            None,
        );
        assert_eq!(with_sanitized.hash(), without_sanitized.hash());
    }

    #[test]
    fn update_hash_depends_on_sanitized_content() {
        let id = ResourceIdentifier::new("", "v1", "configmaps", "default", "c");
        let event = StreamEvent::resource(
            None,
            id.clone(),
            Operation::Update,
            UserInfo::system(),
            TargetRef::new("default", "t"),
            "apps".to_string(),
            Some("data: {k: v}".to_string()),
        );
        let event2 = StreamEvent::resource(
            None,
            id,
            Operation::Update,
            UserInfo::system(),
            TargetRef::new("default", "t"),
            "apps".to_string(),
            Some("data: {k: v2}".to_string()),
        );
        assert_ne!(event.hash(), event2.hash());
    }
}
