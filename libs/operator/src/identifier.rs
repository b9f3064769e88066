use std::fmt;

/// Immutable canonical key for a live Kubernetes object.
///
/// Cluster-scoped resources still carry an (empty) `namespace` slot — this is
/// deliberate: the original implementation sometimes dropped the namespace
/// segment from its key, which let a cluster-scoped and a namespaced object
/// of the same name collide. This port always includes the slot (see
/// DESIGN.md, "identifier key includes namespace").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentifier {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentifier {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    /// Relative on-disk path under a `GitTarget`'s path prefix, per §6:
    /// `<group>/<version>/<resource>/<namespace>/<name>.yaml` for namespaced
    /// resources, `<group>/<version>/<resource>/<name>.yaml` for
    /// cluster-scoped ones. The core group is serialized as `v1` with no
    /// leading path segment.
    pub fn relative_path(&self) -> String {
        let group_segment = if self.group.is_empty() {
            String::new()
        } else {
            format!("{}/", self.group)
        };
        if self.cluster_scoped() {
            format!(
                "{}{}/{}/{}.yaml",
                group_segment, self.version, self.resource, self.name
            )
        } else {
            format!(
                "{}{}/{}/{}/{}.yaml",
                group_segment, self.version, self.resource, self.namespace, self.name
            )
        }
    }
}

impl fmt::Display for ResourceIdentifier {
    /// The canonical string key used for dedup, orphan detection, logs and
    /// metrics. Cluster-scoped objects keep an empty-but-present namespace
    /// segment so their key can never collide with a namespaced resource of
    /// the same name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.group, self.version, self.resource, self.namespace, self.name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_empty_namespace_slot() {
        let id = ResourceIdentifier::new("", "v1", "namespaces", "", "default");
        assert_eq!(id.to_string(), "/v1/namespaces//default");
        assert!(id.cluster_scoped());
    }

    #[test]
    fn cluster_scoped_and_namespaced_never_collide() {
        let cluster = ResourceIdentifier::new("rbac.authorization.k8s.io", "v1", "clusterroles", "", "edit");
        let namespaced = ResourceIdentifier::new("rbac.authorization.k8s.io", "v1", "clusterroles", "edit", "edit");
        assert_ne!(cluster.to_string(), namespaced.to_string());
    }

    #[test]
    fn relative_path_core_group_has_no_leading_slash() {
        let id = ResourceIdentifier::new("", "v1", "configmaps", "default", "my-config");
        assert_eq!(id.relative_path(), "v1/configmaps/default/my-config.yaml");
    }

    #[test]
    fn relative_path_named_group_cluster_scoped_omits_namespace_segment() {
        let id = ResourceIdentifier::new("example.com", "v1", "widgets", "", "thing");
        assert_eq!(id.relative_path(), "example.com/v1/widgets/thing.yaml");
    }
}
