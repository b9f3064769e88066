use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::git_provider::SecretReference;

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct ProviderReference {
    pub name: String,
    /// Defaults to the `GitTarget`'s own namespace when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// `GitTarget.spec.encryption` — scoped per-target (not per-provider)
/// because one repository may serve multiple environments with different
/// keys (§9). `provider` is currently always `"sops"`, backed by the `rops`
/// crate rather than shelling out to the `sops` binary.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct EncryptionConfig {
    pub provider: String,
    pub secret_ref: SecretReference,
    /// Automatic key material generation is a non-goal; this flag only
    /// controls whether `EnsurePathBootstrapped` treats a missing key
    /// `Secret` as `MissingSecret` (false) or `SecretCreateDisabled` (true,
    /// documenting the explicit refusal rather than silently generating one).
    #[serde(default)]
    pub generate_when_missing: bool,
}

/// Binding of a `GitProvider` to a branch, subfolder path, and encryption
/// configuration — the only CRD carrying a cross-kind reference (§9).
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gitops.configbutler.io",
    version = "v1alpha1",
    kind = "GitTarget",
    plural = "gittargets",
    namespaced,
    status = "GitTargetStatus",
    shortname = "gt"
)]
pub struct GitTargetSpec {
    pub provider_ref: ProviderReference,
    /// Subfolder under the repository root this target owns exclusively
    /// among targets sharing the same worker; normalized (no leading/
    /// trailing slash) before use.
    pub path: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct GitTargetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// Bootstrap ledger (§3): a normalized path appears here only after a
    /// successful bootstrap commit+push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrapped_paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl GitTarget {
    /// Normalized path: no leading or trailing `/`.
    pub fn normalized_path(&self) -> String {
        self.spec.path.trim_matches('/').to_string()
    }

    pub fn provider_namespace(&self, own_namespace: &str) -> String {
        self.spec
            .provider_ref
            .namespace
            .clone()
            .unwrap_or_else(|| own_namespace.to_string())
    }

    pub fn is_bootstrapped(&self, path: &str) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.bootstrapped_paths.as_ref())
            .is_some_and(|paths| paths.iter().any(|p| p == path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_leading_and_trailing_slashes() {
        let mut target = GitTarget::new(
            "t",
            GitTargetSpec {
                provider_ref: ProviderReference {
                    name: "p".into(),
                    namespace: None,
                },
                path: "/apps/".into(),
                branch: "main".into(),
                encryption: None,
            },
        );
        target.metadata.namespace = Some("default".into());
        assert_eq!(target.normalized_path(), "apps");
    }

    #[test]
    fn provider_namespace_defaults_to_own() {
        let mut target = GitTarget::new(
            "t",
            GitTargetSpec {
                provider_ref: ProviderReference {
                    name: "p".into(),
                    namespace: None,
                },
                path: "apps".into(),
                branch: "main".into(),
                encryption: None,
            },
        );
        target.metadata.namespace = Some("default".into());
        assert_eq!(target.provider_namespace("default"), "default");
    }
}
