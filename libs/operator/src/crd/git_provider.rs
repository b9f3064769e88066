use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a `Secret` holding repository credentials (SSH key or HTTPS
/// token), read once per `BranchWorker` registration.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    pub name: String,
    /// Defaults to the referencing object's own namespace when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Declarative binding to a Git remote and its credentials. Value-only by
/// design (§9, "Cyclic references"): `GitProvider` never references a
/// `GitTarget` back, so only `GitTarget` carries cross-kind references.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gitops.configbutler.io",
    version = "v1alpha1",
    kind = "GitProvider",
    plural = "gitproviders",
    namespaced,
    status = "GitProviderStatus",
    shortname = "gp"
)]
pub struct GitProviderSpec {
    /// SSH or HTTPS remote URL, e.g. `git@github.com:org/repo.git`.
    pub repo_url: String,
    /// Branches `GitTarget`s under this provider may write to. `None`
    /// permits any branch; entries are matched literally (no glob) to keep
    /// the validation gate (`BranchNotAllowed`) simple and auditable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_branches: Option<Vec<String>>,
    pub secret_ref: SecretReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct GitProviderStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl GitProvider {
    pub fn allows_branch(&self, branch: &str) -> bool {
        self.spec
            .allowed_branches
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|b| b == branch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(allowed: Option<Vec<&str>>) -> GitProvider {
        GitProvider::new(
            "repo",
            GitProviderSpec {
                repo_url: "git@example.com:org/repo.git".into(),
                allowed_branches: allowed.map(|v| v.into_iter().map(String::from).collect()),
                secret_ref: SecretReference {
                    name: "creds".into(),
                    namespace: None,
                },
            },
        )
    }

    #[test]
    fn no_allowlist_permits_any_branch() {
        assert!(provider(None).allows_branch("main"));
    }

    #[test]
    fn allowlist_rejects_unlisted_branch() {
        let p = provider(Some(vec!["main", "release"]));
        assert!(p.allows_branch("main"));
        assert!(!p.allows_branch("experimental"));
    }
}
