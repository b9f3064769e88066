use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct TargetReference {
    pub name: String,
    /// Defaults to the rule's own namespace when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// One selector entry within `WatchRule.spec.rules` / `ClusterWatchRule.spec.rules`.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct RuleSpec {
    /// `CREATE` / `UPDATE` / `DELETE`; empty means "all operations".
    #[serde(default)]
    pub operations: Vec<String>,
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub api_versions: Vec<String>,
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<LabelSelector>,
}

/// Namespace-scoped selector for resources whose state should be mirrored.
/// Home namespace is implied: a `WatchRule` watches its own namespace only.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gitops.configbutler.io",
    version = "v1alpha1",
    kind = "WatchRule",
    plural = "watchrules",
    namespaced,
    status = "WatchRuleStatus",
    shortname = "wr"
)]
pub struct WatchRuleSpec {
    pub target_ref: TargetReference,
    pub rules: Vec<RuleSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct WatchRuleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
