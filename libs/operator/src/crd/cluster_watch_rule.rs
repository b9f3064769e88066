use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::watch_rule::{RuleSpec, TargetReference};

/// Cluster-wide variant of `RuleSpec`: adds the explicit `scope` and an
/// optional `namespaceSelector` narrowing which namespaces a `Namespaced`
/// rule applies to (an empty selector means "all namespaces").
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct ClusterRuleSpec {
    #[serde(flatten)]
    pub base: RuleSpec,
    /// `Cluster` or `Namespaced`.
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gitops.configbutler.io",
    version = "v1alpha1",
    kind = "ClusterWatchRule",
    plural = "clusterwatchrules",
    status = "ClusterWatchRuleStatus",
    shortname = "cwr"
)]
pub struct ClusterWatchRuleSpec {
    pub target_ref: TargetReference,
    pub rules: Vec<ClusterRuleSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ClusterWatchRuleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
