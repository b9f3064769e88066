//! Custom resource definitions consumed by this operator: `GitProvider`,
//! `GitTarget`, `WatchRule`, `ClusterWatchRule`. Each derives `CustomResource`
//! + `JsonSchema` the way the teacher's `Echo` CRD does; `kubectl apply -f -`
//! against the output of a `crdgen`-style binary installs them.

pub mod cluster_watch_rule;
pub mod git_provider;
pub mod git_target;
pub mod watch_rule;

pub use cluster_watch_rule::{ClusterRuleSpec, ClusterWatchRule, ClusterWatchRuleSpec, ClusterWatchRuleStatus};
pub use git_provider::{GitProvider, GitProviderSpec, GitProviderStatus, SecretReference};
pub use git_target::{EncryptionConfig, GitTarget, GitTargetSpec, GitTargetStatus, ProviderReference};
pub use watch_rule::{RuleSpec, TargetReference, WatchRule, WatchRuleSpec, WatchRuleStatus};
