//! C6 — Rule Controllers (§4.6): one `kube::runtime::Controller` per CRD
//! kind. `WatchRule`/`ClusterWatchRule` compile into the `RuleStore`;
//! `GitProvider` is validated in place; `GitTarget` drives the full gate
//! pipeline in [`crate::lifecycle`]. All four follow the teacher's
//! `reconcile`/`error_policy`/`Context` shape, generalized to run
//! concurrently and to clean up their `RuleStore`/`WorkerManager`
//! contribution via [`kube::runtime::finalizer`] on delete, which the
//! teacher's single-CRD Echo controller did by hand in a `finalizer`
//! module instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::runtime::Controller;
use kube::{Resource, ResourceExt};
use tracing::{field, info, instrument, warn, Span};

use crate::conditions;
use crate::context::Context;
use crate::crd::{
    ClusterWatchRule, ClusterWatchRuleStatus, GitProvider, GitProviderStatus, GitTarget,
    GitTargetStatus, RuleSpec, WatchRule, WatchRuleStatus,
};
use crate::error::{Error, Result};
use crate::event::{Operation, TargetRef};
use crate::lifecycle;
use crate::rules::{CompiledRule, RuleSourceKey, RuleSourceKind, Scope};
use crate::telemetry;
use crate::worker::TargetId;

const FINALIZER: &str = "gitops.configbutler.io/controller";
const VALIDATED: &str = "Validated";

/// Runs all four CRD controllers concurrently until shutdown. Each gets its
/// own `Controller::new(...).run(...)` stream; `main.rs` spawns this once
/// per process, gated on the leader flag in `RuntimeConfig`.
pub async fn run(client: kube::Client, state: Arc<crate::context::State>) {
    let ctx = state.to_context(client.clone());
    futures::future::join4(
        run_git_providers(client.clone(), ctx.clone()),
        run_git_targets(client.clone(), ctx.clone()),
        run_watch_rules(client.clone(), ctx.clone()),
        run_cluster_watch_rules(client, ctx),
    )
    .await;
}

fn log_and_drain<T>(stream: impl futures::Stream<Item = std::result::Result<T, kube::runtime::controller::Error<Error, kube::runtime::watcher::Error>>>) -> impl futures::Future<Output = ()> {
    stream
        .filter_map(|res| async move {
            if let Err(e) = &res {
                warn!(error = %e, "reconcile failed");
            }
            res.ok()
        })
        .for_each(|_| futures::future::ready(()))
}

// ---------------------------------------------------------------------
// GitProvider: validates its own spec and secret reference. Carries no
// RuleStore contribution, so its finalizer only has bookkeeping to undo in
// principle (none today) — kept for symmetry with the other three kinds and
// as a natural home for future provider-scoped cleanup.
// ---------------------------------------------------------------------

async fn run_git_providers(client: kube::Client, ctx: Arc<Context>) {
    let api = Api::<GitProvider>::all(client);
    log_and_drain(
        Controller::new(api, Config::default())
            .shutdown_on_signal()
            .run(reconcile_git_provider, error_policy::<GitProvider>, ctx),
    )
    .await;
}

#[instrument(skip(ctx, provider), fields(trace_id))]
async fn reconcile_git_provider(provider: Arc<GitProvider>, ctx: Arc<Context>) -> Result<Action> {
    record_trace();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let _timer = ctx.metrics.reconcile.count_and_measure(&telemetry::get_trace_id());

    let api: Api<GitProvider> = Api::namespaced(ctx.client.clone(), &provider.namespace().unwrap_or_default());
    finalizer(&api, FINALIZER, provider, |event| async {
        match event {
            FinalizerEvent::Apply(provider) => apply_git_provider(&provider, &ctx).await,
            FinalizerEvent::Cleanup(_provider) => Ok(Action::await_change()),
        }
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))
}

async fn apply_git_provider(provider: &GitProvider, ctx: &Context) -> Result<Action> {
    let generation = provider.meta().generation.unwrap_or_default();
    let mut status = provider.status.clone().unwrap_or_default();
    let mut conditions = status.conditions.clone().unwrap_or_default();

    let ns = provider
        .spec
        .secret_ref
        .namespace
        .clone()
        .or_else(|| provider.namespace())
        .unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    let result = if provider.spec.repo_url.trim().is_empty() {
        Err("spec.repoUrl must not be empty".to_string())
    } else {
        secrets
            .get(&provider.spec.secret_ref.name)
            .await
            .map(|_| ())
            .map_err(|e| format!("secret {ns}/{} not found: {e}", provider.spec.secret_ref.name))
    };

    match result {
        Ok(()) => conditions::upsert(&mut conditions, VALIDATED, conditions::STATUS_TRUE, "ReferencesResolved", "repoUrl and secretRef are valid", generation),
        Err(reason) => conditions::upsert(&mut conditions, VALIDATED, conditions::STATUS_FALSE, "InvalidReference", &reason, generation),
    }
    status.conditions = Some(conditions);
    status.observed_generation = Some(generation);
    patch_status(&ctx.client, provider, status).await?;
    Ok(Action::requeue(Duration::from_secs(5 * 60)))
}

async fn patch_status(client: &kube::Client, provider: &GitProvider, status: GitProviderStatus) -> Result<()> {
    let api: Api<GitProvider> = Api::namespaced(client.clone(), &provider.namespace().unwrap_or_default());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&provider.name_any(), &kube::api::PatchParams::apply("gitops-reverser"), &kube::api::Patch::Merge(&patch))
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------
// GitTarget: drives the full Validated -> ... -> Ready gate pipeline in
// `lifecycle::run_gates`, then unregisters its worker/router entries on
// delete so a removed target stops consuming a shared BranchWorker.
// ---------------------------------------------------------------------

async fn run_git_targets(client: kube::Client, ctx: Arc<Context>) {
    let api = Api::<GitTarget>::all(client);
    log_and_drain(
        Controller::new(api, Config::default())
            .shutdown_on_signal()
            .run(reconcile_git_target, error_policy::<GitTarget>, ctx),
    )
    .await;
}

#[instrument(skip(ctx, target), fields(trace_id))]
async fn reconcile_git_target(target: Arc<GitTarget>, ctx: Arc<Context>) -> Result<Action> {
    record_trace();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let _timer = ctx.metrics.reconcile.count_and_measure(&telemetry::get_trace_id());

    let api: Api<GitTarget> = Api::namespaced(ctx.client.clone(), &target.namespace().unwrap_or_default());
    finalizer(&api, FINALIZER, target, |event| async {
        match event {
            FinalizerEvent::Apply(target) => apply_git_target(&target, &ctx).await,
            FinalizerEvent::Cleanup(target) => cleanup_git_target(&target, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))
}

async fn apply_git_target(target: &GitTarget, ctx: &Context) -> Result<Action> {
    let mut status = target.status.clone().unwrap_or_default();
    match lifecycle::run_gates(target, ctx, &mut status).await {
        Ok(true) => lifecycle::log_ready(target),
        Ok(false) => lifecycle::log_unready(target),
        Err(e) => {
            warn!(target = %target.name_any(), error = %e, "gate pipeline error");
        }
    }
    patch_target_status(&ctx.client, target, status).await?;
    Ok(Action::requeue(Duration::from_secs(30)))
}

async fn cleanup_git_target(target: &GitTarget, ctx: &Context) -> Result<Action> {
    let target_ref = TargetRef::new(target.namespace().unwrap_or_default(), target.name_any());
    ctx.router.unregister_target(&target_ref).await;

    let provider_ns = target.provider_namespace(&target.namespace().unwrap_or_default());
    let providers: Api<GitProvider> = Api::namespaced(ctx.client.clone(), &provider_ns);
    if let Ok(provider) = providers.get(&target.spec.provider_ref.name).await {
        let worker_key = crate::event::WorkerKey {
            provider_namespace: provider.namespace().unwrap_or_default(),
            provider_name: provider.name_any(),
            branch: target.spec.branch.clone(),
        };
        let target_id = TargetId {
            namespace: target.namespace().unwrap_or_default(),
            name: target.name_any(),
        };
        ctx.worker_manager.unregister(&worker_key, &target_id).await;
    }
    info!(target = %target.name_any(), "GitTarget deleted, worker/router entries released");
    Ok(Action::await_change())
}

async fn patch_target_status(client: &kube::Client, target: &GitTarget, status: GitTargetStatus) -> Result<()> {
    let api: Api<GitTarget> = Api::namespaced(client.clone(), &target.namespace().unwrap_or_default());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&target.name_any(), &kube::api::PatchParams::apply("gitops-reverser"), &kube::api::Patch::Merge(&patch))
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------
// WatchRule / ClusterWatchRule: compile into `CompiledRule`s bound to the
// referenced `GitTarget`'s current `path`, and push them into the
// `RuleStore` under this source's key. The Watch Manager picks up the
// resulting `required_scopes()` change on its own periodic tick (§4.5), so
// no direct signal to `WatchManager` is needed here.
// ---------------------------------------------------------------------

async fn run_watch_rules(client: kube::Client, ctx: Arc<Context>) {
    let api = Api::<WatchRule>::all(client);
    log_and_drain(
        Controller::new(api, Config::default())
            .shutdown_on_signal()
            .run(reconcile_watch_rule, error_policy::<WatchRule>, ctx),
    )
    .await;
}

#[instrument(skip(ctx, rule), fields(trace_id))]
async fn reconcile_watch_rule(rule: Arc<WatchRule>, ctx: Arc<Context>) -> Result<Action> {
    record_trace();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let _timer = ctx.metrics.reconcile.count_and_measure(&telemetry::get_trace_id());

    let api: Api<WatchRule> = Api::namespaced(ctx.client.clone(), &rule.namespace().unwrap_or_default());
    finalizer(&api, FINALIZER, rule, |event| async {
        match event {
            FinalizerEvent::Apply(rule) => apply_watch_rule(&rule, &ctx).await,
            FinalizerEvent::Cleanup(rule) => {
                let source = source_key_for_watch_rule(&rule);
                ctx.rule_store.remove_source(&source);
                ctx.rule_store.mark_deferred(source, false);
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))
}

fn source_key_for_watch_rule(rule: &WatchRule) -> RuleSourceKey {
    RuleSourceKey {
        kind: RuleSourceKind::WatchRule,
        namespace: rule.namespace().unwrap_or_default(),
        name: rule.name_any(),
    }
}

async fn apply_watch_rule(rule: &WatchRule, ctx: &Context) -> Result<Action> {
    let own_namespace = rule.namespace().unwrap_or_default();
    let source = source_key_for_watch_rule(rule);
    let generation = rule.meta().generation.unwrap_or_default();
    let mut status = rule.status.clone().unwrap_or_default();
    let mut conditions = status.conditions.clone().unwrap_or_default();

    let target_namespace = rule.spec.target_ref.namespace.clone().unwrap_or_else(|| own_namespace.clone());
    let target_ref = TargetRef::new(target_namespace.clone(), rule.spec.target_ref.name.clone());

    let path = match fetch_target_path(&ctx.client, &target_namespace, &rule.spec.target_ref.name).await {
        Ok(path) => path,
        Err(reason) => {
            conditions::upsert(&mut conditions, VALIDATED, conditions::STATUS_FALSE, "TargetNotFound", &reason, generation);
            status.conditions = Some(conditions);
            status.observed_generation = Some(generation);
            patch_watch_rule_status(&ctx.client, rule, status).await?;
            return Ok(Action::requeue(Duration::from_secs(30)));
        }
    };

    let mut has_wildcard = false;
    let compiled: Vec<CompiledRule> = rule
        .spec
        .rules
        .iter()
        .map(|r| {
            let compiled = compile_rule_spec(r, source.clone(), target_ref.clone(), path.clone(), Scope::Namespaced, Some(own_namespace.clone()), None);
            has_wildcard |= compiled.resources.iter().any(|x| x == "*") || compiled.api_groups.iter().any(|x| x == "*");
            compiled
        })
        .collect();

    ctx.rule_store.replace_for_source(source.clone(), compiled);
    ctx.rule_store.mark_deferred(source, has_wildcard);

    if has_wildcard {
        conditions::upsert(&mut conditions, VALIDATED, conditions::STATUS_TRUE, "DeferredWildcard", "one or more rules use a wildcard group/resource not yet discoverable; matching continues once the Watch Manager discovers it", generation);
    } else {
        conditions::upsert(&mut conditions, VALIDATED, conditions::STATUS_TRUE, "Compiled", "rules compiled into the rule store", generation);
    }
    status.conditions = Some(conditions);
    status.observed_generation = Some(generation);
    patch_watch_rule_status(&ctx.client, rule, status).await?;
    Ok(Action::requeue(Duration::from_secs(5 * 60)))
}

async fn patch_watch_rule_status(client: &kube::Client, rule: &WatchRule, status: WatchRuleStatus) -> Result<()> {
    let api: Api<WatchRule> = Api::namespaced(client.clone(), &rule.namespace().unwrap_or_default());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&rule.name_any(), &kube::api::PatchParams::apply("gitops-reverser"), &kube::api::Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn run_cluster_watch_rules(client: kube::Client, ctx: Arc<Context>) {
    let api = Api::<ClusterWatchRule>::all(client);
    log_and_drain(
        Controller::new(api, Config::default())
            .shutdown_on_signal()
            .run(reconcile_cluster_watch_rule, error_policy::<ClusterWatchRule>, ctx),
    )
    .await;
}

#[instrument(skip(ctx, rule), fields(trace_id))]
async fn reconcile_cluster_watch_rule(rule: Arc<ClusterWatchRule>, ctx: Arc<Context>) -> Result<Action> {
    record_trace();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let _timer = ctx.metrics.reconcile.count_and_measure(&telemetry::get_trace_id());

    let api: Api<ClusterWatchRule> = Api::all(ctx.client.clone());
    finalizer(&api, FINALIZER, rule, |event| async {
        match event {
            FinalizerEvent::Apply(rule) => apply_cluster_watch_rule(&rule, &ctx).await,
            FinalizerEvent::Cleanup(rule) => {
                let source = source_key_for_cluster_rule(&rule);
                ctx.rule_store.remove_source(&source);
                ctx.rule_store.mark_deferred(source, false);
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))
}

fn source_key_for_cluster_rule(rule: &ClusterWatchRule) -> RuleSourceKey {
    RuleSourceKey {
        kind: RuleSourceKind::ClusterWatchRule,
        namespace: String::new(),
        name: rule.name_any(),
    }
}

async fn apply_cluster_watch_rule(rule: &ClusterWatchRule, ctx: &Context) -> Result<Action> {
    let source = source_key_for_cluster_rule(rule);
    let generation = rule.meta().generation.unwrap_or_default();
    let mut status = rule.status.clone().unwrap_or_default();
    let mut conditions = status.conditions.clone().unwrap_or_default();

    let target_namespace = rule.spec.target_ref.namespace.clone().unwrap_or_default();
    let target_ref = TargetRef::new(target_namespace.clone(), rule.spec.target_ref.name.clone());

    let path = match fetch_target_path(&ctx.client, &target_namespace, &rule.spec.target_ref.name).await {
        Ok(path) => path,
        Err(reason) => {
            conditions::upsert(&mut conditions, VALIDATED, conditions::STATUS_FALSE, "TargetNotFound", &reason, generation);
            status.conditions = Some(conditions);
            status.observed_generation = Some(generation);
            patch_cluster_rule_status(&ctx.client, rule, status).await?;
            return Ok(Action::requeue(Duration::from_secs(30)));
        }
    };

    let mut has_wildcard = false;
    let compiled: Vec<CompiledRule> = rule
        .spec
        .rules
        .iter()
        .map(|r| {
            let scope = if r.scope.eq_ignore_ascii_case("cluster") { Scope::Cluster } else { Scope::Namespaced };
            let compiled = compile_rule_spec(&r.base, source.clone(), target_ref.clone(), path.clone(), scope, None, r.namespace_selector.clone());
            has_wildcard |= compiled.resources.iter().any(|x| x == "*") || compiled.api_groups.iter().any(|x| x == "*");
            compiled
        })
        .collect();

    ctx.rule_store.replace_for_source(source.clone(), compiled);
    ctx.rule_store.mark_deferred(source, has_wildcard);

    if has_wildcard {
        conditions::upsert(&mut conditions, VALIDATED, conditions::STATUS_TRUE, "DeferredWildcard", "one or more rules use a wildcard group/resource not yet discoverable; matching continues once the Watch Manager discovers it", generation);
    } else {
        conditions::upsert(&mut conditions, VALIDATED, conditions::STATUS_TRUE, "Compiled", "rules compiled into the rule store", generation);
    }
    status.conditions = Some(conditions);
    status.observed_generation = Some(generation);
    patch_cluster_rule_status(&ctx.client, rule, status).await?;
    Ok(Action::requeue(Duration::from_secs(5 * 60)))
}

async fn patch_cluster_rule_status(client: &kube::Client, rule: &ClusterWatchRule, status: ClusterWatchRuleStatus) -> Result<()> {
    let api: Api<ClusterWatchRule> = Api::all(client.clone());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&rule.name_any(), &kube::api::PatchParams::apply("gitops-reverser"), &kube::api::Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn compile_rule_spec(
    spec: &RuleSpec,
    source: RuleSourceKey,
    target: TargetRef,
    path_prefix: String,
    scope: Scope,
    namespace: Option<String>,
    namespace_selector: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector>,
) -> CompiledRule {
    CompiledRule {
        source,
        target,
        path_prefix,
        operations: spec.operations.iter().filter_map(|o| parse_operation(o)).collect(),
        api_groups: spec.api_groups.clone(),
        api_versions: spec.api_versions.clone(),
        resources: spec.resources.clone(),
        scope,
        namespace,
        object_selector: spec.object_selector.clone(),
        namespace_selector,
    }
}

fn parse_operation(op: &str) -> Option<Operation> {
    match op.to_ascii_uppercase().as_str() {
        "CREATE" => Some(Operation::Create),
        "UPDATE" => Some(Operation::Update),
        "DELETE" => Some(Operation::Delete),
        _ => None,
    }
}

async fn fetch_target_path(client: &kube::Client, namespace: &str, name: &str) -> std::result::Result<String, String> {
    let api: Api<GitTarget> = Api::namespaced(client.clone(), namespace);
    let target = api
        .get(name)
        .await
        .map_err(|e| format!("GitTarget {namespace}/{name} not found: {e}"))?;
    Ok(target.normalized_path())
}

fn record_trace() {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
}

fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource + ResourceExt,
{
    warn!(resource = %obj.name_any(), error = %error, "reconcile failed");
    ctx.metrics.reconcile.set_failure(&obj, error);
    if error.retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::requeue(Duration::from_secs(5 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_json_diff::assert_json_include;
    use http::{Request, Response};
    use k8s_openapi::api::core::v1::Secret;
    use kube::{client::Body, Client};
    use std::collections::BTreeMap;

    use crate::context::State;
    use crate::correlation::CorrelationStore;
    use crate::crd::git_provider::{GitProviderSpec, SecretReference};
    use crate::metrics::Metrics;
    use crate::router::EventRouter;
    use crate::rules::RuleStore;
    use crate::watch::WatchManager;
    use crate::worker::WorkerManager;

    impl GitProvider {
        fn test() -> Self {
            let mut p = GitProvider::new(
                "repo",
                GitProviderSpec {
                    repo_url: "git@example.com:org/repo.git".into(),
                    allowed_branches: None,
                    secret_ref: SecretReference {
                        name: "creds".into(),
                        namespace: None,
                    },
                },
            );
            p.meta_mut().namespace = Some("default".into());
            p
        }

        fn finalized(mut self) -> Self {
            self.finalizers_mut().push(FINALIZER.to_string());
            self
        }
    }

    // Wraps `tower_test::mock::Handle`, the same scaffold the teacher's Echo
    // controller tests build on, generalized into a chainable verifier for
    // the finalizer-add -> business-logic -> status-patch sequence every
    // controller in this file drives through `kube::runtime::finalizer`.
    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
    struct ApiServerVerifier(ApiServerHandle);

    impl ApiServerVerifier {
        fn run(self, provider: GitProvider) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                self.handle_finalizer_add(provider.clone())
                    .await
                    .unwrap()
                    .handle_secret_get()
                    .await
                    .unwrap()
                    .handle_status_patch()
                    .await
                    .expect("scenario completed without errors");
            })
        }

        async fn handle_finalizer_add(mut self, provider: GitProvider) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().path(),
                format!("/apis/gitops.configbutler.io/v1alpha1/namespaces/default/gitproviders/{}", provider.name_any()).as_str()
            );
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let runtime_patch: serde_json::Value =
                serde_json::from_slice(&req_body).expect("valid json patch");
            assert_json_include!(
                actual: runtime_patch,
                expected: serde_json::json!([
                    { "op": "test", "path": "/metadata/finalizers", "value": null },
                    { "op": "add", "path": "/metadata/finalizers", "value": vec![FINALIZER] }
                ])
            );
            let response = serde_json::to_vec(&provider.finalized()).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_secret_get(mut self) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(request.uri().path(), "/api/v1/namespaces/default/secrets/creds");
            let secret = Secret {
                data: Some(BTreeMap::new()),
                ..Secret::default()
            };
            let response = serde_json::to_vec(&secret).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_status_patch(mut self) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert!(request.uri().path().ends_with("/status"));
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let patch: serde_json::Value =
                serde_json::from_slice(&req_body).expect("patch_status object is json");
            let conditions = patch["status"]["conditions"].as_array().cloned().unwrap_or_default();
            assert!(
                conditions.iter().any(|c| c["type"] == VALIDATED && c["status"] == "True"),
                "expected a True Validated condition in {conditions:?}"
            );
            let response = serde_json::to_vec(&GitProvider::test().finalized()).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }
    }

    fn test_context() -> (Arc<Context>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let metrics = Arc::new(Metrics::default());
        let rule_store = Arc::new(RuleStore::new());
        let correlation = Arc::new(CorrelationStore::new(10, 10_000, Duration::from_secs(60)));
        let router = Arc::new(EventRouter::new(rule_store.clone(), correlation.clone(), metrics.clone()));
        let worker_manager = Arc::new(WorkerManager::new());
        let config = crate::config::RuntimeConfig::default();
        let watch_manager = Arc::new(WatchManager::new(client.clone(), rule_store.clone(), router.clone(), metrics.clone(), config.clone()));
        let state = State::new(metrics, rule_store, correlation, router, worker_manager, watch_manager, config);
        (state.to_context(client), ApiServerVerifier(handle))
    }

    // A `GitProvider` with no finalizer and a resolvable secret reaches
    // `Validated=True`: finalizer gets added, the credentials secret is
    // fetched, and status is patched accordingly (§4.6).
    #[tokio::test]
    async fn git_provider_without_finalizer_gets_finalized_and_validated() {
        let (ctx, verifier) = test_context();
        let provider = GitProvider::test();
        let mock_srv = verifier.run(provider.clone());

        let result = reconcile_git_provider(Arc::new(provider), ctx).await;
        tokio::time::timeout(Duration::from_secs(1), mock_srv)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded");
        assert!(result.is_ok());
    }
}
