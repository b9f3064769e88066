//! C10 — GitTarget Lifecycle Controller (§4.10): an ordered gate pipeline,
//! `Validated -> EncryptionConfigured -> Bootstrapped -> SnapshotSynced ->
//! EventStreamLive -> Ready`. Each gate is evaluated only once its
//! predecessor is satisfied; everything downstream of the first unmet gate
//! is written back as `Unknown` so a glance at `status.conditions` shows
//! exactly where a target is stuck.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use crate::conditions;
use crate::context::Context;
use crate::crd::{GitProvider, GitTarget, GitTargetStatus};
use crate::error::{Error, Result};
use crate::event::{TargetRef, WorkerKey};
use crate::target_stream::{StreamState, TargetStream};
use crate::worker::{self, prepare_branch, Credentials, EncryptionContext, RegisterParams, TargetId};

pub const COND_VALIDATED: &str = "Validated";
pub const COND_ENCRYPTION_CONFIGURED: &str = "EncryptionConfigured";
pub const COND_BOOTSTRAPPED: &str = "Bootstrapped";
pub const COND_SNAPSHOT_SYNCED: &str = "SnapshotSynced";
pub const COND_EVENT_STREAM_LIVE: &str = "EventStreamLive";
pub const COND_READY: &str = "Ready";

const ALL_GATES: &[&str] = &[
    COND_VALIDATED,
    COND_ENCRYPTION_CONFIGURED,
    COND_BOOTSTRAPPED,
    COND_SNAPSHOT_SYNCED,
    COND_EVENT_STREAM_LIVE,
];

fn clone_workdir(target: &GitTarget) -> PathBuf {
    std::env::temp_dir()
        .join("gitops-reverser")
        .join(target.namespace().unwrap_or_default())
        .join(target.name_any())
}

/// Runs the gate pipeline once, mutating `status.conditions` in place and
/// returning whether the target reached `Ready` this pass.
pub async fn run_gates(target: &GitTarget, ctx: &Context, status: &mut GitTargetStatus) -> Result<bool> {
    let generation = target.meta().generation.unwrap_or_default();
    let mut conditions = status.conditions.clone().unwrap_or_default();

    let provider = match validate(target, ctx).await {
        Ok(provider) => {
            conditions::upsert(&mut conditions, COND_VALIDATED, conditions::STATUS_TRUE, "OK", "provider and branch are valid", generation);
            Some(provider)
        }
        Err((reason, message)) => {
            conditions::upsert(&mut conditions, COND_VALIDATED, conditions::STATUS_FALSE, reason, &message, generation);
            block_downstream(&mut conditions, COND_ENCRYPTION_CONFIGURED, reason, generation);
            status.conditions = Some(conditions);
            return Ok(false);
        }
    };
    let provider = provider.expect("validated above");

    let credentials = match resolve_credentials(&provider, ctx).await {
        Ok(c) => c,
        Err(message) => {
            // Credential resolution happens while resolving the provider
            // reference itself; the canonical Validated reasons have no
            // dedicated "secret missing" case, so an unusable provider
            // (credentials included) folds into ProviderNotFound.
            conditions::upsert(&mut conditions, COND_VALIDATED, conditions::STATUS_FALSE, "ProviderNotFound", &message, generation);
            block_downstream(&mut conditions, COND_ENCRYPTION_CONFIGURED, "ProviderNotFound", generation);
            status.conditions = Some(conditions);
            return Ok(false);
        }
    };

    let encryption = match configure_encryption(target, ctx).await {
        Ok(None) => {
            conditions::upsert(&mut conditions, COND_ENCRYPTION_CONFIGURED, conditions::STATUS_TRUE, "NotRequired", "target does not configure encryption", generation);
            None
        }
        Ok(Some(encryption_ctx)) => {
            conditions::upsert(&mut conditions, COND_ENCRYPTION_CONFIGURED, conditions::STATUS_TRUE, "OK", "encryption requirements satisfied", generation);
            Some(encryption_ctx)
        }
        Err((reason, message)) => {
            conditions::upsert(&mut conditions, COND_ENCRYPTION_CONFIGURED, conditions::STATUS_FALSE, reason, &message, generation);
            block_downstream(&mut conditions, COND_BOOTSTRAPPED, reason, generation);
            status.conditions = Some(conditions);
            return Ok(false);
        }
    };

    let path = target.normalized_path();
    let already_bootstrapped = target.is_bootstrapped(&path);
    match ensure_bootstrapped(target, &provider, &credentials, already_bootstrapped, encryption.clone()).await {
        Ok(newly_bootstrapped) => {
            if newly_bootstrapped {
                let mut paths = status.bootstrapped_paths.clone().unwrap_or_default();
                if !paths.contains(&path) {
                    paths.push(path.clone());
                }
                status.bootstrapped_paths = Some(paths);
                conditions::upsert(&mut conditions, COND_BOOTSTRAPPED, conditions::STATUS_TRUE, "BootstrapApplied", "path initialized with a bootstrap commit", generation);
            } else {
                conditions::upsert(&mut conditions, COND_BOOTSTRAPPED, conditions::STATUS_TRUE, "BootstrapNotNeeded", "path already exists in the working tree", generation);
            }
        }
        Err(reason) => {
            conditions::upsert(&mut conditions, COND_BOOTSTRAPPED, conditions::STATUS_FALSE, "BootstrapFailed", &reason, generation);
            block_downstream(&mut conditions, COND_SNAPSHOT_SYNCED, "BootstrapFailed", generation);
            status.conditions = Some(conditions);
            return Ok(false);
        }
    }

    let target_ref = TargetRef::new(target.namespace().unwrap_or_default(), target.name_any());
    let worker_key = worker_key_for(target, &provider);
    let handle = ctx
        .worker_manager
        .register(
            RegisterParams {
                key: worker_key.clone(),
                target: TargetId {
                    namespace: target.namespace().unwrap_or_default(),
                    name: target.name_any(),
                },
                workdir: clone_workdir(target),
                remote_url: provider.spec.repo_url.clone(),
                branch: target.spec.branch.clone(),
                credentials,
                encryption,
                runtime: ctx.config.clone(),
            },
            ctx.metrics.clone(),
            ctx.rule_store.clone(),
        )
        .await;

    let stream = Arc::new(TargetStream::new(handle, ctx.metrics.clone()));
    ctx.router.register_target(target_ref.clone(), stream).await;

    let ready = match ctx.router.stream_state(&target_ref).await {
        Some(StreamState::LiveProcessing) => {
            conditions::upsert(&mut conditions, COND_SNAPSHOT_SYNCED, conditions::STATUS_TRUE, "Completed", "initial snapshot forwarded", generation);
            conditions::upsert(&mut conditions, COND_EVENT_STREAM_LIVE, conditions::STATUS_TRUE, "Registered", "events are flowing to the branch worker", generation);
            conditions::upsert(&mut conditions, COND_READY, conditions::STATUS_TRUE, "OK", "target is fully reconciled", generation);
            true
        }
        _ => {
            conditions::upsert(&mut conditions, COND_SNAPSHOT_SYNCED, conditions::STATUS_FALSE, "Running", "waiting for the watch manager's first seed sweep", generation);
            block_downstream(&mut conditions, COND_EVENT_STREAM_LIVE, "Running", generation);
            false
        }
    };
    status.conditions = Some(conditions);
    status.observed_generation = Some(generation);
    Ok(ready)
}

/// Marks every gate from `from` onward (inclusive) `Unknown`/`Blocked` —
/// the spec's "unevaluated downstream gates set to Unknown with reason
/// Blocked" upsert rule — and rolls the triggering gate's own reason up
/// onto `Ready` as its "first failing gate's category" per §4.10.
fn block_downstream(conditions: &mut Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>, from: &str, ready_reason: &str, generation: i64) {
    let start = ALL_GATES.iter().position(|g| *g == from).unwrap_or(ALL_GATES.len());
    for gate in &ALL_GATES[start..] {
        conditions::upsert(conditions, gate, conditions::STATUS_UNKNOWN, "Blocked", "blocked on an earlier gate", generation);
    }
    conditions::upsert(conditions, COND_READY, conditions::STATUS_FALSE, ready_reason, "blocked on an earlier gate", generation);
}

async fn validate(target: &GitTarget, ctx: &Context) -> std::result::Result<GitProvider, (&'static str, String)> {
    let own_namespace = target.namespace().unwrap_or_default();
    let provider_ns = target.provider_namespace(&own_namespace);
    let providers: Api<GitProvider> = Api::namespaced(ctx.client.clone(), &provider_ns);
    let provider = providers.get(&target.spec.provider_ref.name).await.map_err(|e| {
        (
            "ProviderNotFound",
            format!("GitProvider {}/{} not found: {e}", provider_ns, target.spec.provider_ref.name),
        )
    })?;
    if !provider.allows_branch(&target.spec.branch) {
        return Err((
            "BranchNotAllowed",
            format!("branch {} is not in provider's allowedBranches", target.spec.branch),
        ));
    }
    Ok(provider)
}

async fn resolve_credentials(provider: &GitProvider, ctx: &Context) -> std::result::Result<Credentials, String> {
    let secret_ref = &provider.spec.secret_ref;
    let ns = secret_ref
        .namespace
        .clone()
        .or_else(|| provider.namespace())
        .unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    let secret = secrets
        .get(&secret_ref.name)
        .await
        .map_err(|e| format!("secret {ns}/{} not found: {e}", secret_ref.name))?;
    let data: BTreeMap<String, Vec<u8>> = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect();
    Credentials::from_secret_data(&data, secret_ref).map_err(|e| e.to_string())
}

async fn configure_encryption(
    target: &GitTarget,
    ctx: &Context,
) -> std::result::Result<Option<EncryptionContext>, (&'static str, String)> {
    let Some(encryption_spec) = target.spec.encryption.clone() else {
        return Ok(None);
    };
    let ns = encryption_spec
        .secret_ref
        .namespace
        .clone()
        .or_else(|| target.namespace())
        .unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    let secret = match secrets.get(&encryption_spec.secret_ref.name).await {
        Ok(secret) => secret,
        Err(_) if encryption_spec.generate_when_missing => {
            return Err((
                "SecretCreateDisabled",
                "age key generation is not implemented in this deployment; create the secret out of band".to_string(),
            ));
        }
        Err(e) => {
            return Err((
                "MissingSecret",
                format!("encryption secret {ns}/{} not found: {e}", encryption_spec.secret_ref.name),
            ))
        }
    };
    let data = secret.data.unwrap_or_default();
    let public_key = data
        .get("age.pub")
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .ok_or_else(|| ("InvalidConfig", "encryption secret missing age.pub".to_string()))?;
    Ok(Some(EncryptionContext::new(encryption_spec, public_key)))
}

async fn ensure_bootstrapped(
    target: &GitTarget,
    provider: &GitProvider,
    credentials: &Credentials,
    already_bootstrapped: bool,
    encryption: Option<EncryptionContext>,
) -> std::result::Result<bool, String> {
    let workdir = clone_workdir(target);
    let remote_url = provider.spec.repo_url.clone();
    let branch = target.spec.branch.clone();
    let path = target.normalized_path();
    let credentials = credentials.clone();

    tokio::task::spawn_blocking(move || -> Result<bool> {
        let (repo, _outcome) = prepare_branch(&workdir, &remote_url, &branch, &credentials)?;
        worker::ensure_path_bootstrapped(
            &repo,
            &workdir,
            &branch,
            &path,
            already_bootstrapped,
            &credentials,
            encryption.as_ref(),
        )
    })
    .await
    .map_err(|e| format!("bootstrap task panicked: {e}"))?
    .map_err(|e: Error| e.to_string())
}

fn worker_key_for(target: &GitTarget, provider: &GitProvider) -> WorkerKey {
    WorkerKey {
        provider_namespace: provider.namespace().unwrap_or_default(),
        provider_name: provider.name_any(),
        branch: target.spec.branch.clone(),
    }
}

pub fn log_unready(target: &GitTarget) {
    warn!(target = %target.name_any(), "GitTarget not yet ready, will retry");
}

pub fn log_ready(target: &GitTarget) {
    info!(target = %target.name_any(), "GitTarget reconciled to Ready");
}
