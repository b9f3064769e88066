//! `BranchWorker`: owns one (provider, branch) pair's local clone and is the
//! only task permitted to touch it, so every write is single-threaded by
//! construction (§5). Runs the batch loop in §4.9: accumulate events up to
//! `maxCommits`/`maxBatchBytes`/`pushInterval`, write files, commit, push,
//! and retry via rebase-by-reset on conflict.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::event::{EventBody, Operation, StreamEvent, WorkerKey};
use crate::metrics::Metrics;
use crate::rules::RuleStore;
use crate::sanitize;

use super::encryption::EncryptionContext;
use super::git_ops::{self, Credentials, PrepareOutcome};
use super::handle::{QueuedEvent, WorkerHandle};
use super::orphan;

pub struct BranchWorkerConfig {
    pub key: WorkerKey,
    pub workdir: PathBuf,
    pub remote_url: String,
    pub branch: String,
    pub credentials: Credentials,
    pub encryption: Option<EncryptionContext>,
    pub runtime: RuntimeConfig,
}

struct BranchWorker {
    key: WorkerKey,
    workdir: PathBuf,
    remote_url: String,
    branch: String,
    credentials: Credentials,
    encryption: Option<EncryptionContext>,
    runtime: RuntimeConfig,
    metrics: Arc<Metrics>,
    rule_store: Arc<RuleStore>,
    handle: WorkerHandle,
}

/// Spawns the processing task and returns the handle callers enqueue
/// through. `cancel` is the worker's own shutdown token, distinct from the
/// per-target `GitTarget` reconciliation lifecycle.
pub fn spawn(
    config: BranchWorkerConfig,
    metrics: Arc<Metrics>,
    rule_store: Arc<RuleStore>,
    cancel: CancellationToken,
) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel::<QueuedEvent>();
    let handle = WorkerHandle::new(tx, config.runtime.worker_queue_high_water_mark);
    let worker = Arc::new(BranchWorker {
        key: config.key,
        workdir: config.workdir,
        remote_url: config.remote_url,
        branch: config.branch,
        credentials: config.credentials,
        encryption: config.encryption,
        runtime: config.runtime,
        metrics,
        rule_store,
        handle: handle.clone(),
    });
    tokio::spawn(run_loop(worker, rx, cancel));
    handle
}

async fn run_loop(
    worker: Arc<BranchWorker>,
    mut rx: mpsc::UnboundedReceiver<QueuedEvent>,
    cancel: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = collect_batch(&worker, &mut rx) => batch,
        };
        let Some(batch) = batch else {
            break;
        };
        if batch.is_empty() {
            continue;
        }
        if let Err(e) = worker.process_batch(batch).await {
            warn!(worker_key = %worker.key, error = %e, "branch worker batch failed");
            worker.metrics.commit_failed(&worker.key.to_string());
        }
    }
    info!(worker_key = %worker.key, "branch worker shut down");
}

/// Pulls events until `maxCommits` is reached, the estimated batch size
/// exceeds `maxBatchBytes`, or `pushInterval` has elapsed since the first
/// event in the batch arrived — whichever comes first. Returns `None` once
/// the channel is closed and drained.
async fn collect_batch(
    worker: &Arc<BranchWorker>,
    rx: &mut mpsc::UnboundedReceiver<QueuedEvent>,
) -> Option<Vec<StreamEvent>> {
    let first = rx.recv().await?;
    worker.handle.record_dequeue();
    worker.metrics.set_queue_depth(&worker.key.to_string(), worker.handle.depth());

    let mut batch = vec![first.event];
    let mut bytes = estimated_bytes(&batch[0]);
    let deadline = Instant::now() + worker.runtime.worker_push_interval;

    loop {
        if batch.len() >= worker.runtime.worker_max_commits || bytes >= worker.runtime.worker_max_batch_bytes {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            queued = rx.recv() => {
                match queued {
                    Some(queued) => {
                        worker.handle.record_dequeue();
                        worker.metrics.set_queue_depth(&worker.key.to_string(), worker.handle.depth());
                        bytes += estimated_bytes(&queued.event);
                        batch.push(queued.event);
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep(remaining) => break,
        }
    }
    Some(batch)
}

fn estimated_bytes(event: &StreamEvent) -> usize {
    match &event.body {
        EventBody::Resource { sanitized, .. } => sanitized.as_ref().map_or(0, |s| s.len()),
        EventBody::Control(_) => 0,
    }
}

impl BranchWorker {
    async fn process_batch(&self, batch: Vec<StreamEvent>) -> crate::error::Result<()> {
        let workdir = self.workdir.clone();
        let remote_url = self.remote_url.clone();
        let branch = self.branch.clone();
        let credentials = self.credentials.clone();
        let encryption = self.encryption.clone();
        let rule_store = self.rule_store.clone();
        let worker_key = self.key.clone();
        let metrics = self.metrics.clone();
        let max_retries = self.runtime.worker_max_retries;

        tokio::task::spawn_blocking(move || {
            run_batch_blocking(
                &workdir,
                &remote_url,
                &branch,
                &credentials,
                encryption.as_ref(),
                &rule_store,
                &worker_key,
                &metrics,
                batch,
                max_retries,
            )
        })
        .await
        .map_err(|e| Error::Internal(format!("branch worker task panicked: {e}")))?
    }
}

/// Git operations are synchronous (`git2`); the whole batch runs on a
/// blocking thread so the async runtime's workers are never stalled on
/// network or filesystem I/O.
#[allow(clippy::too_many_arguments)]
fn run_batch_blocking(
    workdir: &std::path::Path,
    remote_url: &str,
    branch: &str,
    credentials: &Credentials,
    encryption: Option<&EncryptionContext>,
    rule_store: &RuleStore,
    worker_key: &WorkerKey,
    metrics: &Metrics,
    mut batch: Vec<StreamEvent>,
    max_retries: u32,
) -> crate::error::Result<()> {
    let mut attempt = 0;
    loop {
        let (repo, outcome) = git_ops::prepare_branch(workdir, remote_url, branch, credentials)?;
        if outcome == PrepareOutcome::ResetToDefaultIncomingChanges {
            // §4.9.1(d): our branch vanished upstream since we last held it.
            // We've already reset to the remote's default branch above; the
            // re-applied batch below lands on top of that. Surfaced as a
            // metric rather than a forced re-seed (see DESIGN.md,
            // "incoming changes signal") — an operator watching this counter
            // knows to delete/recreate the GitTarget if a full re-snapshot is
            // required.
            warn!(worker_key = %worker_key, branch, "target branch missing upstream, reset to default branch");
            metrics.branch_reset_incoming_changes(&worker_key.to_string());
        }

        let mut orphan_events = Vec::new();
        for event in &batch {
            if let Some(snapshot) = orphan::seed_snapshot(event) {
                orphan_events.extend(orphan::find_orphans(
                    workdir,
                    &event.path,
                    &event.target,
                    rule_store,
                    snapshot,
                ));
            }
        }
        batch.extend(orphan_events);

        let mut touched: Vec<(Operation, &'static str, String)> = Vec::new();
        let mut any_write = false;
        for event in &batch {
            let EventBody::Resource {
                identifier,
                operation,
                sanitized,
                ..
            } = &event.body
            else {
                continue;
            };
            let relative = PathBuf::from(&event.path).join(identifier.relative_path());
            let absolute = workdir.join(&relative);

            match operation {
                Operation::Delete => {
                    if absolute.exists() {
                        std::fs::remove_file(&absolute)?;
                        stage_path(&repo, &relative)?;
                        any_write = true;
                    }
                }
                Operation::Create | Operation::Update => {
                    let Some(plaintext) = sanitized else { continue };
                    if let Some(parent) = absolute.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let content = if sanitize::is_secret_semantics(identifier, &[]) {
                        match encryption {
                            Some(ctx) => ctx.encrypt(plaintext)?,
                            None => plaintext.clone(),
                        }
                    } else {
                        plaintext.clone()
                    };
                    std::fs::write(&absolute, content.as_bytes())?;
                    stage_path(&repo, &relative)?;
                    any_write = true;
                }
            }
            touched.push((*operation, identifier.resource.as_str(), format!("{}/{}", identifier.namespace, identifier.name)));
        }

        if !any_write {
            return Ok(());
        }

        let author = batch
            .iter()
            .find_map(|e| match &e.body {
                EventBody::Resource { user_info, .. } => Some(user_info.username.clone()),
                EventBody::Control(_) => None,
            })
            .unwrap_or_else(|| crate::event::UserInfo::system().username);

        let message = commit_message(&touched);

        git_ops::commit_index(&repo, branch, &author, &message)?;

        match git_ops::push(&repo, branch, credentials) {
            Ok(()) => {
                metrics.commit_succeeded(&worker_key.to_string());
                return Ok(());
            }
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    return Err(e);
                }
                warn!(worker_key = %worker_key, attempt, "push conflict, retrying via rebase-by-reset");
                git_ops::reset_to_remote_tip(&repo, branch, credentials)?;
            }
        }
    }
}

fn stage_path(repo: &git2::Repository, relative: &std::path::Path) -> crate::error::Result<()> {
    let mut index = repo.index()?;
    let absolute = repo.workdir().map(|w| w.join(relative));
    if absolute.is_some_and(|p| p.exists()) {
        index.add_path(relative)?;
    } else {
        let _ = index.remove_path(relative);
    }
    index.write()?;
    Ok(())
}

/// `"<OP> <resource/kind> <ns>/<name>"` for a single change, or a batched
/// summary headed by the dominant operation for several (§4.9 step 4).
fn commit_message(touched: &[(Operation, &str, String)]) -> String {
    match touched {
        [] => "Sync".to_string(),
        [(op, resource, target)] => format!("{} {resource} {target}", op.as_str()),
        many => {
            let lines: Vec<String> = many
                .iter()
                .map(|(op, resource, target)| format!("{} {resource} {target}", op.as_str()))
                .collect();
            format!("Sync {} resources\n\n{}", many.len(), lines.join("\n"))
        }
    }
}
