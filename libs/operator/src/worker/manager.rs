//! `WorkerManager`: the registry mapping a `WorkerKey` (provider + branch) to
//! its single `BranchWorker`, reference-counted by the `GitTarget`s that
//! share it (distinct `path` values under the same provider/branch collapse
//! onto one worker, one clone, one commit stream).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::event::WorkerKey;
use crate::metrics::Metrics;
use crate::rules::RuleStore;

use super::branch::{self, BranchWorkerConfig};
use super::encryption::EncryptionContext;
use super::git_ops::Credentials;
use super::handle::WorkerHandle;

/// Identity of a `GitTarget` holding a reference on a worker, used purely
/// for refcounting — not consulted for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetId {
    pub namespace: String,
    pub name: String,
}

struct Entry {
    handle: WorkerHandle,
    cancel: CancellationToken,
    referencing_targets: HashSet<TargetId>,
}

#[derive(Default)]
pub struct WorkerManager {
    workers: Mutex<HashMap<WorkerKey, Entry>>,
}

pub struct RegisterParams {
    pub key: WorkerKey,
    pub target: TargetId,
    pub workdir: std::path::PathBuf,
    pub remote_url: String,
    pub branch: String,
    pub credentials: Credentials,
    pub encryption: Option<EncryptionContext>,
    pub runtime: RuntimeConfig,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing worker's handle if one already serves `key`,
    /// otherwise spawns a new `BranchWorker` and registers it. Either way,
    /// `params.target` is added to the worker's referencing set.
    pub async fn register(
        &self,
        params: RegisterParams,
        metrics: Arc<Metrics>,
        rule_store: Arc<RuleStore>,
    ) -> WorkerHandle {
        let mut workers = self.workers.lock().await;
        if let Some(entry) = workers.get_mut(&params.key) {
            entry.referencing_targets.insert(params.target);
            return entry.handle.clone();
        }

        let cancel = CancellationToken::new();
        let handle = branch::spawn(
            BranchWorkerConfig {
                key: params.key.clone(),
                workdir: params.workdir,
                remote_url: params.remote_url,
                branch: params.branch,
                credentials: params.credentials,
                encryption: params.encryption,
                runtime: params.runtime,
            },
            metrics,
            rule_store,
            cancel.clone(),
        );
        info!(worker_key = %params.key, "spawned branch worker");
        let mut referencing_targets = HashSet::new();
        referencing_targets.insert(params.target);
        workers.insert(
            params.key,
            Entry {
                handle: handle.clone(),
                cancel,
                referencing_targets,
            },
        );
        handle
    }

    /// Drops `target`'s reference on `key`; tears down the worker (via
    /// cancellation) once no `GitTarget` references it any more.
    pub async fn unregister(&self, key: &WorkerKey, target: &TargetId) {
        let mut workers = self.workers.lock().await;
        let should_remove = if let Some(entry) = workers.get_mut(key) {
            entry.referencing_targets.remove(target);
            entry.referencing_targets.is_empty()
        } else {
            false
        };
        if should_remove {
            if let Some(entry) = workers.remove(key) {
                entry.cancel.cancel();
                info!(worker_key = %key, "tore down unreferenced branch worker");
            }
        }
    }

    pub async fn handle_for(&self, key: &WorkerKey) -> Option<WorkerHandle> {
        self.workers.lock().await.get(key).map(|e| e.handle.clone())
    }

    pub async fn active_worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }
}
