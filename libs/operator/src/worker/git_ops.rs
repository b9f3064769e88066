//! Low-level `git2` plumbing: clone/prepare, stage+commit+push, and the
//! pull-rebase-by-reset conflict recovery path (§4.9, §4.9.1). Grounded in
//! the corpus's git-automation modules (`phkaiser13-PeitchGIT`), which reach
//! for `git2` for exactly this "clone, stage, commit, push" shape rather
//! than shelling out to a `git` binary.

use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use git2::{Cred, FetchOptions, PushOptions, Remote, RemoteCallbacks, Repository, Signature};
use tracing::{debug, warn};

use crate::crd::SecretReference;
use crate::error::{Error, Result};

pub const REMOTE_NAME: &str = "origin";
pub const CLONE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static CONNECT_TIMEOUT_INIT: Once = Once::new();

/// libgit2 exposes network timeouts only as process-global socket options
/// (`GIT_OPT_SET_SERVER_TIMEOUT`/`_CONNECT_TIMEOUT`), not a per-`Remote` or
/// per-call knob. `apply_deadline` is called immediately before each
/// fetch/push below with that operation's own budget (§5: "per-call
/// timeouts, default 5 min clone, 60 s push"); concurrent branch workers
/// racing this global value is an accepted imprecision (see DESIGN.md,
/// "git operation timeouts").
fn apply_deadline(timeout: Duration) {
    CONNECT_TIMEOUT_INIT.call_once(|| {
        // SAFETY: `Once` serializes this against itself; the connect
        // timeout only needs setting once per process.
        unsafe {
            let _ = git2::opts::set_server_connect_timeout_in_milliseconds(
                CONNECT_TIMEOUT.as_millis() as u32,
            );
        }
    });
    // SAFETY: overwriting a process-global option is inherently racy
    // across concurrently-running branch workers; the consequence is a
    // transiently wrong timeout value on one of them, never memory
    // unsafety, and every caller sets a sane value before its own
    // network operation.
    unsafe {
        let _ = git2::opts::set_server_timeout_in_milliseconds(timeout.as_millis() as u32);
    }
}

/// Credentials resolved once per `BranchWorker` registration from the
/// `GitProvider`'s `secretRef` (§10: "read once per worker registration
/// through `kube::Api<Secret>`").
#[derive(Clone)]
pub enum Credentials {
    Ssh {
        username: String,
        private_key: String,
        passphrase: Option<String>,
    },
    Https {
        username: String,
        password: String,
    },
}

impl Credentials {
    pub fn from_secret_data(
        data: &std::collections::BTreeMap<String, Vec<u8>>,
        secret_ref: &SecretReference,
    ) -> Result<Self> {
        let get = |key: &str| -> Option<String> {
            data.get(key).map(|v| String::from_utf8_lossy(v).into_owned())
        };
        if let Some(private_key) = get("ssh-privatekey") {
            Ok(Credentials::Ssh {
                username: get("username").unwrap_or_else(|| "git".to_string()),
                private_key,
                passphrase: get("passphrase"),
            })
        } else if let (Some(username), Some(password)) = (get("username"), get("password")) {
            Ok(Credentials::Https { username, password })
        } else {
            Err(Error::EncryptionError(format!(
                "secret {} has neither ssh-privatekey nor username/password keys",
                secret_ref.name
            )))
        }
    }

    fn callbacks(&self) -> RemoteCallbacks<'static> {
        let creds = self.clone();
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, _allowed| match &creds {
            Credentials::Ssh {
                username,
                private_key,
                passphrase,
            } => Cred::ssh_key_from_memory(
                username_from_url.unwrap_or(username),
                None,
                private_key,
                passphrase.as_deref(),
            ),
            Credentials::Https { username, password } => {
                Cred::userpass_plaintext(username, password)
            }
        });
        callbacks
    }
}

/// Outcome of `PrepareBranch`, the four-state handler in §4.9.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Remote already has the branch; fetched and checked out.
    FetchedExisting,
    /// Remote is empty; created an orphan branch locally.
    CreatedOrphan,
    /// Remote has a default branch but not ours; branched from it.
    BranchedFromDefault,
    /// Target branch existed for us before but is gone upstream now; reset
    /// to default and the caller should re-run `SnapshotSynced`.
    ResetToDefaultIncomingChanges,
}

/// Shallow-clones (depth 1, no checkout) if `repo_path` doesn't hold a repo
/// yet, then resolves one of the four `PrepareBranch` states for `branch`.
pub fn prepare_branch(
    repo_path: &Path,
    remote_url: &str,
    branch: &str,
    credentials: &Credentials,
) -> Result<(Repository, PrepareOutcome)> {
    let repo = open_or_init(repo_path)?;
    ensure_remote(&repo, remote_url)?;

    let mut remote = repo.find_remote(REMOTE_NAME)?;
    fetch_all(&mut remote, credentials)?;

    let local_branch_ref = format!("refs/heads/{branch}");
    let remote_branch_ref = format!("refs/remotes/{REMOTE_NAME}/{branch}");
    let had_local_branch = repo.find_reference(&local_branch_ref).is_ok();

    let outcome = if let Ok(remote_ref) = repo.find_reference(&remote_branch_ref) {
        let target = remote_ref.target().ok_or_else(|| {
            Error::GitError(git2::Error::from_str("remote branch ref has no target"))
        })?;
        let commit = repo.find_commit(target)?;
        repo.branch(branch, &commit, true)?;
        checkout_branch(&repo, branch)?;
        PrepareOutcome::FetchedExisting
    } else if remote_is_empty(&repo)? {
        create_orphan_branch(&repo, branch)?;
        PrepareOutcome::CreatedOrphan
    } else if let Some(default) = default_remote_branch(&repo)? {
        let default_commit = repo.find_reference(&format!("refs/remotes/{REMOTE_NAME}/{default}"))?
            .peel_to_commit()?;
        repo.branch(branch, &default_commit, true)?;
        checkout_branch(&repo, branch)?;
        if had_local_branch {
            PrepareOutcome::ResetToDefaultIncomingChanges
        } else {
            PrepareOutcome::BranchedFromDefault
        }
    } else {
        create_orphan_branch(&repo, branch)?;
        PrepareOutcome::CreatedOrphan
    };

    Ok((repo, outcome))
}

fn open_or_init(repo_path: &Path) -> Result<Repository> {
    match Repository::open(repo_path) {
        Ok(repo) => Ok(repo),
        Err(_) => {
            std::fs::create_dir_all(repo_path)?;
            Ok(Repository::init(repo_path)?)
        }
    }
}

fn ensure_remote(repo: &Repository, url: &str) -> Result<()> {
    match repo.find_remote(REMOTE_NAME) {
        Ok(remote) => {
            if remote.url() != Some(url) {
                repo.remote_set_url(REMOTE_NAME, url)?;
            }
        }
        Err(_) => {
            repo.remote(REMOTE_NAME, url)?;
        }
    }
    Ok(())
}

fn fetch_all(remote: &mut Remote<'_>, credentials: &Credentials) -> Result<()> {
    apply_deadline(CLONE_TIMEOUT);
    let mut options = FetchOptions::new();
    options.remote_callbacks(credentials.callbacks());
    options.depth(1);
    remote
        .fetch(&[] as &[&str], Some(&mut options), None)
        .map_err(Error::GitError)
}

fn remote_is_empty(repo: &Repository) -> Result<bool> {
    Ok(repo
        .references()?
        .names()
        .filter_map(std::result::Result::ok)
        .all(|name| !name.starts_with(&format!("refs/remotes/{REMOTE_NAME}/"))))
}

fn default_remote_branch(repo: &Repository) -> Result<Option<String>> {
    let prefix = format!("refs/remotes/{REMOTE_NAME}/");
    for candidate in ["main", "master"] {
        if repo.find_reference(&format!("{prefix}{candidate}")).is_ok() {
            return Ok(Some(candidate.to_string()));
        }
    }
    for name in repo.references()?.names().filter_map(std::result::Result::ok) {
        if let Some(branch) = name.strip_prefix(&prefix) {
            if branch != "HEAD" {
                return Ok(Some(branch.to_string()));
            }
        }
    }
    Ok(None)
}

fn create_orphan_branch(repo: &Repository, branch: &str) -> Result<()> {
    repo.set_head_detached(repo.head().ok().and_then(|h| h.target()).unwrap_or_else(|| {
        // No HEAD yet at all (brand-new repo): leave detached head alone,
        // the caller's first commit establishes it.
        git2::Oid::zero()
    }))
    .ok();
    repo.set_head(&format!("refs/heads/{branch}")).ok();
    debug!(branch, "prepared orphan branch (no parent commit yet)");
    Ok(())
}

fn checkout_branch(repo: &Repository, branch: &str) -> Result<()> {
    repo.set_head(&format!("refs/heads/{branch}"))?;
    let mut checkout = git2::build::CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout))?;
    Ok(())
}

/// Commit the current index against HEAD (or with no parent if this is the
/// very first commit on an orphan branch) using `author` for both author and
/// committer identity, falling back to the system identity.
pub fn commit_index(
    repo: &Repository,
    branch: &str,
    author_name: &str,
    message: &str,
) -> Result<git2::Oid> {
    let mut index = repo.index()?;
    let tree_oid = index.write_tree()?;
    let tree = repo.find_tree(tree_oid)?;
    let signature = Signature::now(author_name, &format!("{author_name}@gitops-reverser.local"))
        .unwrap_or_else(|_| Signature::now("gitops-reverser", "gitops-reverser@local").unwrap());

    let parent_commit = repo
        .find_reference(&format!("refs/heads/{branch}"))
        .ok()
        .and_then(|r| r.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent_commit.iter().collect();

    let oid = repo.commit(
        Some(&format!("refs/heads/{branch}")),
        &signature,
        &signature,
        message,
        &tree,
        &parents,
    )?;
    Ok(oid)
}

pub fn push(repo: &Repository, branch: &str, credentials: &Credentials) -> Result<()> {
    apply_deadline(PUSH_TIMEOUT);
    let mut remote = repo.find_remote(REMOTE_NAME)?;
    let mut options = PushOptions::new();
    options.remote_callbacks(credentials.callbacks());
    let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
    remote
        .push(&[refspec.as_str()], Some(&mut options))
        .map_err(Error::GitError)
}

/// Pull-rebase-by-reset (§4.9 step 5): reset local `branch` to the fetched
/// remote tip, discarding this batch's local WIP so the caller can
/// re-evaluate and re-apply its events against current state.
pub fn reset_to_remote_tip(repo: &Repository, branch: &str, credentials: &Credentials) -> Result<()> {
    let mut remote = repo.find_remote(REMOTE_NAME)?;
    fetch_all(&mut remote, credentials)?;
    let remote_ref = repo.find_reference(&format!("refs/remotes/{REMOTE_NAME}/{branch}"))?;
    let commit = remote_ref.peel_to_commit()?;
    repo.reset(commit.as_object(), git2::ResetType::Hard, None)?;
    warn!(branch, "reset local branch to remote tip after push conflict");
    Ok(())
}
