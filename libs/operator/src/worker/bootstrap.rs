//! `EnsurePathBootstrapped` (§4.9.2): the first time a `GitTarget`'s `path`
//! is used, make sure it exists in the working tree (and upstream) before
//! any real resource file lands there, so a brand-new path never ships as
//! part of the same commit as its first tracked resource.
//!
//! Kubernetes-free by design: whether the path was already bootstrapped is
//! the caller's (the lifecycle controller's) concern via `GitTarget.status`,
//! not something this module reads or writes.

use std::path::Path;

use git2::Repository;

use crate::error::Result;
use crate::worker::encryption::EncryptionContext;
use crate::worker::git_ops::{self, Credentials};

const PLACEHOLDER_FILE: &str = ".gitkeep";
const SOPS_FILE: &str = ".sops.yaml";

/// Creates `<path>/.gitkeep` (and, when encryption is configured,
/// `<path>/.sops.yaml` scoped to that path per §9) and commits+pushes if
/// `already_bootstrapped` is false and the directory doesn't already exist in
/// the tree. Returns `true` if a bootstrap commit was made.
///
/// Per §4.9.2, a listing that already finds files under `path` counts as
/// bootstrapped without a commit — this only ever writes scaffolding into a
/// genuinely empty path.
pub fn ensure_path_bootstrapped(
    repo: &Repository,
    workdir: &Path,
    branch: &str,
    path: &str,
    already_bootstrapped: bool,
    credentials: &Credentials,
    encryption: Option<&EncryptionContext>,
) -> Result<bool> {
    let dir = workdir.join(path);
    if already_bootstrapped {
        return Ok(false);
    }
    if dir.is_dir() && std::fs::read_dir(&dir)?.next().is_some() {
        return Ok(false);
    }
    std::fs::create_dir_all(&dir)?;

    let mut index = repo.index()?;

    let placeholder = dir.join(PLACEHOLDER_FILE);
    std::fs::write(&placeholder, b"")?;
    index.add_path(&Path::new(path).join(PLACEHOLDER_FILE))?;

    if let Some(encryption) = encryption {
        let sops_path = dir.join(SOPS_FILE);
        std::fs::write(&sops_path, encryption.sops_yaml(path))?;
        index.add_path(&Path::new(path).join(SOPS_FILE))?;
    }

    index.write()?;

    let message = format!("chore(bootstrap): initialize path {path}");
    git_ops::commit_index(repo, branch, "gitops-reverser", &message)?;
    git_ops::push(repo, branch, credentials)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::git_ops::Credentials;

    fn dummy_credentials() -> Credentials {
        Credentials::Https {
            username: "x".into(),
            password: "unused".into(),
        }
    }

    #[test]
    fn already_bootstrapped_short_circuits_without_touching_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        let bootstrapped = ensure_path_bootstrapped(&repo, dir.path(), "main", "apps", true, &dummy_credentials(), None).unwrap();

        assert!(!bootstrapped);
        assert!(!dir.path().join("apps").exists());
    }

    #[test]
    fn path_already_containing_files_counts_as_bootstrapped() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join("apps")).unwrap();
        std::fs::write(dir.path().join("apps/existing.yaml"), b"kind: ConfigMap\n").unwrap();

        let bootstrapped = ensure_path_bootstrapped(&repo, dir.path(), "main", "apps", false, &dummy_credentials(), None).unwrap();

        assert!(!bootstrapped);
        assert!(!dir.path().join("apps/.gitkeep").exists());
    }
}
