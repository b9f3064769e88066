//! SOPS-compatible encryption for Secret-semantics objects before they hit
//! the working tree, via the pure-Rust `rops` crate (DESIGN.md documents
//! this as the substitution for shelling out to the `sops` binary, which
//! the corpus has no example of driving safely from an async worker).

use rops::cryptography::age::AgeIntegration;
use rops::file::format::YamlFileFormat;
use rops::file::RopsFile;

use crate::crd::EncryptionConfig;
use crate::error::{Error, Result};

/// Resolved key material for one `GitTarget`'s encryption config, read once
/// per worker registration the same way `git_ops::Credentials` is.
#[derive(Clone)]
pub struct EncryptionContext {
    config: EncryptionConfig,
    age_public_key: String,
}

impl EncryptionContext {
    pub fn new(config: EncryptionConfig, age_public_key: String) -> Self {
        Self {
            config,
            age_public_key,
        }
    }

    pub fn generate_when_missing(&self) -> bool {
        self.config.generate_when_missing
    }

    /// Encrypts `plaintext` YAML in place, returning SOPS-formatted YAML with
    /// `sops:` metadata appended. Only ever called when
    /// `sanitize::is_secret_semantics` reports true for the source object.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let rops_file = RopsFile::<AgeIntegration, YamlFileFormat>::encrypt_from_str(
            plaintext,
            &self.age_public_key,
            None,
        )
        .map_err(|e| Error::EncryptionError(e.to_string()))?;
        Ok(rops_file.to_string())
    }
}

impl EncryptionContext {
    /// Renders the `.sops.yaml` scoped to one target's path (§9: encryption
    /// belongs to `GitTarget`, not `GitProvider`, so each path's creation
    /// rule only ever names that path's own recipient). Written once, at
    /// bootstrap.
    pub fn sops_yaml(&self, path: &str) -> String {
        format!(
            "creation_rules:\n  - path_regex: ^{path}/.*\\.yaml$\n    age: {key}\n",
            path = path,
            key = self.age_public_key,
        )
    }
}
