//! Single-credential file store: the source of truth for "the current grant".
//!
//! Every operation re-reads from disk; nothing is cached across calls. Other
//! host processes share these files, so writes are atomic (temp + rename) and
//! mutations happen under the advisory file lock owned by the callers.

use crate::auth::credential::QwenCredential;
use crate::config::AuthConfig;
use crate::error::CastorError;
use crate::utils::fsx::write_atomic_private;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TokenStore {
    cfg: AuthConfig,
}

impl TokenStore {
    pub fn new(cfg: AuthConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.cfg
    }

    /// Lock file guarding mutations of the credential file.
    pub fn lock_path(&self) -> PathBuf {
        let mut p = self.cfg.credential_path().into_os_string();
        p.push(".lock");
        PathBuf::from(p)
    }

    /// Read, migrate, and normalize the stored credential.
    ///
    /// Returns `None` when no file exists or the record fails normalization.
    /// A legacy on-disk shape is opportunistically rewritten to the canonical
    /// one; that rewrite failing is logged, never fatal.
    pub fn load(&self) -> Option<QwenCredential> {
        self.migrate_legacy_location();

        let path = self.cfg.credential_path();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read credential file");
                return None;
            }
        };

        let raw: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "credential file is not valid JSON");
                return None;
            }
        };

        let cred = QwenCredential::normalize(&raw)?;

        if QwenCredential::has_legacy_shape(&raw) {
            if let Err(e) = self.save(&cred) {
                warn!(error = %e, "failed to rewrite legacy credential shape; keeping old file");
            } else {
                debug!("rewrote legacy credential shape to canonical form");
            }
        }

        Some(cred)
    }

    /// Atomically persist the credential with owner-only permissions.
    ///
    /// The canonical path never holds a half-written file: content lands in a
    /// sibling temp file first and is renamed into place. On any write failure
    /// the temp file is removed and the error propagates.
    pub fn save(&self, cred: &QwenCredential) -> Result<(), CastorError> {
        let body = serde_json::to_vec_pretty(cred)?;
        write_atomic_private(&self.cfg.credential_path(), &body)
    }

    /// Remove canonical and legacy credential files. Idempotent: an absent
    /// target is success, not an error.
    pub fn clear(&self) -> Result<(), CastorError> {
        for path in [self.cfg.credential_path(), self.cfg.legacy_credential_path()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed credential file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// One-time migration from the legacy file location, applied only when the
    /// canonical path is absent.
    fn migrate_legacy_location(&self) {
        let canonical = self.cfg.credential_path();
        let legacy = self.cfg.legacy_credential_path();
        if canonical.exists() || !legacy.exists() {
            return;
        }
        match fs::rename(&legacy, &canonical) {
            Ok(()) => debug!(from = %legacy.display(), to = %canonical.display(), "migrated legacy credential file"),
            Err(e) => warn!(error = %e, "failed to migrate legacy credential file"),
        }
    }
}
