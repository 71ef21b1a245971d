//! Owner-only filesystem helpers shared by the credential and accounts stores.

use crate::error::CastorError;
use std::fs;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

pub(crate) fn create_private_dir(dir: &Path) -> Result<(), CastorError> {
    if dir.exists() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Atomic owner-only write: content lands in a sibling temp file and is
/// renamed over the target, so no reader ever observes a half-written file.
/// On failure the temp file is removed and the error propagates.
pub(crate) fn write_atomic_private(path: &Path, body: &[u8]) -> Result<(), CastorError> {
    let dir = path
        .parent()
        .ok_or_else(|| CastorError::UnexpectedError(format!("{} has no parent", path.display())))?;
    create_private_dir(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("castor");
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    let result = write_private_file(&tmp, body).and_then(|()| Ok(fs::rename(&tmp, path)?));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_private_file(path: &Path, body: &[u8]) -> Result<(), CastorError> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(body)?;
    file.sync_all()?;
    Ok(())
}
