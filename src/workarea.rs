//! Per-request scratch directories.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const AREA_PREFIX: &str = "req-";
const SOURCE_FILE: &str = "main.rs";

/// A directory owned by exactly one in-flight request.
///
/// Created with `create_dir`, so a name collision fails instead of two
/// requests sharing a directory. Removed recursively on drop.
#[derive(Debug)]
pub struct WorkingArea {
    path: PathBuf,
}

impl WorkingArea {
    /// Create `<root>/req-<seq>-<random>`.
    pub fn create(root: &Path, seq: u64) -> Result<Self> {
        let suffix = Uuid::new_v4().simple().to_string();
        let path = root.join(format!("{}{:08}-{}", AREA_PREFIX, seq, &suffix[..12]));
        fs::create_dir(&path).map_err(|source| Error::WorkArea {
            path: path.clone(),
            source,
        })?;
        debug!(path = ?path, "Working area created");
        Ok(WorkingArea { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_path(&self) -> PathBuf {
        self.path.join(SOURCE_FILE)
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn write_source(&self, source: &str) -> Result<PathBuf> {
        let path = self.source_path();
        fs::write(&path, source).map_err(|source| Error::WorkArea {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn read_source(&self) -> Result<Vec<u8>> {
        self.read_file(SOURCE_FILE)
    }

    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.file(name);
        fs::read(&path).map_err(|source| Error::WorkArea { path, source })
    }

    /// Let an unprivileged sandbox user write build artifacts here.
    pub fn share_with_sandbox_user(&self) -> Result<()> {
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o777)).map_err(|source| {
            Error::WorkArea {
                path: self.path.clone(),
                source,
            }
        })
    }
}

impl Drop for WorkingArea {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Working area removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?self.path, error = %e, "Unable to remove working area"),
        }
    }
}

/// Make sure `root` exists and remove areas left behind by an earlier
/// process. Returns the number removed.
pub fn prepare_root(root: &Path) -> Result<usize> {
    let work_area_err = |source| Error::WorkArea {
        path: root.to_path_buf(),
        source,
    };
    fs::create_dir_all(root).map_err(work_area_err)?;

    let mut removed = 0;
    for entry in fs::read_dir(root).map_err(work_area_err)? {
        let entry = entry.map_err(work_area_err)?;
        let is_area = entry.file_name().to_string_lossy().starts_with(AREA_PREFIX);
        if !is_area || !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = ?entry.path(), error = %e, "Unable to remove stale working area"),
        }
    }
    if removed > 0 {
        info!(root = ?root, removed, "Removed stale working areas");
    }
    Ok(removed)
}
