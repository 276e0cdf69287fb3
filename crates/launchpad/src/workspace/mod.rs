//! Per-user workspace directories mounted into session containers.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Why a workspace could not be prepared.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("permission denied preparing workspace {path}: {message}")]
    PermissionDenied { path: PathBuf, message: String },

    #[error("failed to prepare workspace {path}: {message}")]
    Os { path: PathBuf, message: String },

    #[error("invalid workspace name: {0}")]
    InvalidName(String),
}

impl WorkspaceError {
    /// Stable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            WorkspaceError::PermissionDenied { .. } => "permission-denied",
            WorkspaceError::Os { .. } => "os-error",
            WorkspaceError::InvalidName(_) => "invalid-name",
        }
    }

    fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => WorkspaceError::PermissionDenied {
                path: path.to_path_buf(),
                message: err.to_string(),
            },
            _ => WorkspaceError::Os {
                path: path.to_path_buf(),
                message: err.to_string(),
            },
        }
    }
}

/// Derive the per-user path segment from an email address.
///
/// Uses the lowercased local part with anything outside `[a-z0-9_-]`
/// replaced by `_`.
pub fn user_segment(email: &str) -> Result<String, WorkspaceError> {
    let local = email.split('@').next().unwrap_or_default().trim();
    if local.is_empty() {
        return Err(WorkspaceError::InvalidName(email.to_string()));
    }

    let segment: String = local
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    Ok(segment)
}

/// A prepared workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Where this process created the directory.
    pub local_path: PathBuf,
    /// Where the container runtime finds the same directory.
    pub host_path: PathBuf,
}

/// Owner applied to new workspace directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceOwner {
    pub uid: u32,
    pub gid: u32,
}

/// Creates workspace directories under a base directory.
#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    base_dir: PathBuf,
    host_base_dir: Option<PathBuf>,
}

impl WorkspaceProvisioner {
    /// `host_base_dir` is the same directory as seen by the runtime daemon,
    /// when this process runs with the data directory mounted elsewhere.
    pub fn new(base_dir: impl Into<PathBuf>, host_base_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            host_base_dir,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Ensure the workspace for `segment` exists and is usable by `owner`.
    ///
    /// Falls back to mode 0777 when ownership cannot be changed.
    pub fn ensure(
        &self,
        segment: &str,
        owner: Option<WorkspaceOwner>,
    ) -> Result<Workspace, WorkspaceError> {
        if segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains('/')
            || segment.contains('\0')
        {
            return Err(WorkspaceError::InvalidName(segment.to_string()));
        }

        let local_path = self.base_dir.join(segment);
        fs::create_dir_all(&local_path).map_err(|e| WorkspaceError::from_io(&local_path, e))?;

        if let Some(owner) = owner {
            match std::os::unix::fs::chown(&local_path, Some(owner.uid), Some(owner.gid)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    log::warn!(
                        "cannot chown {} to {}:{} ({}), falling back to mode 0777",
                        local_path.display(),
                        owner.uid,
                        owner.gid,
                        e
                    );
                    fs::set_permissions(&local_path, fs::Permissions::from_mode(0o777))
                        .map_err(|e| WorkspaceError::from_io(&local_path, e))?;
                }
                Err(e) => return Err(WorkspaceError::from_io(&local_path, e)),
            }
        }

        let host_path = match &self.host_base_dir {
            Some(host_base) => host_base.join(segment),
            None => local_path.canonicalize().unwrap_or_else(|_| local_path.clone()),
        };

        log::debug!("workspace ready at {}", local_path.display());
        Ok(Workspace {
            local_path,
            host_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn segment_from_email() {
        assert_eq!(user_segment("Alice.Smith@uni.edu").unwrap(), "alice_smith");
        assert_eq!(user_segment("bob-2@x.org").unwrap(), "bob-2");
        assert_eq!(user_segment("o'neil+r@x.org").unwrap(), "o_neil_r");
        assert!(matches!(
            user_segment("@x.org"),
            Err(WorkspaceError::InvalidName(_))
        ));
    }

    #[test]
    fn creates_directory_without_owner() {
        let dir = TempDir::new().unwrap();
        let provisioner = WorkspaceProvisioner::new(dir.path(), None);
        let ws = provisioner.ensure("alice", None).unwrap();
        assert!(ws.local_path.is_dir());
        assert_eq!(ws.local_path, dir.path().join("alice"));
    }

    #[test]
    fn ensure_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let provisioner = WorkspaceProvisioner::new(dir.path(), None);
        provisioner.ensure("alice", None).unwrap();
        fs::write(dir.path().join("alice").join("notes.R"), "x <- 1").unwrap();
        provisioner.ensure("alice", None).unwrap();
        assert!(dir.path().join("alice").join("notes.R").exists());
    }

    #[test]
    fn owner_is_applied_or_mode_relaxed() {
        let dir = TempDir::new().unwrap();
        let provisioner = WorkspaceProvisioner::new(dir.path(), None);
        let owner = WorkspaceOwner {
            uid: 1000,
            gid: 1000,
        };
        let ws = provisioner.ensure("carol", Some(owner)).unwrap();
        let meta = fs::metadata(&ws.local_path).unwrap();
        let chowned = meta.uid() == 1000 && meta.gid() == 1000;
        let relaxed = meta.mode() & 0o777 == 0o777;
        assert!(chowned || relaxed);
    }

    #[test]
    fn host_base_dir_maps_path() {
        let dir = TempDir::new().unwrap();
        let provisioner =
            WorkspaceProvisioner::new(dir.path(), Some(PathBuf::from("/srv/user_data")));
        let ws = provisioner.ensure("dave", None).unwrap();
        assert_eq!(ws.host_path, PathBuf::from("/srv/user_data/dave"));
    }

    #[test]
    fn file_in_the_way_is_os_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("erin"), "not a dir").unwrap();
        let provisioner = WorkspaceProvisioner::new(dir.path(), None);
        let err = provisioner.ensure("erin", None).unwrap_err();
        assert_eq!(err.reason_code(), "os-error");
    }

    #[test]
    fn rejects_traversal_names() {
        let dir = TempDir::new().unwrap();
        let provisioner = WorkspaceProvisioner::new(dir.path(), None);
        assert_eq!(
            provisioner.ensure("..", None).unwrap_err().reason_code(),
            "invalid-name"
        );
        assert_eq!(
            provisioner.ensure("a/b", None).unwrap_err().reason_code(),
            "invalid-name"
        );
    }
}
