//! Capture session: where frames go and how many are left.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("directory name is empty")]
    EmptyName,
    #[error("invalid directory name {0:?}: must be a relative path below the save root")]
    InvalidName(String),
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// File name for the `index`-th capture, e.g. `captured_image_3.jpg`.
pub fn image_file_name(prefix: &str, index: u32) -> String {
    format!("{prefix}{index}.jpg")
}

/// Resolve a user-supplied directory name under `root` without touching the filesystem.
///
/// The name is trimmed. Nested names like `people/alice` are allowed; absolute
/// paths and `..` components are not.
pub fn resolve_session_dir(root: &Path, name: &str) -> Result<PathBuf, SessionError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SessionError::EmptyName);
    }

    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SessionError::InvalidName(name.to_string()));
            }
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(SessionError::InvalidName(name.to_string()));
    }

    Ok(root.join(relative))
}

/// One labeled capture run: a target directory and a counter that runs 1..=quota.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    dir: PathBuf,
    next_index: u32,
    quota: u32,
    prefix: String,
}

impl CaptureSession {
    /// Validate `name`, create `<root>/<name>` (and the root) if missing.
    pub fn begin(root: &Path, name: &str, quota: u32, prefix: &str) -> Result<Self, SessionError> {
        let dir = resolve_session_dir(root, name)?;
        std::fs::create_dir_all(&dir).map_err(|source| SessionError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        tracing::info!(dir = %dir.display(), quota, "capture session started");

        Ok(Self {
            dir,
            next_index: 1,
            quota,
            prefix: prefix.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    /// Index the next saved frame will get.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Number of frames saved so far.
    pub fn saved(&self) -> u32 {
        self.next_index - 1
    }

    /// Path the next saved frame will be written to.
    pub fn next_path(&self) -> PathBuf {
        self.dir.join(image_file_name(&self.prefix, self.next_index))
    }

    /// Record one saved frame.
    pub fn advance(&mut self) {
        self.next_index += 1;
    }

    /// True once the counter has moved past the quota.
    pub fn is_complete(&self) -> bool {
        self.next_index > self.quota
    }
}
