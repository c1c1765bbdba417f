use std::path::{Component, Path, PathBuf};

/// Maps queued file paths to files on local disk.
#[derive(Debug, Clone)]
pub struct FileLocator {
    upload_dir: PathBuf,
}

impl FileLocator {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Local path for a queued file, or `None` if it lives on the printer's
    /// SD card, escapes the upload directory or does not exist.
    pub fn resolve(&self, path: &str, sd: bool) -> Option<PathBuf> {
        if sd {
            return None;
        }
        let full = self.join(path)?;
        full.is_file().then_some(full)
    }

    /// Whether a set's file can be printed from here. SD card files are
    /// assumed present since the printer's card can't be inspected.
    pub fn is_printable(&self, path: &str, sd: bool) -> bool {
        sd || self.resolve(path, sd).is_some()
    }

    /// Destination for `path` under the upload directory, rejecting
    /// absolute paths and parent traversal.
    pub fn join(&self, path: &str) -> Option<PathBuf> {
        let rel = Path::new(path);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(self.upload_dir.join(rel))
    }
}
