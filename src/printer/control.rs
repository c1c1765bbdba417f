use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{BedloopError, Result};

/// Commands the driver can send to a printer.
pub trait PrinterControl: Send + Sync {
    /// Starts printing `path`. With `sd` set, `path` names a file on the
    /// printer's own storage.
    fn print_file(&self, path: &Path, sd: bool) -> Result<()>;

    fn reconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

impl<T: PrinterControl + ?Sized> PrinterControl for Arc<T> {
    fn print_file(&self, path: &Path, sd: bool) -> Result<()> {
        (**self).print_file(path, sd)
    }

    fn reconnect(&self) -> Result<()> {
        (**self).reconnect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// A printer fed by dropping files into a directory it watches, as with
/// printer firmwares and hosts that auto-print new uploads.
#[derive(Debug, Clone)]
pub struct WatchedFolderPrinter {
    dir: PathBuf,
}

impl WatchedFolderPrinter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl PrinterControl for WatchedFolderPrinter {
    fn print_file(&self, path: &Path, sd: bool) -> Result<()> {
        if sd {
            return Err(BedloopError::Script(format!(
                "{} is on SD card; a watched folder can only print host files",
                path.display()
            )));
        }
        let name = path.file_name().ok_or_else(|| {
            BedloopError::Script(format!("{} has no file name", path.display()))
        })?;
        let dest = self.dir.join(name);
        let tmp = dest.with_extension("part");
        fs::copy(path, &tmp)?;
        fs::rename(&tmp, &dest)?;
        tracing::info!(src = %path.display(), dest = %dest.display(), "Queued file for printer");
        Ok(())
    }

    fn reconnect(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.dir.is_dir()
    }
}
