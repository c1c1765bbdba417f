//! `.gjob` archives: a zip holding `manifest.json` plus every file the job
//! prints, stored under its set path.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{BedloopError, Result};
use crate::storage::files::FileLocator;
use crate::storage::manifest::JobManifest;

const MANIFEST_NAME: &str = "manifest.json";

/// Writes `manifest` and its local files to a `.gjob` archive at `dest`.
/// SD card files are listed in the manifest but can't be packed.
pub fn pack(manifest: &JobManifest, locator: &FileLocator, dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(MANIFEST_NAME, options)?;
    zip.write_all(manifest.to_json()?.as_bytes())?;

    let mut packed = Vec::new();
    for set in &manifest.sets {
        if packed.contains(&set.path) {
            continue;
        }
        if set.sd {
            tracing::warn!(path = %set.path, "Skipping SD card file in archive");
            continue;
        }
        let src = locator
            .resolve(&set.path, false)
            .ok_or_else(|| BedloopError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", set.path),
            )))?;
        zip.start_file(set.path.as_str(), options)?;
        zip.write_all(&fs::read(src)?)?;
        packed.push(set.path.clone());
    }

    zip.finish()?;
    tracing::info!(job = %manifest.name, dest = %dest.display(), files = packed.len(), "Exported job");
    Ok(())
}

/// Reads the manifest of a `.gjob` without extracting anything.
pub fn read_manifest(src: &Path) -> Result<JobManifest> {
    let mut archive = ZipArchive::new(File::open(src)?)?;
    let mut entry = archive.by_name(MANIFEST_NAME)?;
    let mut data = String::new();
    entry.read_to_string(&mut data)?;
    JobManifest::from_json(&data)
}

/// Extracts the files of a `.gjob` into the upload directory and returns
/// its manifest. Entries that would escape the directory are skipped.
pub fn unpack(src: &Path, locator: &FileLocator) -> Result<JobManifest> {
    let manifest = read_manifest(src)?;
    let mut archive = ZipArchive::new(File::open(src)?)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || entry.name() == MANIFEST_NAME {
            continue;
        }
        let Some(dest) = entry
            .enclosed_name()
            .and_then(|p| locator.join(&p.to_string_lossy()))
        else {
            tracing::warn!(entry = entry.name(), "Skipping archive entry outside upload dir");
            continue;
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    tracing::info!(job = %manifest.name, src = %src.display(), "Imported job archive");
    Ok(manifest)
}
