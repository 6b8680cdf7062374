//! On-disk package store
//!
//! ```text
//! <package_dir>/<name>.pkg.json   hash descriptor
//! <package_dir>/<name>_pkg/       unpacked files
//! ```

use crate::error::DistError;
use crate::package::{self, PackageHash};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PackageStore {
    dir: PathBuf,
}

impl PackageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn descriptor_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.pkg.json", name))
    }

    pub fn files_dir(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_pkg", name))
    }

    /// Whether a package with this name has been stored
    pub fn exists(&self, name: &str) -> bool {
        self.descriptor_path(name).is_file() && self.files_dir(name).is_dir()
    }

    /// Stored hash descriptor for a package, if any
    pub fn stored_hash(&self, name: &str) -> Result<Option<PackageHash>> {
        validate_package_name(name)?;
        let path = self.descriptor_path(name);
        if !path.is_file() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read package descriptor: {}", path.display()))?;
        let hash = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse package descriptor: {}", path.display()))?;
        Ok(Some(hash))
    }

    /// Whether an equal package is already stored
    pub fn has_package(&self, hash: &PackageHash) -> Result<bool> {
        Ok(self.stored_hash(&hash.name)?.map(|stored| stored == *hash).unwrap_or(false)
            && self.files_dir(&hash.name).is_dir())
    }

    /// Replace a package's files and descriptor
    ///
    /// The files directory is deleted and recreated before unbundling; the
    /// descriptor is written last so a partial update never looks current.
    pub fn add_update(&self, hash: &PackageHash, bundle: &[u8]) -> Result<usize> {
        validate_package_name(&hash.name)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create package directory: {}", self.dir.display()))?;

        let descriptor = self.descriptor_path(&hash.name);
        if descriptor.exists() {
            fs::remove_file(&descriptor)
                .with_context(|| format!("Failed to remove descriptor: {}", descriptor.display()))?;
        }

        let files_dir = self.files_dir(&hash.name);
        if files_dir.exists() {
            debug!("Removing previous package files: {}", files_dir.display());
            fs::remove_dir_all(&files_dir)
                .with_context(|| format!("Failed to remove package files: {}", files_dir.display()))?;
        }
        fs::create_dir_all(&files_dir)
            .with_context(|| format!("Failed to create package files directory: {}", files_dir.display()))?;

        let written = package::unbundle(bundle, &files_dir)?;

        let json = serde_json::to_string_pretty(hash).context("Failed to serialize package descriptor")?;
        fs::write(&descriptor, json)
            .with_context(|| format!("Failed to write package descriptor: {}", descriptor.display()))?;

        info!("Stored package {} ({} files)", hash.name, written);
        Ok(written)
    }
}

/// A package name must be usable as a single file name
pub fn validate_package_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(DistError::InvalidArguments(format!("invalid package name '{}'", name)).into()),
    }
}

/// Copy a directory tree; returns the number of files copied
pub fn copy_dir_all(src: &Path, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create directory: {}", dest.display()))?;
    let mut copied = 0;
    for entry in fs::read_dir(src).with_context(|| format!("Failed to read directory: {}", src.display()))? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {} to {}", entry.path().display(), target.display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}
