//! Content-addressed packaging of a client's deployable files
//!
//! A client ships its own binaries to every host it connects to. The set of
//! files is identified by a [`PackageHash`]: the package name plus an ordered
//! list of (relative path, SHA-256 digest) pairs. Hosts keep the last hash
//! they received for each package name, so a client only pushes its bundle
//! when something actually changed.
//!
//! # Bundle format
//!
//! ```text
//! zstd( bincode( BTreeMap<relative path, file bytes> ) )
//! ```
//!
//! Relative paths always use `/` separators.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// zstd level used for bundles
const BUNDLE_COMPRESSION_LEVEL: i32 = 3;

/// Extensions (besides the entry executable itself) that are part of a package
const DEPLOYABLE_EXTENSIONS: &[&str] = &["so", "dylib", "dll", "exe", "toml", "json", "config"];

/// Directories a host may create next to its own binary; never packaged
const EXCLUDED_DIRS: &[&str] = &["_dpack", "_dexec"];

/// Identity of a deployable file set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageHash {
    pub name: String,
    pub files: Vec<String>,
    pub hashes: Vec<String>,
}

impl PackageHash {
    /// Iterate (file, digest) pairs in order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(String::as_str).zip(self.hashes.iter().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl PartialEq for PackageHash {
    fn eq(&self, other: &Self) -> bool {
        if self.name != other.name {
            return false;
        }
        if self.files.len() != self.hashes.len() || other.files.len() != other.hashes.len() {
            return false;
        }
        self.files == other.files && self.hashes == other.hashes
    }
}

impl Eq for PackageHash {}

impl fmt::Display for PackageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} files)", self.name, self.files.len())
    }
}

/// Hashes and bundles the files under one root directory
#[derive(Debug, Clone)]
pub struct Packager {
    root: PathBuf,
    hash: PackageHash,
}

static CURRENT: OnceLock<Packager> = OnceLock::new();

impl Packager {
    /// Packager for the running executable, computed once per process
    ///
    /// The package is named after the executable and contains every
    /// deployable file under the executable's directory.
    pub fn current() -> Result<&'static Packager> {
        if let Some(packager) = CURRENT.get() {
            return Ok(packager);
        }

        let exe = std::env::current_exe().context("Failed to locate current executable")?;
        let root = exe
            .parent()
            .context("Current executable has no parent directory")?
            .to_path_buf();
        let name = exe
            .file_name()
            .context("Current executable has no file name")?
            .to_string_lossy()
            .into_owned();

        let packager = Packager::from_dir(root, name)?;
        // A racing initializer computed the same hash; either value is fine
        let _ = CURRENT.set(packager);
        CURRENT.get().context("Packager singleton not initialized")
    }

    /// Build a packager for an explicit root directory and package name
    pub fn from_dir(root: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self> {
        let root = root.into();
        let name = name.into();
        let hash = compute_hash(&root, &name)?;
        Ok(Self { root, hash })
    }

    pub fn hash(&self) -> &PackageHash {
        &self.hash
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read and compress every file listed in the hash
    pub fn bundle(&self) -> Result<Vec<u8>> {
        bundle(&self.root, &self.hash)
    }
}

/// Scan `root` for deployable files and hash each one
///
/// Files are sorted by relative path so the same tree always produces the
/// same hash.
pub fn compute_hash(root: &Path, name: &str) -> Result<PackageHash> {
    let mut files = Vec::new();
    collect_deployable(root, root, name, &mut files)
        .with_context(|| format!("Failed to scan package root: {}", root.display()))?;
    files.sort();

    let hashes = files
        .par_iter()
        .map(|rel| digest_file(&root.join(rel)))
        .collect::<Result<Vec<_>>>()?;

    Ok(PackageHash {
        name: name.to_string(),
        files,
        hashes,
    })
}

/// SHA-256 of a file's contents, hex encoded
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Pack every file listed in `hash` (relative to `root`) into one compressed bundle
pub fn bundle(root: &Path, hash: &PackageHash) -> Result<Vec<u8>> {
    let mut files = BTreeMap::new();
    for rel in &hash.files {
        let path = root.join(rel);
        let bytes = fs::read(&path)
            .with_context(|| format!("Failed to read package file: {}", path.display()))?;
        files.insert(rel.clone(), bytes);
    }

    let raw = bincode::serialize(&files).context("Failed to serialize package container")?;
    zstd::encode_all(&raw[..], BUNDLE_COMPRESSION_LEVEL).context("Failed to compress package")
}

/// Decompress a bundle and write every file under `target_dir`
///
/// Returns the number of files written.
pub fn unbundle(bytes: &[u8], target_dir: &Path) -> Result<usize> {
    let files = unpack_files(bytes)?;
    for (rel, content) in &files {
        let rel_path = safe_relative_path(rel)?;
        let dest = target_dir.join(rel_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::write(&dest, content)
            .with_context(|| format!("Failed to write package file: {}", dest.display()))?;
    }
    Ok(files.len())
}

/// Decompress a bundle into its path → content map without touching disk
pub fn unpack_files(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let raw = zstd::decode_all(bytes).context("Failed to decompress package")?;
    bincode::deserialize(&raw).context("Failed to deserialize package container")
}

fn safe_relative_path(rel: &str) -> Result<PathBuf> {
    let path = PathBuf::from(rel);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => anyhow::bail!("Package entry escapes target directory: {}", rel),
        }
    }
    Ok(path)
}

fn collect_deployable(root: &Path, dir: &Path, name: &str, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            let dir_name = entry.file_name();
            if EXCLUDED_DIRS.iter().any(|d| dir_name == *d) {
                continue;
            }
            collect_deployable(root, &path, name, out)?;
        } else if file_type.is_file() && is_deployable(&path, root, name) {
            let rel = path.strip_prefix(root)?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }
    Ok(())
}

fn is_deployable(path: &Path, root: &Path, name: &str) -> bool {
    if path.parent() == Some(root) && path.file_name().map(|f| f == name).unwrap_or(false) {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| DEPLOYABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app"), b"\x7fELF binary").unwrap();
        fs::write(dir.path().join("app.toml"), b"threads = 4").unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/libcompute.so"), vec![7u8; 4096]).unwrap();
        fs::write(dir.path().join("notes.txt"), b"not deployable").unwrap();
        fs::create_dir_all(dir.path().join("_dpack")).unwrap();
        fs::write(dir.path().join("_dpack/other.so"), b"host storage").unwrap();
        dir
    }

    #[test]
    fn test_compute_hash_selects_deployable_files() {
        let dir = sample_tree();
        let hash = compute_hash(dir.path(), "app").unwrap();

        assert_eq!(hash.name, "app");
        assert_eq!(hash.files, vec!["app", "app.toml", "lib/libcompute.so"]);
        assert_eq!(hash.hashes.len(), 3);
        assert!(hash.hashes.iter().all(|h| h.len() == 64));
    }

    #[test]
    fn test_hash_equality_is_order_and_content_sensitive() {
        let dir = sample_tree();
        let a = compute_hash(dir.path(), "app").unwrap();
        let b = compute_hash(dir.path(), "app").unwrap();
        assert_eq!(a, b);

        let mut renamed = b.clone();
        renamed.name = "other".to_string();
        assert_ne!(a, renamed);

        let mut reordered = b.clone();
        reordered.files.swap(0, 1);
        reordered.hashes.swap(0, 1);
        assert_ne!(a, reordered);

        fs::write(dir.path().join("app.toml"), b"threads = 8").unwrap();
        let changed = compute_hash(dir.path(), "app").unwrap();
        assert_ne!(a, changed);
        assert_eq!(a.hashes[0], changed.hashes[0]);
        assert_ne!(a.hashes[1], changed.hashes[1]);
    }

    #[test]
    fn test_mismatched_lengths_never_equal() {
        let a = PackageHash {
            name: "app".to_string(),
            files: vec!["app".to_string()],
            hashes: vec![],
        };
        assert_ne!(a, a.clone());
    }

    #[test]
    fn test_bundle_unbundle_reproduces_files() {
        let src = sample_tree();
        let packager = Packager::from_dir(src.path(), "app").unwrap();
        let bytes = packager.bundle().unwrap();

        let dest = TempDir::new().unwrap();
        let written = unbundle(&bytes, dest.path()).unwrap();
        assert_eq!(written, 3);

        for rel in &packager.hash().files {
            let original = fs::read(src.path().join(rel)).unwrap();
            let copy = fs::read(dest.path().join(rel)).unwrap();
            assert_eq!(original, copy, "{} differs", rel);
        }
        assert!(!dest.path().join("notes.txt").exists());

        let rehashed = compute_hash(dest.path(), "app").unwrap();
        assert_eq!(&rehashed, packager.hash());
    }

    #[test]
    fn test_unbundle_rejects_escaping_paths() {
        let mut files = BTreeMap::new();
        files.insert("../evil.so".to_string(), vec![1u8]);
        let raw = bincode::serialize(&files).unwrap();
        let bytes = zstd::encode_all(&raw[..], 3).unwrap();

        let dest = TempDir::new().unwrap();
        assert!(unbundle(&bytes, dest.path()).is_err());
    }

    #[test]
    fn test_unbundle_rejects_garbage() {
        let dest = TempDir::new().unwrap();
        assert!(unbundle(b"not a bundle", dest.path()).is_err());
    }
}
