//! On-disk cache layout and content-addressed dependency keys.
//!
//! Layout under the cache root (default `~/.buns`):
//!
//! ```text
//! bun/<version>/bun            cached Bun binaries
//! deps/<sha256>/node_modules   installed dependency trees
//! index/bun-versions.json      cached version index
//! index/fetched_at             index fetch timestamp
//! ```

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Manages the buns cache directory.
#[derive(Debug, Clone)]
pub struct Cache {
    base_dir: PathBuf,
}

impl Cache {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    /// Cache at the default location: `BUNS_CACHE_DIR` if set, else
    /// `~/.buns`.
    pub fn default_location() -> Result<Self> {
        if let Ok(dir) = std::env::var("BUNS_CACHE_DIR") {
            if !dir.is_empty() {
                return Ok(Self::new(dir));
            }
        }
        let home = dirs::home_dir().context("failed to determine home directory")?;
        Ok(Self::new(home.join(".buns")))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn bun_dir(&self) -> PathBuf {
        self.base_dir.join("bun")
    }

    pub fn deps_dir(&self) -> PathBuf {
        self.base_dir.join("deps")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.base_dir.join("index")
    }

    pub fn deps_dir_for_hash(&self, hash: &str) -> PathBuf {
        self.deps_dir().join(hash)
    }

    /// True when the dependency tree for `hash` exists and its
    /// `node_modules` contains at least one entry. Any I/O error counts
    /// as a miss.
    pub fn is_deps_hit(&self, hash: &str) -> bool {
        let node_modules = self.deps_dir_for_hash(hash).join("node_modules");
        match fs::read_dir(&node_modules) {
            Ok(mut entries) => entries.next().is_some(),
            Err(_) => false,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.bun_dir(), self.deps_dir(), self.index_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn clean_bun(&self) -> Result<()> {
        remove_tree(&self.bun_dir())
    }

    pub fn clean_deps(&self) -> Result<()> {
        remove_tree(&self.deps_dir())
    }

    pub fn clean_index(&self) -> Result<()> {
        remove_tree(&self.index_dir())
    }

    pub fn clean_all(&self) -> Result<()> {
        remove_tree(&self.base_dir)
    }

    /// Names of cached Bun versions. Missing subtree yields an empty list.
    pub fn list_bun_versions(&self) -> Result<Vec<String>> {
        list_subdirs(&self.bun_dir())
    }

    /// Cached dependency hashes. Missing subtree yields an empty list.
    pub fn list_deps_hashes(&self) -> Result<Vec<String>> {
        list_subdirs(&self.deps_dir())
    }

    /// Total cache size in bytes. Symlinks are not followed, so cycles
    /// cannot hang the traversal.
    pub fn size(&self) -> Result<u64> {
        fn walk(dir: &Path, total: &mut u64) -> std::io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let meta = entry.path().symlink_metadata()?;
                if meta.is_dir() {
                    walk(&entry.path(), total)?;
                } else {
                    *total += meta.len();
                }
            }
            Ok(())
        }

        let mut total = 0u64;
        match walk(&self.base_dir, &mut total) {
            Ok(()) => Ok(total),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).context("failed to compute cache size"),
        }
    }
}

/// Content-addressed key for a package list: lowercase each spec, sort,
/// join with newlines, SHA-256, lowercase hex.
///
/// The constraint string is hashed as written, so `zod@^3.0` and `zod@^3`
/// address distinct caches. Duplicate specs survive as duplicate lines
/// and change the key.
pub fn hash_packages(packages: &[String]) -> String {
    let mut normalized: Vec<String> = packages.iter().map(|p| p.to_lowercase()).collect();
    normalized.sort();

    let joined = normalized.join("\n");
    let digest = Sha256::digest(joined.as_bytes());
    hex::encode(digest)
}

fn remove_tree(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", dir.display())),
    }
}

fn list_subdirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", dir.display())),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}
