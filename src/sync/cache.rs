//! On-disk cache of downloaded documents, one directory per category

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::error::TransferError;
use super::types::{CachedFile, RemoteDocumentRef, identity_key};
use crate::category::Category;

/// Suffix of files that are still being written by a transfer.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Maps categories to cache directories under a private root.
///
/// Layout: `<root>/<category config key>/<identity key>`. All operations
/// tolerate concurrent creation and deletion of the category directory.
#[derive(Clone, Debug)]
pub struct DocumentCache {
    root: PathBuf,
}

impl DocumentCache {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn category_dir(&self, category: Category) -> PathBuf {
        self.root.join(category.config_key())
    }

    /// True iff the file for this URL's identity key is already cached.
    #[must_use]
    pub fn exists(&self, doc: &RemoteDocumentRef) -> bool {
        identity_key(&doc.url)
            .map(|name| self.category_dir(doc.category).join(name).is_file())
            .unwrap_or(false)
    }

    /// Destination path for `doc`, creating the category directory if needed.
    pub fn path_for(&self, doc: &RemoteDocumentRef) -> Result<PathBuf, TransferError> {
        let name =
            identity_key(&doc.url).ok_or_else(|| TransferError::InvalidUrl(doc.url.clone()))?;
        let dir = self.category_dir(doc.category);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(name))
    }

    /// The cached file for exactly this URL, if present.
    #[must_use]
    pub fn cached_file(&self, doc: &RemoteDocumentRef) -> Option<CachedFile> {
        let name = identity_key(&doc.url)?;
        let path = self.category_dir(doc.category).join(&name);
        describe(doc.category, &path)
    }

    /// Most recently modified complete file for the category.
    #[must_use]
    pub fn latest(&self, category: Category) -> Option<CachedFile> {
        let dir = self.category_dir(category);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to list cache directory {dir:?}: {e}");
                return None;
            }
        };

        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| !is_partial(path))
            .filter_map(|path| describe(category, &path))
            .max_by(|a, b| {
                a.modified
                    .cmp(&b.modified)
                    .then_with(|| a.identity_key.cmp(&b.identity_key))
            })
    }

    /// Remove every file in the category except `keep`.
    pub fn retain_only(&self, category: Category, keep: &str) -> io::Result<usize> {
        let dir = self.category_dir(category);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || is_partial(&path) || entry.file_name() == keep {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to evict {path:?}: {e}"),
            }
        }

        if removed > 0 {
            debug!("Evicted {removed} superseded file(s) for {category}");
        }
        Ok(removed)
    }

    /// Delete the category directory; a missing directory is not an error.
    pub fn clear(&self, category: Category) -> io::Result<()> {
        let dir = self.category_dir(category);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!("Cleared cache for {category}");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn clear_all(&self) -> io::Result<()> {
        for category in Category::ALL {
            self.clear(category)?;
        }
        Ok(())
    }
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX))
}

fn describe(category: Category, path: &Path) -> Option<CachedFile> {
    let meta = fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }

    Some(CachedFile {
        category,
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        identity_key: path.file_name()?.to_string_lossy().into_owned(),
        modified: meta.modified().ok()?,
    })
}
