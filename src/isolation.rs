//! Per-slot isolation directories
//!
//! Every worker slot owns its own tool install root, so concurrent instances
//! never share patch-state or lock files. The slot root is reused for the whole
//! run; only its staging area is wiped between attempts.

use crate::config::{Config, LayoutConfig};
use crate::error::Result;
use crate::types::ItemId;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Staging subpaths the tool writes partial downloads to, relative to an install root
pub const STAGING_SUBDIRS: [&str; 3] = [
    "steamapps/workshop/downloads",
    "steamapps/workshop/temp",
    "steamapps/downloading",
];

/// Shared downloads directory scanned for leftover lock files
const SHARED_DOWNLOADS_SUBDIR: &str = "steamapps/workshop/downloads";

/// Extensions of stale lock/patch files removed from the shared root
const STALE_LOCK_EXTENSIONS: [&str; 2] = ["patch", "lock"];

/// Path of the finalized content directory below an install root
pub fn content_root(install_root: &Path, app_id: &str) -> PathBuf {
    install_root
        .join("steamapps")
        .join("workshop")
        .join("content")
        .join(app_id)
}

/// Allocates and resets isolation directories for worker slots
#[derive(Clone, Debug)]
pub struct IsolationManager {
    instances_root: PathBuf,
    prefix: String,
    app_id: String,
}

impl IsolationManager {
    /// Create a manager from the run configuration
    pub fn new(config: &Config) -> Self {
        Self::from_layout(&config.layout, &config.tool.app_id)
    }

    /// Create a manager from a layout and app id
    pub fn from_layout(layout: &LayoutConfig, app_id: &str) -> Self {
        Self {
            instances_root: layout.instances_root.clone(),
            prefix: layout.instance_prefix.clone(),
            app_id: app_id.to_string(),
        }
    }

    /// Root directory of a slot (not created)
    pub fn slot_root(&self, slot: usize) -> PathBuf {
        self.instances_root.join(format!("{}{}", self.prefix, slot))
    }

    /// Content directory of an item inside a slot's isolation directory
    pub fn item_dir(&self, slot: usize, id: &ItemId) -> PathBuf {
        content_root(&self.slot_root(slot), &self.app_id).join(id.as_str())
    }

    /// Create the slot directory if needed and return its root
    ///
    /// Idempotent. Existing content, including completed downloads that were
    /// never moved out, is left in place.
    pub async fn acquire(&self, slot: usize) -> Result<PathBuf> {
        let root = self.slot_root(slot);
        fs::create_dir_all(content_root(&root, &self.app_id)).await?;
        Ok(root)
    }

    /// Delete everything inside the slot's staging subpaths
    ///
    /// Only called while no instance is running in this slot. Content
    /// directories are never touched. Individual deletion failures are logged
    /// and skipped.
    pub async fn reset_staging(&self, slot: usize) {
        let root = self.slot_root(slot);
        for sub in STAGING_SUBDIRS {
            let dir = root.join(sub);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(slot, dir = %dir.display(), error = %e, "could not read staging dir");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let is_dir = entry.file_type().await.is_ok_and(|ft| ft.is_dir());
                let removed = if is_dir {
                    fs::remove_dir_all(&path).await
                } else {
                    fs::remove_file(&path).await
                };
                if let Err(e) = removed {
                    warn!(slot, path = %path.display(), error = %e, "could not clean staging entry");
                }
            }
            debug!(slot, dir = %dir.display(), "staging cleared");
        }
    }

    /// Reset staging for every slot in `0..slots`
    pub async fn reset_all(&self, slots: usize) {
        for slot in 0..slots {
            self.reset_staging(slot).await;
        }
    }
}

/// Remove leftover `.patch` and `.lock` files from the shared root's downloads area
///
/// Returns the number of files removed.
pub async fn clean_shared_locks(shared_root: &Path) -> usize {
    let dir = shared_root.join(SHARED_DOWNLOADS_SUBDIR);
    let Ok(mut entries) = fs::read_dir(&dir).await else {
        return 0;
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let stale = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| STALE_LOCK_EXTENSIONS.contains(&ext));
        if stale && entry.file_type().await.is_ok_and(|ft| ft.is_file()) {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove stale lock"),
            }
        }
    }
    if removed > 0 {
        debug!(removed, dir = %dir.display(), "removed stale shared lock files");
    }
    removed
}
