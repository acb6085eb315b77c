//! Reconciliation of classified outcomes against the filesystem
//!
//! The filesystem is the ground truth. An item counts as downloaded only if
//! its directory in the shared destination holds at least one non-empty
//! regular file, whatever the tool printed.

use crate::isolation::{IsolationManager, content_root};
use crate::types::{ItemId, Outcome};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Whether `dir` exists and contains at least one regular file with size > 0
pub fn folder_has_files(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| {
            entry.file_type().is_file() && entry.metadata().is_ok_and(|meta| meta.len() > 0)
        })
}

/// What happened when moving an item into the shared destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveResult {
    /// The isolation copy was moved into place
    Moved,
    /// The destination already held the item; no move was attempted
    AlreadyPresent,
    /// The isolation directory held no files for the item
    NothingToMove,
    /// Both rename and copy failed
    Failed(String),
}

/// Move `src` into `dst` unless `dst` already holds the item
///
/// Tries a rename first and falls back to copy-then-delete for moves across
/// filesystems. A stale, empty `dst` is replaced.
pub fn move_item(src: &Path, dst: &Path) -> MoveResult {
    move_item_with(src, dst, |from, to| fs::rename(from, to))
}

fn move_item_with<F>(src: &Path, dst: &Path, rename: F) -> MoveResult
where
    F: Fn(&Path, &Path) -> io::Result<()>,
{
    if folder_has_files(dst) {
        if src.exists()
            && let Err(e) = fs::remove_dir_all(src)
        {
            debug!(src = %src.display(), error = %e, "could not remove redundant isolation copy");
        }
        return MoveResult::AlreadyPresent;
    }
    if !folder_has_files(src) {
        return MoveResult::NothingToMove;
    }

    if dst.exists()
        && let Err(e) = fs::remove_dir_all(dst)
    {
        return MoveResult::Failed(format!("cannot replace empty {}: {}", dst.display(), e));
    }
    if let Some(parent) = dst.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        return MoveResult::Failed(format!("cannot create {}: {}", parent.display(), e));
    }

    match rename(src, dst) {
        Ok(()) => MoveResult::Moved,
        Err(rename_err) => {
            debug!(src = %src.display(), error = %rename_err, "rename failed, copying instead");
            match copy_into_place(src, dst) {
                Ok(()) => MoveResult::Moved,
                Err(e) => MoveResult::Failed(format!("rename: {}; copy: {}", rename_err, e)),
            }
        }
    }
}

/// Sibling of `dst` that a copy is assembled in before it is renamed into place
fn partial_path(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(".{name}.partial"))
}

/// Copy `src` next to `dst`, then rename the finished copy onto `dst`
///
/// `dst` never holds a truncated tree: a failed copy is removed again and
/// the isolation copy stays where it was.
fn copy_into_place(src: &Path, dst: &Path) -> io::Result<()> {
    let partial = partial_path(dst);
    if partial.exists() {
        fs::remove_dir_all(&partial)?;
    }

    if let Err(e) = copy_dir_all(src, &partial).and_then(|()| fs::rename(&partial, dst)) {
        if partial.exists()
            && let Err(cleanup) = fs::remove_dir_all(&partial)
        {
            warn!(path = %partial.display(), error = %cleanup, "could not remove partial copy");
        }
        return Err(e);
    }

    if let Err(e) = fs::remove_dir_all(src) {
        debug!(src = %src.display(), error = %e, "could not remove copied isolation dir");
    }
    Ok(())
}

fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Final outcome for one item and whether it contradicts the tool's claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Authoritative outcome, never `Unknown` or `Skipped`
    pub outcome: Outcome,
    /// The tool reported success but nothing materialized
    pub discrepancy: bool,
}

/// Derive the authoritative outcome
///
/// In priority order: physical presence wins; a success claim without files
/// becomes `ValidationFailed`; a hard timeout overrides other failures; an
/// unclassified item becomes `GenericError`.
pub fn decide(classified: Outcome, present: bool, hard_timeout: bool) -> Decision {
    let (outcome, discrepancy) = if present {
        (Outcome::Success, false)
    } else if classified == Outcome::Success {
        (Outcome::ValidationFailed, true)
    } else if hard_timeout {
        (Outcome::Timeout, false)
    } else {
        match classified {
            Outcome::Unknown | Outcome::Skipped => (Outcome::GenericError, false),
            other => (other, false),
        }
    };
    Decision {
        outcome,
        discrepancy,
    }
}

/// Reconciled state of one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDecision {
    /// Item ID
    pub id: ItemId,
    /// What the classifier said
    pub classified: Outcome,
    /// Result of the move attempt
    pub moved: MoveResult,
    /// Whether the item is present in the shared destination
    pub present: bool,
    /// Final decision
    pub decision: Decision,
}

/// Moves finished items from isolation directories into the shared destination
#[derive(Debug, Clone)]
pub struct Reconciler {
    isolation: IsolationManager,
    shared_content: PathBuf,
}

impl Reconciler {
    /// Create a reconciler for a shared root and app id
    pub fn new(isolation: IsolationManager, shared_root: &Path, app_id: &str) -> Self {
        Self {
            isolation,
            shared_content: content_root(shared_root, app_id),
        }
    }

    /// Shared content directory holding every finished item
    pub fn shared_content(&self) -> &Path {
        &self.shared_content
    }

    /// Shared destination directory of an item
    pub fn shared_item_dir(&self, id: &ItemId) -> PathBuf {
        self.shared_content.join(id.as_str())
    }

    /// Whether the item is already present in the shared destination
    pub fn is_present(&self, id: &ItemId) -> bool {
        folder_has_files(&self.shared_item_dir(id))
    }

    /// Move and decide a single item
    pub fn reconcile_item(
        &self,
        slot: usize,
        id: &ItemId,
        classified: Outcome,
        hard_timeout: bool,
    ) -> ItemDecision {
        let dst = self.shared_item_dir(id);
        let moved = move_item(&self.isolation.item_dir(slot, id), &dst);
        if let MoveResult::Failed(reason) = &moved {
            warn!(slot, item = %id, reason, "could not move item to shared destination");
        }
        let present = folder_has_files(&dst);
        let decision = decide(classified, present, hard_timeout);
        if decision.discrepancy {
            warn!(
                slot,
                item = %id,
                "steamcmd reported success but no files were found, treating as validation failure"
            );
        }
        ItemDecision {
            id: id.clone(),
            classified,
            moved,
            present,
            decision,
        }
    }

    /// Reconcile every item of a finished chunk, in chunk order
    pub fn reconcile_chunk(
        &self,
        slot: usize,
        items: &[(ItemId, Outcome)],
        hard_timeout: bool,
    ) -> Vec<ItemDecision> {
        items
            .iter()
            .map(|(id, classified)| self.reconcile_item(slot, id, *classified, hard_timeout))
            .collect()
    }
}
