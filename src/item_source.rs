//! Item lists: the identifier source and the persisted retry list

use crate::error::{Error, Result};
use crate::types::ItemId;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

/// Quoted numeric string of 6 to 12 digits
static QUOTED_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(\d{6,12})""#).expect("quoted id regex is valid") // Static pattern, safe to panic
});

/// Extract workshop IDs from arbitrary text, deduplicated in first-seen order
///
/// The source is usually a JSON export, but any format that quotes the IDs
/// works; the structure around them is ignored.
pub fn extract_identifiers(text: &str) -> Vec<ItemId> {
    let mut seen = HashSet::new();
    QUOTED_ID
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|id| seen.insert(*id))
        .map(ItemId::from)
        .collect()
}

/// Read an item list and extract its identifiers
///
/// # Errors
///
/// Returns [`Error::ItemSource`] if the file cannot be read. An empty result
/// is not an error here.
pub async fn load_identifiers(path: &Path) -> Result<Vec<ItemId>> {
    let bytes = tokio::fs::read(path).await.map_err(|e| Error::ItemSource {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(extract_identifiers(&String::from_utf8_lossy(&bytes)))
}

/// Read the retry list written by a previous run; a missing file is empty
pub async fn load_failed_ids(path: &Path) -> Result<Vec<ItemId>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ItemId::from)
        .collect())
}

/// Write the retry list, one ID per line
pub async fn write_failed_ids(path: &Path, ids: &[ItemId]) -> Result<()> {
    let mut contents = String::with_capacity(ids.len() * 11);
    for id in ids {
        contents.push_str(id.as_str());
        contents.push('\n');
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}
