//! Per-instance steamcmd command scripts

use crate::error::{Error, Result};
use crate::types::ItemId;
use std::fmt::Write as _;
use std::path::Path;

/// Render the `+runscript` file for one chunk
///
/// ```text
/// login anonymous
/// force_install_dir /abs/instances/rust_workshop_t0
/// workshop_download_item 252490 1234567
/// quit
/// ```
pub fn render_script(login: &str, install_root: &Path, app_id: &str, items: &[ItemId]) -> String {
    let mut script = String::new();
    // writing to a String cannot fail
    let _ = writeln!(script, "login {login}");
    let _ = writeln!(script, "force_install_dir {}", install_root.display());
    for id in items {
        let _ = writeln!(script, "workshop_download_item {app_id} {id}");
    }
    script.push_str("quit\n");
    script
}

/// Write a script for `slot`, creating its parent directory
pub async fn write_script(path: &Path, contents: &str, slot: usize) -> Result<()> {
    let wrap = |source| Error::ScriptCreation {
        slot,
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(wrap)?;
    }
    tokio::fs::write(path, contents).await.map_err(wrap)
}

/// Remove a script after use; failures are only logged
pub async fn remove_script(path: &Path, slot: usize) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(slot, script = %path.display(), error = %e, "could not delete script");
    }
}
