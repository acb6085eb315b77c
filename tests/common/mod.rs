//! Common test utilities for workshop-dl end-to-end tests

#[allow(dead_code)]
pub mod fake_steamcmd;

pub use fake_steamcmd::*;

use std::path::Path;
use std::time::Duration;
use workshop_dl::{Config, ItemId};

/// Configuration rooted in `root` that launches `tool`
#[allow(dead_code)]
pub fn test_config(root: &Path, tool: &Path) -> Config {
    let mut config = Config::default();
    config.tool.steamcmd_path = Some(tool.to_path_buf());
    config.tool.search_path = false;
    config.layout.shared_root = root.join("rust_workshop");
    config.layout.instances_root = root.join("instances");
    config.layout.log_dir = root.join("logs");
    config.layout.script_dir = root.join("temp_scripts");
    config.layout.failed_ids_file = root.join("failed_ids.txt");
    config.layout.report_file = root.join("download_report.txt");
    config.run.poll_interval = Duration::from_millis(50);
    config.retry.initial_delay = Duration::from_millis(50);
    config.retry.max_delay = Duration::from_millis(200);
    config.retry.jitter = false;
    config
}

/// `n` sequential seven-digit IDs starting at `first`
#[allow(dead_code)]
pub fn ids(first: u64, n: u64) -> Vec<ItemId> {
    (first..first + n)
        .map(|i| ItemId::new(i.to_string()))
        .collect()
}

/// Shared destination directory of an item
#[allow(dead_code)]
pub fn shared_item_dir(config: &Config, id: &ItemId) -> std::path::PathBuf {
    config
        .layout
        .shared_root
        .join("steamapps/workshop/content")
        .join(&config.tool.app_id)
        .join(id.as_str())
}
