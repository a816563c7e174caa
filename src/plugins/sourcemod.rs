// Bundled SourceMod plugins - enable or remove the plugins shipped with SourceMod

use crate::plugins::error::PluginError;
use crate::plugins::planner::split_plugin_list;
use std::fs;
use std::path::{Path, PathBuf};

const PLUGINS_DIR: &str = "tf/addons/sourcemod/plugins";

fn plugins_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(PLUGINS_DIR)
}

fn smx(name: &str) -> String {
    format!("{}.smx", name)
}

/// Move each named plugin out of `plugins/disabled/`. Returns the plugins enabled.
pub fn enable_bundled(data_dir: &Path, list: &str) -> Result<Vec<String>, PluginError> {
    let (names, _) = split_plugin_list(list, "enable");
    let dir = plugins_dir(data_dir);
    let mut enabled = Vec::new();

    for name in names {
        tracing::info!("Enabling plugin: {}", name);
        let from = dir.join("disabled").join(smx(name));
        if !from.exists() {
            tracing::warn!("Path does not exist: {:?}", from);
            continue;
        }
        let to = dir.join(smx(name));
        fs::rename(&from, &to).map_err(|e| PluginError::io(&from, e))?;
        enabled.push(name.to_string());
    }
    Ok(enabled)
}

/// Delete each named plugin from `plugins/`. Returns the plugins removed.
pub fn disable_bundled(data_dir: &Path, list: &str) -> Result<Vec<String>, PluginError> {
    let (names, _) = split_plugin_list(list, "disable");
    let dir = plugins_dir(data_dir);
    let mut disabled = Vec::new();

    for name in names {
        tracing::info!("Disabling plugin: {}", name);
        let path = dir.join(smx(name));
        if !path.exists() {
            tracing::warn!("Path does not exist: {:?}", path);
            continue;
        }
        fs::remove_file(&path).map_err(|e| PluginError::io(&path, e))?;
        disabled.push(name.to_string());
    }
    Ok(disabled)
}
