//! Installed-plugin registry.
//!
//! The daemon tracks manifests, run state and per-plugin data; actually
//! supervising plugin processes is the plugin service's job, reached
//! through its own PluginService-mode connection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;
use tracing::info;

use dcs_core::error::IpcError;
use dcs_core::session::Permission;

/// Manifest shipped inside a plugin package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub sbc_permissions: HashSet<Permission>,
    #[serde(default)]
    pub sbc_executable: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PluginState {
    pub manifest: PluginManifest,
    pub running: bool,
    pub data: Map<String, Value>,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, PluginState>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, manifest_path: &Path) -> Result<String, IpcError> {
        let raw = std::fs::read(manifest_path).map_err(|err| {
            IpcError::invalid_argument(format!(
                "cannot read plugin manifest {}: {err}",
                manifest_path.display()
            ))
        })?;
        let manifest: PluginManifest = serde_json::from_slice(&raw)
            .map_err(|err| IpcError::invalid_argument(format!("invalid plugin manifest: {err}")))?;
        if manifest.id.is_empty() {
            return Err(IpcError::invalid_argument("plugin manifest has no id"));
        }

        let mut plugins = self.plugins.write().expect("plugin table poisoned");
        if plugins.contains_key(&manifest.id) {
            return Err(IpcError::already_exists(format!(
                "plugin {} is already installed",
                manifest.id
            )));
        }
        let id = manifest.id.clone();
        info!(event = "plugin_installed", plugin = %id, version = %manifest.version);
        plugins.insert(
            id.clone(),
            PluginState {
                manifest,
                running: false,
                data: Map::new(),
            },
        );
        Ok(id)
    }

    pub fn start(&self, id: &str) -> Result<(), IpcError> {
        let mut plugins = self.plugins.write().expect("plugin table poisoned");
        let plugin = plugins
            .get_mut(id)
            .ok_or_else(|| IpcError::not_found(format!("plugin {id} is not installed")))?;
        plugin.running = true;
        info!(event = "plugin_started", plugin = %id);
        Ok(())
    }

    pub fn stop(&self, id: &str) -> Result<(), IpcError> {
        let mut plugins = self.plugins.write().expect("plugin table poisoned");
        let plugin = plugins
            .get_mut(id)
            .ok_or_else(|| IpcError::not_found(format!("plugin {id} is not installed")))?;
        plugin.running = false;
        info!(event = "plugin_stopped", plugin = %id);
        Ok(())
    }

    pub fn uninstall(&self, id: &str) -> Result<(), IpcError> {
        let mut plugins = self.plugins.write().expect("plugin table poisoned");
        match plugins.get(id) {
            None => return Err(IpcError::not_found(format!("plugin {id} is not installed"))),
            Some(plugin) if plugin.running => {
                return Err(IpcError::invalid_argument(format!(
                    "plugin {id} must be stopped before uninstalling"
                )))
            }
            Some(_) => {}
        }
        plugins.remove(id);
        info!(event = "plugin_uninstalled", plugin = %id);
        Ok(())
    }

    /// Store one data key and return the plugin's fresh data map for model
    /// publication.
    pub fn set_data(&self, id: &str, key: &str, value: Value) -> Result<Value, IpcError> {
        let mut plugins = self.plugins.write().expect("plugin table poisoned");
        let plugin = plugins
            .get_mut(id)
            .ok_or_else(|| IpcError::not_found(format!("plugin {id} is not installed")))?;
        plugin.data.insert(key.to_string(), value);
        Ok(Value::Object(plugin.data.clone()))
    }

    pub fn declared_permissions(&self, id: &str) -> Option<HashSet<Permission>> {
        self.plugins
            .read()
            .expect("plugin table poisoned")
            .get(id)
            .map(|plugin| plugin.manifest.sbc_permissions.clone())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.plugins
            .read()
            .expect("plugin table poisoned")
            .get(id)
            .map(|plugin| plugin.running)
            .unwrap_or(false)
    }
}
