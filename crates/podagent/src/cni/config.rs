//! Discovery and selection of the network-config chain.
//!
//! The config directory is scanned once at startup. Files are considered in
//! lexical order; the first one that parses to a chain with at least one
//! plugin wins. Unparseable files are logged and skipped so a single broken
//! drop-in cannot take the agent down with it.

use std::fs;
use std::path::Path;

use error_stack::Report;
use serde_json::Value;
use tracing::warn;

use crate::cni::CniError;

const CONFIG_SUFFIXES: [&str; 3] = [".conf", ".conflist", ".json"];

/// One plugin entry of a chain: its `type` plus the raw config object the
/// binary will receive on stdin.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub plugin_type: String,
    pub raw: Value,
}

/// A parsed network-config chain: either a `.conflist`, or a single-plugin
/// config lifted into a one-element chain.
#[derive(Debug, Clone)]
pub struct NetworkConfigList {
    pub name: String,
    pub cni_version: String,
    pub plugins: Vec<PluginConfig>,
}

impl NetworkConfigList {
    fn from_conflist(value: &Value) -> Result<Self, String> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let cni_version = value
            .get("cniVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let entries = value
            .get("plugins")
            .and_then(Value::as_array)
            .ok_or_else(|| "config list has no 'plugins' array".to_string())?;

        let mut plugins = Vec::with_capacity(entries.len());
        for entry in entries {
            let plugin_type = entry
                .get("type")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| "plugin entry has no 'type'".to_string())?;
            plugins.push(PluginConfig {
                plugin_type: plugin_type.to_string(),
                raw: entry.clone(),
            });
        }

        Ok(Self {
            name,
            cni_version,
            plugins,
        })
    }

    fn from_single_conf(value: &Value) -> Result<Self, String> {
        // A plain config must declare the plugin type; this also catches a
        // conflist mistakenly saved under a .conf name.
        let plugin_type = value
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "no 'type'; perhaps this is a .conflist?".to_string())?;

        Ok(Self {
            name: value
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            cni_version: value
                .get("cniVersion")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            plugins: vec![PluginConfig {
                plugin_type: plugin_type.to_string(),
                raw: value.clone(),
            }],
        })
    }
}

/// Select the default network-config chain from `conf_dir`.
pub fn load_default_network(conf_dir: &Path) -> Result<NetworkConfigList, Report<CniError>> {
    let mut files: Vec<_> = fs::read_dir(conf_dir)
        .map_err(|e| {
            Report::new(CniError::Config {
                message: format!(
                    "failed to read config directory {}: {e}",
                    conf_dir.display()
                ),
            })
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            CONFIG_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        })
        .collect();

    if files.is_empty() {
        return Err(Report::new(CniError::Config {
            message: format!("no networks found in {}", conf_dir.display()),
        }));
    }

    files.sort();
    for file in &files {
        let value: Value = match fs::read(file).map_err(|e| e.to_string()).and_then(|bytes| {
            serde_json::from_slice(&bytes).map_err(|e| e.to_string())
        }) {
            Ok(value) => value,
            Err(e) => {
                warn!("Error loading CNI config file {}: {e}", file.display());
                continue;
            }
        };

        let is_conflist = file
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".conflist"));
        let parsed = if is_conflist {
            NetworkConfigList::from_conflist(&value)
        } else {
            NetworkConfigList::from_single_conf(&value)
        };

        match parsed {
            Ok(network) if network.plugins.is_empty() => {
                warn!("CNI config list {} has no plugins, skipping", file.display());
            }
            Ok(network) => return Ok(network),
            Err(e) => {
                warn!("Error loading CNI config file {}: {e}", file.display());
            }
        }
    }

    Err(Report::new(CniError::Config {
        message: format!("no valid networks found in {}", conf_dir.display()),
    }))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn picks_first_valid_config_lexically() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("10-bridge.conf"), br#"{"cniVersion":"0.4.0","name":"bridge-net","type":"bridge"}"#).unwrap();
        fs::write(dir.path().join("20-macvlan.conf"), br#"{"cniVersion":"0.4.0","name":"macvlan-net","type":"macvlan"}"#).unwrap();

        let network = load_default_network(dir.path()).unwrap();
        assert_eq!(network.name, "bridge-net");
        assert_eq!(network.plugins.len(), 1);
        assert_eq!(network.plugins[0].plugin_type, "bridge");
    }

    #[test]
    fn skips_broken_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("00-broken.conf"), b"{ not json").unwrap();
        fs::write(dir.path().join("05-typeless.conf"), br#"{"name":"x"}"#).unwrap();
        fs::write(
            dir.path().join("10-chain.conflist"),
            br#"{"cniVersion":"0.4.0","name":"chained","plugins":[{"type":"macvlan"},{"type":"tuning"}]}"#,
        )
        .unwrap();

        let network = load_default_network(dir.path()).unwrap();
        assert_eq!(network.name, "chained");
        assert_eq!(network.plugins.len(), 2);
        assert_eq!(network.plugins[1].plugin_type, "tuning");
    }

    #[test]
    fn ignores_unrelated_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("README.md"), b"docs").unwrap();

        let err = load_default_network(dir.path()).unwrap_err();
        assert!(matches!(err.current_context(), CniError::Config { .. }));
    }

    #[test]
    fn empty_chain_is_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("10-empty.conflist"),
            br#"{"cniVersion":"0.4.0","name":"empty","plugins":[]}"#,
        )
        .unwrap();

        let err = load_default_network(dir.path()).unwrap_err();
        assert!(matches!(err.current_context(), CniError::Config { .. }));
    }
}
