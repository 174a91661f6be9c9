//! Invocation of the selected plugin chain for a single attachment.
//!
//! Plugins are executed the way any CNI runtime executes them: binary
//! resolved from the search path, invocation parameters in `CNI_*`
//! environment variables, the network config on stdin, the result on
//! stdout. ADD walks the chain in order threading each result into the next
//! plugin's `prevResult`; DEL walks it in reverse.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::cni::config::load_default_network;
use crate::cni::config::NetworkConfigList;
use crate::cni::config::PluginConfig;
use crate::cni::CniError;

/// Interface name given to every secondary attachment inside the pod netns.
pub const ATTACHMENT_IFNAME: &str = "net1";

/// The concrete attachment request handed to the plugin chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniParameters {
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "PodName")]
    pub pod_name: String,
    #[serde(rename = "SandboxID")]
    pub sandbox_id: String,
    #[serde(rename = "NetnsPath")]
    pub netns_path: String,
    #[serde(rename = "NetworkName")]
    pub network_name: String,
    #[serde(rename = "IfMAC")]
    pub if_mac: String,
}

/// Seam between the reconciler and the plugin chain; lets tests record
/// invocations instead of spawning plugin binaries.
#[async_trait]
pub trait NetworkAttacher: Send + Sync {
    async fn add_network(&self, params: &CniParameters) -> Result<(), Report<CniError>>;
    async fn delete_network(&self, params: &CniParameters) -> Result<(), Report<CniError>>;
}

/// The selected network-config chain plus the plugin binary search path.
///
/// Read-only after construction.
pub struct CniPlugin {
    network: NetworkConfigList,
    search_paths: Vec<PathBuf>,
}

impl CniPlugin {
    /// Select the network-config chain from `conf_dir` and fix the binary
    /// search path. Fails when no usable chain exists.
    pub fn new(
        conf_dir: &Path,
        bin_dir: &Path,
        vendor_name: &str,
    ) -> Result<Self, Report<CniError>> {
        let network = load_default_network(conf_dir)?;
        let vendor_dir = vendor_cni_dir(vendor_name, &network.plugins[0].plugin_type);
        debug!(
            network_name = %network.name,
            plugin_type = %network.plugins[0].plugin_type,
            vendor_dir = %vendor_dir.display(),
            "Selected CNI network configuration"
        );

        Ok(Self {
            network,
            search_paths: vec![vendor_dir, bin_dir.to_path_buf()],
        })
    }

    fn find_plugin_binary(&self, plugin_type: &str) -> Result<PathBuf, String> {
        self.search_paths
            .iter()
            .map(|dir| dir.join(plugin_type))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                format!(
                    "failed to find plugin {plugin_type} in search path {:?}",
                    self.search_paths
                )
            })
    }

    fn search_path_env(&self) -> String {
        self.search_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// The per-invocation config: the plugin's entry with the chain name,
    /// CNI version and (for ADD) the previous plugin's result folded in.
    fn instantiate_conf(
        &self,
        plugin: &PluginConfig,
        prev_result: Option<Value>,
    ) -> Result<Vec<u8>, String> {
        let mut conf = plugin.raw.clone();
        let object = conf
            .as_object_mut()
            .ok_or_else(|| "plugin config is not a JSON object".to_string())?;
        object.insert("name".to_string(), Value::String(self.network.name.clone()));
        object.insert(
            "cniVersion".to_string(),
            Value::String(self.network.cni_version.clone()),
        );
        if let Some(prev) = prev_result {
            object.insert("prevResult".to_string(), prev);
        }

        serde_json::to_vec(&conf).map_err(|e| e.to_string())
    }

    async fn exec_plugin(
        &self,
        command: &'static str,
        plugin: &PluginConfig,
        params: &CniParameters,
        prev_result: Option<Value>,
    ) -> Result<Value, Report<CniError>> {
        let invocation_error = |message: String| CniError::Invocation {
            command,
            plugin_type: plugin.plugin_type.clone(),
            message,
        };

        let binary = self
            .find_plugin_binary(&plugin.plugin_type)
            .map_err(|message| Report::new(invocation_error(message)))?;
        let payload = self
            .instantiate_conf(plugin, prev_result)
            .map_err(|message| Report::new(invocation_error(message)))?;

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &params.sandbox_id)
            .env("CNI_NETNS", &params.netns_path)
            .env("CNI_IFNAME", ATTACHMENT_IFNAME)
            .env("CNI_ARGS", build_cni_args(params))
            .env("CNI_PATH", self.search_path_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Report::new(invocation_error(format!(
                    "failed to spawn {}: {e}",
                    binary.display()
                )))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| Report::new(invocation_error(format!("failed to write config: {e}"))))?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            Report::new(invocation_error(format!(
                "failed to collect plugin output: {e}"
            )))
        })?;

        if !output.status.success() {
            return Err(Report::new(invocation_error(plugin_failure_message(
                &output,
            ))));
        }

        if output.stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| Report::new(invocation_error(format!("invalid plugin result: {e}"))))
    }
}

#[async_trait]
impl NetworkAttacher for CniPlugin {
    async fn add_network(&self, params: &CniParameters) -> Result<(), Report<CniError>> {
        debug!(
            network_name = %params.network_name,
            plugin_type = %self.network.plugins[0].plugin_type,
            netns_path = %params.netns_path,
            "About to add CNI network"
        );

        let mut prev_result = None;
        for plugin in &self.network.plugins {
            let result = self
                .exec_plugin("ADD", plugin, params, prev_result.take())
                .await?;
            if !result.is_null() {
                prev_result = Some(result);
            }
        }
        Ok(())
    }

    async fn delete_network(&self, params: &CniParameters) -> Result<(), Report<CniError>> {
        debug!(
            network_name = %params.network_name,
            plugin_type = %self.network.plugins[0].plugin_type,
            "About to del CNI network"
        );

        for plugin in self.network.plugins.iter().rev() {
            self.exec_plugin("DEL", plugin, params, None).await?;
        }
        Ok(())
    }
}

/// Vendor-specific binary directory searched ahead of the default bin dir.
fn vendor_cni_dir(vendor_name: &str, plugin_type: &str) -> PathBuf {
    if vendor_name.is_empty() {
        PathBuf::from(format!("/opt/{plugin_type}/bin"))
    } else {
        PathBuf::from(format!("/opt/{vendor_name}/cni/bin"))
    }
}

/// The `CNI_ARGS` string carried to every plugin of the chain.
fn build_cni_args(params: &CniParameters) -> String {
    [
        ("IgnoreUnknown", "1"),
        ("K8S_POD_NAMESPACE", params.namespace.as_str()),
        ("K8S_POD_NAME", params.pod_name.as_str()),
        ("K8S_POD_INFRA_CONTAINER_ID", params.sandbox_id.as_str()),
        ("K8S_POD_NETWORK", params.network_name.as_str()),
        ("K8S_POD_IFMAC", params.if_mac.as_str()),
    ]
    .iter()
    .map(|(key, value)| format!("{key}={value}"))
    .collect::<Vec<_>>()
    .join(";")
}

/// A failing plugin reports a JSON error object on stdout; fall back to
/// stderr when it does not.
fn plugin_failure_message(output: &std::process::Output) -> String {
    #[derive(Deserialize)]
    struct PluginError {
        code: Option<u64>,
        msg: Option<String>,
        details: Option<String>,
    }

    let detail = match serde_json::from_slice::<PluginError>(&output.stdout) {
        Ok(plugin_error) => {
            let mut detail = format!(
                "code {}: {}",
                plugin_error.code.unwrap_or_default(),
                plugin_error.msg.unwrap_or_default()
            );
            if let Some(details) = plugin_error.details {
                detail.push_str(&format!(" ({details})"));
            }
            detail
        }
        Err(_) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    format!("{}: {detail}", output.status)
}
