//! CNI plugin chain adapter.
//!
//! One network-config chain is selected at startup from the configured
//! directory and used for every attachment; the chain is not reloaded at
//! runtime. [`CniPlugin`] invokes the chain's plugin binaries for a single
//! attachment described by [`CniParameters`].

mod config;
mod plugin;

pub use config::load_default_network;
pub use config::NetworkConfigList;
pub use plugin::CniParameters;
pub use plugin::CniPlugin;
pub use plugin::NetworkAttacher;
pub use plugin::ATTACHMENT_IFNAME;

use thiserror::Error;

/// Errors raised by the CNI adapter.
#[derive(Debug, Error)]
pub enum CniError {
    #[error("Failed to load CNI network configuration: {message}")]
    Config { message: String },
    #[error("CNI {command} failed for plugin {plugin_type}: {message}")]
    Invocation {
        command: &'static str,
        plugin_type: String,
        message: String,
    },
}
