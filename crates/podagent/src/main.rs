mod app;
mod cni;
mod config;
mod k8s;
mod kube_client;
mod logging;
mod queue;
mod reconciler;
mod runtime;
mod store;
mod version;

use anyhow::Result;
use clap::Parser;

use crate::app::App;
use crate::config::Cli;
use crate::version::VERSION;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    logging::init();

    tracing::info!(
        node = %cli.node,
        container_type = ?cli.container_type,
        cni_bin_path = %cli.cni_bin_path.display(),
        cni_conf_path = %cli.cni_conf_path.display(),
        "Starting podagent {}",
        &**VERSION
    );

    let app = App::build(cli).await?;
    app.run().await
}
