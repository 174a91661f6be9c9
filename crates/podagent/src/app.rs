//! Wires the components together and owns cancellation.
//!
//! Startup failures (bad kubeconfig, unreachable runtime, unusable CNI
//! config) are fatal and surface as a non-zero exit. After startup the
//! agent runs two background tasks: the pod watcher and the single
//! reconciliation worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cni::CniPlugin;
use crate::config::Cli;
use crate::config::ContainerKind;
use crate::k8s::PodWatcher;
use crate::kube_client;
use crate::queue::EventQueue;
use crate::reconciler::Reconciler;
use crate::runtime::ContainerRuntime;
use crate::runtime::CriRuntime;
use crate::runtime::DockerRuntime;
use crate::store::ConfigStore;
use crate::store::DEFAULT_CONFIG_DIR;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct App {
    tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl App {
    /// Connect every external collaborator and spawn the background tasks.
    pub async fn build(cli: Cli) -> Result<Self> {
        let client = kube_client::init_kube_client(cli.kubeconfig.clone())
            .await
            .map_err(|e| anyhow!("failed to create kubernetes client: {e:?}"))?;

        let runtime: Arc<dyn ContainerRuntime> = match cli.container_type {
            ContainerKind::Docker => {
                info!(endpoint = %cli.docker_endpoint, "Using docker container runtime");
                Arc::new(
                    DockerRuntime::connect(&cli.docker_endpoint)
                        .await
                        .map_err(|e| anyhow!("failed to connect to docker: {e:?}"))?,
                )
            }
            ContainerKind::Crio => {
                info!(endpoint = %cli.crio_endpoint, "Using CRI container runtime");
                Arc::new(
                    CriRuntime::connect(&cli.crio_endpoint)
                        .await
                        .map_err(|e| anyhow!("failed to connect to CRI runtime: {e:?}"))?,
                )
            }
        };

        let cni = Arc::new(
            CniPlugin::new(&cli.cni_conf_path, &cli.cni_bin_path, &cli.cni_vendor_name)
                .map_err(|e| anyhow!("failed to load CNI configuration: {e:?}"))?,
        );

        let store = Arc::new(ConfigStore::new(DEFAULT_CONFIG_DIR));
        let queue = Arc::new(EventQueue::new());
        let reconciler = Reconciler::new(store.clone(), queue.clone(), cni);
        let pod_watcher = PodWatcher::new(cli.node.clone(), store, queue, runtime);

        let cancellation_token = CancellationToken::new();
        let mut tasks = Vec::new();

        // one worker only: plugin invocations within a pod must not race
        let reconciler_task = {
            let token = cancellation_token.clone();
            tokio::spawn(async move {
                reconciler.run(token).await;
                info!("Reconciliation worker completed");
            })
        };
        tasks.push(reconciler_task);

        let watcher_task = {
            let token = cancellation_token.clone();
            tokio::spawn(async move {
                if let Err(e) = pod_watcher.run(client, token).await {
                    error!("Pod watcher failed: {e:?}");
                } else {
                    info!("Pod watcher completed");
                }
            })
        };
        tasks.push(watcher_task);

        Ok(Self {
            tasks,
            cancellation_token,
        })
    }

    /// Run until a shutdown signal arrives or a task dies.
    ///
    /// Shutdown is cooperative and drain is optional: the persisted
    /// expected/running state keeps attachments correct across restarts.
    pub async fn run(mut self) -> Result<()> {
        let signal_handler = {
            use tokio::signal::unix::signal;
            use tokio::signal::unix::SignalKind;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        tokio::select! {
            _ = signal_handler => {
                info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                if let Err(e) = result {
                    error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}
