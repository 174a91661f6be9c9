//! Watches pods bound to this node and stages attachment work.
//!
//! For every observed pod change the watcher computes the difference
//! between the previously observed and the current `networks` annotation,
//! writes the resulting expected configs, and enqueues reconciliation
//! events. Anything that can fail (runtime lookups) happens here, before
//! the enqueue, so queued events are self-sufficient; the parameters
//! themselves live on disk in the expected config, not in the event.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::runtime::watcher::watcher as watch_pods_stream;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cni::CniParameters;
use crate::k8s::networks::added_networks;
use crate::k8s::networks::managed_network_map;
use crate::k8s::networks::parse_networks;
use crate::k8s::networks::NetworkMap;
use crate::k8s::networks::NetworkProperty;
use crate::k8s::types::KubernetesError;
use crate::queue::AttachmentTuple;
use crate::queue::Event;
use crate::queue::EventOp;
use crate::queue::EventQueue;
use crate::runtime::ContainerRuntime;
use crate::store::record_key;
use crate::store::ConfigStore;
use crate::store::ExpectedConfig;
use crate::k8s::networks::removed_networks;
use crate::k8s::networks::NETWORKS_ANNOTATION;
use crate::store::Optype;

/// Watches pods on this node for `networks` annotation changes.
pub struct PodWatcher {
    node_name: String,
    store: Arc<ConfigStore>,
    queue: Arc<EventQueue>,
    runtime: Arc<dyn ContainerRuntime>,
    /// Last observed managed-network map per pod; the "old" side of the
    /// diff. The informer hands us whole objects, not old/new pairs.
    observed: Mutex<HashMap<String, NetworkMap>>,
}

impl PodWatcher {
    pub fn new(
        node_name: String,
        store: Arc<ConfigStore>,
        queue: Arc<EventQueue>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            node_name,
            store,
            queue,
            runtime,
            observed: Mutex::new(HashMap::new()),
        }
    }

    /// Watch pods until cancelled, restarting the stream when it fails.
    #[tracing::instrument(skip_all, fields(node_name = %self.node_name))]
    pub async fn run(
        &self,
        client: Client,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting pod watcher");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pod watcher shutdown requested");
                    break;
                }
                result = self.watch_pods(&client) => {
                    match result {
                        Ok(()) => {
                            warn!("Pod watch stream ended unexpectedly, restarting...");
                        }
                        Err(e) => {
                            error!("Pod watch failed: {e:?}");
                            // Wait before retrying
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn watch_pods(&self, client: &Client) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(client.clone());

        // There is no field selector for annotations; running pods bound to
        // this node is the closest the API can narrow it down for us.
        let config = watcher::Config::default().fields(&format!(
            "spec.nodeName={},status.phase=Running",
            self.node_name
        ));

        let mut stream = watch_pods_stream(api, config).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle_watch_event(event).await,
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        message: format!("Watch stream error: {e}"),
                    }));
                }
            }
        }

        Ok(())
    }

    async fn handle_watch_event(&self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                if let Err(e) = self.pod_applied(pod).await {
                    error!("Failed to handle pod event: {e:?}");
                }
            }
            watcher::Event::Delete(pod) => self.pod_deleted(&pod),
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    /// Handle a pod add or update: diff the annotation against the last
    /// observed state and stage the resulting adds and deletes.
    async fn pod_applied(&self, pod: Pod) -> Result<(), Report<KubernetesError>> {
        let Some(pod_name) = pod.metadata.name.clone() else {
            return Ok(());
        };

        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        let new_map = match annotations.get(NETWORKS_ANNOTATION) {
            // A parse failure drops the event without touching the observed
            // state; the next update re-evaluates the pod from scratch.
            Some(raw) => managed_network_map(&parse_networks(raw)?),
            None => NetworkMap::new(),
        };

        let old_map = {
            let mut observed = self.observed.lock().unwrap();
            observed
                .insert(pod_name.clone(), new_map.clone())
                .unwrap_or_default()
        };

        for network_name in removed_networks(&old_map, &new_map) {
            debug!(pod_name = %pod_name, network_name = %network_name, "Network removed from pod");
            if let Err(e) = self.del_network(&pod_name, &network_name) {
                error!(
                    pod_name = %pod_name,
                    network_name = %network_name,
                    "Failed to stage network delete: {e:?}"
                );
            }
        }

        for (network_name, property) in added_networks(&old_map, &new_map) {
            debug!(pod_name = %pod_name, network_name = %network_name, "Network added to pod");
            if let Err(e) = self
                .add_network(&pod, &pod_name, &network_name, &property)
                .await
            {
                error!(
                    pod_name = %pod_name,
                    network_name = %network_name,
                    "Failed to stage network add: {e:?}"
                );
            }
        }

        Ok(())
    }

    /// Handle a pod deletion: remove the pod's records without enqueueing
    /// deletes. The sandbox and its netns are gone with the pod, so plugin
    /// invocations could only fail; pending events for the pod resolve to a
    /// store miss and are dropped by the worker.
    fn pod_deleted(&self, pod: &Pod) {
        let Some(pod_name) = pod.metadata.name.clone() else {
            return;
        };
        debug!(pod_name = %pod_name, "Pod deleted");

        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        if let Some(raw) = annotations.get(NETWORKS_ANNOTATION) {
            match parse_networks(raw) {
                Ok(networks) => {
                    for network in networks.iter().filter(|network| network.is_managed()) {
                        let key = record_key(&pod_name, &network.network_name);
                        if let Err(e) = self.store.delete(&key) {
                            debug!(key = %key, "Could not remove config record: {e}");
                        }
                    }
                }
                Err(e) => {
                    debug!(
                        pod_name = %pod_name,
                        "Ignoring unparseable networks annotation on deleted pod: {e:?}"
                    );
                }
            }
        }

        self.observed.lock().unwrap().remove(&pod_name);
    }

    async fn add_network(
        &self,
        pod: &Pod,
        pod_name: &str,
        network_name: &str,
        property: &NetworkProperty,
    ) -> Result<(), Report<KubernetesError>> {
        let params = self
            .resolve_cni_params(pod, pod_name, network_name, property)
            .await?;

        let key = record_key(pod_name, network_name);
        self.store
            .save_expected(
                &key,
                ExpectedConfig {
                    optype: Optype::Add,
                    data: Some(params),
                },
            )
            .change_context(KubernetesError::StoreWrite {
                message: format!("failed to save expected add for {key}"),
            })?;

        self.queue.enqueue(Event {
            op: EventOp::Add,
            tuple: AttachmentTuple {
                pod_name: pod_name.to_string(),
                network_name: network_name.to_string(),
            },
        });
        Ok(())
    }

    fn del_network(
        &self,
        pod_name: &str,
        network_name: &str,
    ) -> Result<(), Report<KubernetesError>> {
        let key = record_key(pod_name, network_name);
        self.store
            .save_expected(
                &key,
                ExpectedConfig {
                    optype: Optype::Delete,
                    data: None,
                },
            )
            .change_context(KubernetesError::StoreWrite {
                message: format!("failed to save expected delete for {key}"),
            })?;

        self.queue.enqueue(Event {
            op: EventOp::Delete,
            tuple: AttachmentTuple {
                pod_name: pod_name.to_string(),
                network_name: network_name.to_string(),
            },
        });
        Ok(())
    }

    /// Compute the full attachment request for one (pod, network) pair at
    /// observation time.
    async fn resolve_cni_params(
        &self,
        pod: &Pod,
        pod_name: &str,
        network_name: &str,
        property: &NetworkProperty,
    ) -> Result<CniParameters, Report<KubernetesError>> {
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let container_id = first_container_id(pod).ok_or_else(|| {
            Report::new(KubernetesError::ContainerLookup {
                message: format!("pod {pod_name} has no container ID yet"),
            })
        })?;

        // the sandbox is the "pause" container
        let sandbox_id = self
            .runtime
            .get_sandbox_id(&container_id)
            .await
            .change_context(KubernetesError::ContainerLookup {
                message: format!("failed to get sandbox ID of pod {pod_name}"),
            })?;
        let netns_path = self
            .runtime
            .get_netns(&sandbox_id)
            .await
            .change_context(KubernetesError::ContainerLookup {
                message: format!("failed to get netns of sandbox {sandbox_id}"),
            })?;
        if netns_path.is_empty() {
            return Err(Report::new(KubernetesError::ContainerLookup {
                message: format!("sandbox {sandbox_id} has no network namespace"),
            }));
        }

        Ok(CniParameters {
            namespace,
            pod_name: pod_name.to_string(),
            sandbox_id,
            netns_path,
            network_name: network_name.to_string(),
            if_mac: property.if_mac.clone(),
        })
    }
}

/// The pod's first container ID with its `<runtime>://` scheme stripped.
fn first_container_id(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    let container_status = status.container_statuses.as_ref()?.first()?;
    let container_id = container_status.container_id.as_deref()?;
    let container_id = container_id
        .split_once("//")
        .map(|(_, id)| id)
        .unwrap_or(container_id);
    (!container_id.is_empty()).then(|| container_id.to_string())
}
