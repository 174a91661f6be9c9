//! Reconciliation worker: drives each attachment record to its expected
//! state.
//!
//! A single worker consumes the event queue, so reconciliation is
//! serialized per node — plugin chains mutate kernel state tied to a pod's
//! netns and must not race. Every plugin invocation is bracketed by a
//! persisted `Dirty` state: after a crash at any point, the record reads as
//! "needs replay" and the next pass either finishes the add or finishes the
//! delete. Failed events are re-enqueued; liveness comes from the expected
//! state being durable, not from retry counters.

use std::sync::Arc;

use error_stack::Report;
use thiserror::Error;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cni::CniError;
use crate::cni::NetworkAttacher;
use crate::queue::Event;
use crate::queue::EventQueue;
use crate::store::record_key;
use crate::store::ConfigRecord;
use crate::store::ConfigStore;
use crate::store::Optype;
use crate::store::RunningConfig;
use crate::store::RunningState;
use crate::store::StoreError;

#[derive(Debug, Error)]
enum ApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Plugin(Report<CniError>),
}

pub struct Reconciler {
    store: Arc<ConfigStore>,
    queue: Arc<EventQueue>,
    plugin: Arc<dyn NetworkAttacher>,
}

impl Reconciler {
    pub fn new(
        store: Arc<ConfigStore>,
        queue: Arc<EventQueue>,
        plugin: Arc<dyn NetworkAttacher>,
    ) -> Self {
        Self {
            store,
            queue,
            plugin,
        }
    }

    /// Consume the queue until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("Starting reconciliation worker");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Reconciliation worker shutdown requested");
                    break;
                }
                event = self.queue.next() => {
                    self.process(event).await;
                }
            }
        }
    }

    /// Reconcile one attachment against its stored record.
    pub(crate) async fn process(&self, event: Event) {
        let key = record_key(&event.tuple.pod_name, &event.tuple.network_name);
        let record = match self.store.get(&key) {
            Ok(record) => record,
            Err(StoreError::Missing { .. }) => {
                // expected after a pod-delete race: the record is gone and
                // the event has nothing left to act on
                debug!(key, "No config record for event, dropping");
                return;
            }
            Err(e) => {
                // a corrupt record is repaired by the next expected write
                error!(key, "Failed to load config record, dropping event: {e}");
                return;
            }
        };

        match record.expected.optype {
            Optype::Add => self.reconcile_add(&key, record, &event).await,
            Optype::Delete => self.reconcile_delete(&key, record, &event).await,
        }
    }

    async fn reconcile_add(&self, key: &str, record: ConfigRecord, event: &Event) {
        if record.running.state == RunningState::Nil {
            if let Err(e) = self.apply_add(key, record).await {
                error!(key, "Failed adding network: {e}");
                self.requeue(event);
            }
            return;
        }

        // Dirty means an earlier pass died mid-flight; a parameter mismatch
        // means the annotation changed under an active attachment. Both are
        // replayed as delete-then-add.
        if record.running.state == RunningState::Dirty
            || !self
                .store
                .is_config_same(&record.expected, &record.running)
        {
            if let Err(e) = self.apply_delete(key, record.clone()).await {
                error!(key, "Failed deleting network for replay: {e}");
                self.requeue(event);
                return;
            }
            if let Err(e) = self.apply_add(key, record).await {
                error!(key, "Failed adding network: {e}");
                self.requeue(event);
            }
            return;
        }

        debug!(key, "Network already running with expected parameters, ignoring");
    }

    async fn reconcile_delete(&self, key: &str, record: ConfigRecord, event: &Event) {
        if record.running.state == RunningState::Nil {
            debug!(key, "Network not added, ignoring delete");
            return;
        }
        if let Err(e) = self.apply_delete(key, record).await {
            error!(key, "Failed deleting network: {e}");
            self.requeue(event);
        }
    }

    async fn apply_add(&self, key: &str, mut record: ConfigRecord) -> Result<(), ApplyError> {
        let Some(params) = record.expected.data.clone() else {
            // malformed record; dropping it lets the next expected write repair it
            error!(key, "Expected add carries no parameters, dropping");
            return Ok(());
        };

        record.running = RunningConfig {
            state: RunningState::Dirty,
            data: Some(params.clone()),
        };
        // The save fails when the pod was deleted in between and the record
        // is gone; the caller re-enqueues and the next pass drops the event
        // on the store miss.
        self.store.save_running(key, record.running.clone())?;

        self.plugin
            .add_network(&params)
            .await
            .map_err(ApplyError::Plugin)?;

        record.running.state = RunningState::Active;
        self.store.save_running(key, record.running)?;
        debug!(key, "Succeeded adding network");
        Ok(())
    }

    async fn apply_delete(&self, key: &str, mut record: ConfigRecord) -> Result<(), ApplyError> {
        record.running.state = RunningState::Dirty;
        self.store.save_running(key, record.running.clone())?;

        // Running.Data is what was pushed into the dataplane, and is what
        // has to be undone — not the latest expected payload.
        match record.running.data.as_ref() {
            Some(params) => {
                self.plugin
                    .delete_network(params)
                    .await
                    .map_err(ApplyError::Plugin)?;
            }
            None => {
                warn!(key, "Running state carries no parameters to undo, skipping plugin delete");
            }
        }

        self.store.save_running(
            key,
            RunningConfig {
                state: RunningState::Nil,
                data: None,
            },
        )?;
        debug!(key, "Succeeded deleting network");
        Ok(())
    }

    fn requeue(&self, event: &Event) {
        self.queue.enqueue(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::cni::CniParameters;
    use crate::queue::AttachmentTuple;
    use crate::queue::EventOp;
    use crate::store::ExpectedConfig;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum PluginCall {
        Add(CniParameters),
        Delete(CniParameters),
    }

    /// Records invocations; optionally fails the next add or delete.
    #[derive(Default)]
    struct MockAttacher {
        calls: Mutex<Vec<PluginCall>>,
        fail_next_add: AtomicBool,
        fail_next_delete: AtomicBool,
    }

    impl MockAttacher {
        fn calls(&self) -> Vec<PluginCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NetworkAttacher for MockAttacher {
        async fn add_network(&self, params: &CniParameters) -> Result<(), Report<CniError>> {
            if self.fail_next_add.swap(false, Ordering::SeqCst) {
                return Err(Report::new(CniError::Invocation {
                    command: "ADD",
                    plugin_type: "mock".to_string(),
                    message: "injected failure".to_string(),
                }));
            }
            self.calls.lock().unwrap().push(PluginCall::Add(params.clone()));
            Ok(())
        }

        async fn delete_network(&self, params: &CniParameters) -> Result<(), Report<CniError>> {
            if self.fail_next_delete.swap(false, Ordering::SeqCst) {
                return Err(Report::new(CniError::Invocation {
                    command: "DEL",
                    plugin_type: "mock".to_string(),
                    message: "injected failure".to_string(),
                }));
            }
            self.calls
                .lock()
                .unwrap()
                .push(PluginCall::Delete(params.clone()));
            Ok(())
        }
    }

    fn params(mac: &str) -> CniParameters {
        CniParameters {
            namespace: "ns".to_string(),
            pod_name: "pod".to_string(),
            sandbox_id: "sandbox".to_string(),
            netns_path: "/var/run/netns/sandbox".to_string(),
            network_name: "blue".to_string(),
            if_mac: mac.to_string(),
        }
    }

    fn event(op: EventOp) -> Event {
        Event {
            op,
            tuple: AttachmentTuple {
                pod_name: "pod".to_string(),
                network_name: "blue".to_string(),
            },
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<ConfigStore>,
        queue: Arc<EventQueue>,
        plugin: Arc<MockAttacher>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::new(dir.path().join("configstore")));
        let queue = Arc::new(EventQueue::new());
        let plugin = Arc::new(MockAttacher::default());
        let reconciler = Reconciler::new(store.clone(), queue.clone(), plugin.clone());
        Fixture {
            _dir: dir,
            store,
            queue,
            plugin,
            reconciler,
        }
    }

    fn key() -> String {
        record_key("pod", "blue")
    }

    #[tokio::test]
    async fn add_walks_nil_to_active() {
        let f = fixture();
        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Add,
                    data: Some(params("02:00:00:00:00:01")),
                },
            )
            .unwrap();

        f.reconciler.process(event(EventOp::Add)).await;

        assert_eq!(f.plugin.calls(), [PluginCall::Add(params("02:00:00:00:00:01"))]);
        let record = f.store.get(&key()).unwrap();
        assert_eq!(record.running.state, RunningState::Active);
        assert_eq!(record.running.data, Some(params("02:00:00:00:00:01")));
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn repeated_adds_are_idempotent() {
        let f = fixture();
        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Add,
                    data: Some(params("02:00:00:00:00:01")),
                },
            )
            .unwrap();

        f.reconciler.process(event(EventOp::Add)).await;
        f.reconciler.process(event(EventOp::Add)).await;

        // active and unchanged: exactly one dataplane add
        assert_eq!(f.plugin.calls().len(), 1);
    }

    #[tokio::test]
    async fn drift_replays_delete_then_add() {
        let f = fixture();
        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Add,
                    data: Some(params("02:00:00:00:00:01")),
                },
            )
            .unwrap();
        f.reconciler.process(event(EventOp::Add)).await;

        // the annotation changed the MAC under an active attachment
        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Add,
                    data: Some(params("02:00:00:00:00:02")),
                },
            )
            .unwrap();
        f.reconciler.process(event(EventOp::Add)).await;

        assert_eq!(
            f.plugin.calls(),
            [
                PluginCall::Add(params("02:00:00:00:00:01")),
                // the delete undoes what ran, with the old parameters
                PluginCall::Delete(params("02:00:00:00:00:01")),
                PluginCall::Add(params("02:00:00:00:00:02")),
            ]
        );
        let record = f.store.get(&key()).unwrap();
        assert_eq!(record.running.state, RunningState::Active);
        assert_eq!(record.running.data, Some(params("02:00:00:00:00:02")));
    }

    #[tokio::test]
    async fn dirty_record_is_replayed() {
        let f = fixture();
        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Add,
                    data: Some(params("02:00:00:00:00:01")),
                },
            )
            .unwrap();
        // as left behind by a crash between the dirty save and the active save
        f.store
            .save_running(
                &key(),
                RunningConfig {
                    state: RunningState::Dirty,
                    data: Some(params("02:00:00:00:00:01")),
                },
            )
            .unwrap();

        f.reconciler.process(event(EventOp::Add)).await;

        assert_eq!(
            f.plugin.calls(),
            [
                PluginCall::Delete(params("02:00:00:00:00:01")),
                PluginCall::Add(params("02:00:00:00:00:01")),
            ]
        );
        assert_eq!(
            f.store.get(&key()).unwrap().running.state,
            RunningState::Active
        );
    }

    #[tokio::test]
    async fn delete_walks_active_to_nil() {
        let f = fixture();
        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Add,
                    data: Some(params("02:00:00:00:00:01")),
                },
            )
            .unwrap();
        f.reconciler.process(event(EventOp::Add)).await;

        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Delete,
                    data: None,
                },
            )
            .unwrap();
        f.reconciler.process(event(EventOp::Delete)).await;

        assert_eq!(
            f.plugin.calls(),
            [
                PluginCall::Add(params("02:00:00:00:00:01")),
                PluginCall::Delete(params("02:00:00:00:00:01")),
            ]
        );
        let record = f.store.get(&key()).unwrap();
        assert_eq!(record.running.state, RunningState::Nil);
        assert!(record.running.data.is_none());
    }

    #[tokio::test]
    async fn delete_of_never_added_network_is_ignored() {
        let f = fixture();
        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Delete,
                    data: None,
                },
            )
            .unwrap();

        f.reconciler.process(event(EventOp::Delete)).await;

        assert!(f.plugin.calls().is_empty());
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn missing_record_drops_event() {
        let f = fixture();

        f.reconciler.process(event(EventOp::Add)).await;

        assert!(f.plugin.calls().is_empty());
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn failed_add_requeues_and_leaves_dirty() {
        let f = fixture();
        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Add,
                    data: Some(params("02:00:00:00:00:01")),
                },
            )
            .unwrap();
        f.plugin.fail_next_add.store(true, Ordering::SeqCst);

        f.reconciler.process(event(EventOp::Add)).await;

        // the dirty marker persisted across the failed invocation
        assert_eq!(
            f.store.get(&key()).unwrap().running.state,
            RunningState::Dirty
        );
        let requeued = f.queue.try_dequeue().unwrap();
        assert_eq!(requeued.tuple.network_name, "blue");

        // the retry replays the dirty record to completion
        f.reconciler.process(requeued).await;
        assert_eq!(
            f.store.get(&key()).unwrap().running.state,
            RunningState::Active
        );
    }

    #[tokio::test]
    async fn failed_delete_requeues() {
        let f = fixture();
        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Add,
                    data: Some(params("02:00:00:00:00:01")),
                },
            )
            .unwrap();
        f.reconciler.process(event(EventOp::Add)).await;

        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Delete,
                    data: None,
                },
            )
            .unwrap();
        f.plugin.fail_next_delete.store(true, Ordering::SeqCst);
        f.reconciler.process(event(EventOp::Delete)).await;

        assert_eq!(
            f.store.get(&key()).unwrap().running.state,
            RunningState::Dirty
        );
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn malformed_add_without_parameters_is_dropped() {
        let f = fixture();
        f.store
            .save_expected(
                &key(),
                ExpectedConfig {
                    optype: Optype::Add,
                    data: None,
                },
            )
            .unwrap();

        f.reconciler.process(event(EventOp::Add)).await;

        assert!(f.plugin.calls().is_empty());
        assert!(f.queue.is_empty());
    }
}
