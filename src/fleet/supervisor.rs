use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{FleetConfig, WorkerConfig};
use crate::error::ProviderError;
use crate::fleet::provider::{CloudProvider, Instance, InstanceRetirer};
use crate::fleet::state::{FleetState, InstanceRecord};
use crate::scheduler::TaskQueue;
use crate::worker::{RemoteShell, Worker};

/// Point-in-time view of the fleet, served over the status RPC.
#[derive(Debug, Clone)]
pub struct FleetSnapshot {
    pub queue_length: usize,
    pub launches_in_flight: usize,
    pub max_instances: usize,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub instances: Vec<InstanceRecord>,
}

/// Grows the fleet to match queue pressure and keeps it in sync with the provider.
///
/// Cheap to clone; all clones share the same fleet state. The fleet only
/// shrinks through workers retiring their own instance.
#[derive(Clone)]
pub struct FleetSupervisor {
    config: FleetConfig,
    worker_config: WorkerConfig,
    provider: Arc<dyn CloudProvider>,
    shell: Arc<dyn RemoteShell>,
    queue: Arc<TaskQueue>,
    state: Arc<Mutex<FleetState>>,
}

impl FleetSupervisor {
    pub fn new(
        config: FleetConfig,
        worker_config: WorkerConfig,
        provider: Arc<dyn CloudProvider>,
        shell: Arc<dyn RemoteShell>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            config,
            worker_config,
            provider,
            shell,
            queue,
            state: Arc::new(Mutex::new(FleetState::new())),
        }
    }

    /// Spawn the reconciliation loop and the launcher pool.
    ///
    /// The loops exit when `shutdown` is cancelled. Workers that are already
    /// running are not tied to the token.
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.launchers + 1);

        let supervisor = self.clone();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            supervisor.reconcile_loop(token).await;
        }));

        for launcher in 0..self.config.launchers {
            let supervisor = self.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                supervisor.launch_loop(launcher, token).await;
            }));
        }

        tracing::info!(
            launchers = self.config.launchers,
            max_instances = self.config.max_instances,
            "Fleet supervisor started"
        );
        handles
    }

    async fn reconcile_loop(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        tracing::warn!(error = %e, "Failed to list instances");
                    }
                }
            }
        }
        tracing::debug!("Reconciliation loop stopped");
    }

    /// List the provider's instances once and adopt any that are unknown.
    /// Returns how many were newly registered. Instances retired while the
    /// listing was in flight are not adopted.
    pub async fn reconcile_once(&self) -> Result<usize, ProviderError> {
        tracing::debug!("Listing instances");
        let listed_at = Utc::now();
        let listed = self.provider.list_instances().await?;

        let mut adopted = 0;
        for instance in &listed {
            if self.register_instance(instance).await {
                adopted += 1;
            }
        }
        self.state.lock().await.mark_reconciled(listed_at);

        tracing::info!(listed = listed.len(), adopted, "Reconciled fleet");
        Ok(adopted)
    }

    async fn launch_loop(self, launcher: usize, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let wait = match self.launch_once().await {
                Ok(true) => continue,
                Ok(false) => self.config.launch_poll_interval,
                Err(e) => {
                    tracing::warn!(launcher, error = %e, "Failed to deploy instance");
                    self.config.launch_failure_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!(launcher, "Launch loop stopped");
    }

    /// Launch one instance if authorized. Returns whether a deploy was attempted
    /// and succeeded; `Ok(false)` means authorization was denied.
    pub async fn launch_once(&self) -> Result<bool, ProviderError> {
        let queue_len = self.queue.len();
        let authorized = self
            .state
            .lock()
            .await
            .authorize_launch(queue_len, self.config.max_instances);
        if !authorized {
            return Ok(false);
        }

        tracing::info!(queue_len, "Launching instance");
        let outcome = self.provider.deploy_instance(&self.config.deploy).await;

        let adopted = {
            let mut state = self.state.lock().await;
            match &outcome {
                Ok(instance) => {
                    if state.resolve_launch(Some(instance)) {
                        state.get(&instance.id).cloned()
                    } else {
                        None
                    }
                }
                Err(_) => {
                    state.resolve_launch(None);
                    None
                }
            }
        };

        let instance = outcome?;
        match adopted {
            Some(record) => self.spawn_worker(record),
            None if instance.address.is_none() => tracing::warn!(
                instance_id = %instance.id,
                "Instance launched without an address, waiting for reconciliation"
            ),
            None => {}
        }
        Ok(true)
    }

    /// Add an instance to the fleet and start its worker. Returns false if the
    /// instance was already known or has no address yet.
    pub async fn register_instance(&self, instance: &Instance) -> bool {
        let record = {
            let mut state = self.state.lock().await;
            if !state.register(instance) {
                return false;
            }
            state.get(&instance.id).cloned()
        };

        match record {
            Some(record) => {
                self.spawn_worker(record);
                true
            }
            None => false,
        }
    }

    fn spawn_worker(&self, record: InstanceRecord) {
        tracing::info!(instance_id = %record.id, addr = %record.address, "Adding instance");

        let span = tracing::info_span!("worker", instance_id = %record.id, addr = %record.address);
        let worker = Worker::new(
            record,
            self.worker_config.clone(),
            self.shell.clone(),
            self.queue.clone(),
            Arc::new(self.clone()),
        );
        tokio::spawn(worker.run().instrument(span));
    }

    pub async fn status(&self) -> FleetSnapshot {
        let state = self.state.lock().await;
        FleetSnapshot {
            queue_length: self.queue.len(),
            launches_in_flight: state.launches_in_flight(),
            max_instances: self.config.max_instances,
            reconciled_at: state.reconciled_at(),
            instances: state.instances(),
        }
    }

    pub async fn knows(&self, id: &str) -> bool {
        self.state.lock().await.contains(id)
    }

    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.instance_count()
    }
}

#[async_trait]
impl InstanceRetirer for FleetSupervisor {
    async fn retire(&self, id: &str) -> Result<(), ProviderError> {
        tracing::info!(instance_id = id, "Destroying instance");

        match self.provider.destroy_instance(id).await {
            Ok(()) => {}
            Err(ProviderError::NotFound(_)) => {
                tracing::debug!(instance_id = id, "Instance already gone");
            }
            Err(e) => {
                tracing::warn!(instance_id = id, error = %e, "Failed to destroy instance");
                return Err(e);
            }
        }

        self.state.lock().await.remove(id);
        tracing::info!(instance_id = id, "Instance retired");
        Ok(())
    }
}
