use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::fleet::{CloudProvider, FleetSupervisor};
use crate::grpc::GrpcServer;
use crate::scheduler::TaskQueue;
use crate::worker::RemoteShell;

/// A batch server: the task queue, the fleet that drains it, and the socket
/// clients submit through.
pub struct Node {
    config: ServerConfig,
    queue: Arc<TaskQueue>,
    fleet: FleetSupervisor,
}

impl Node {
    pub fn new(
        config: ServerConfig,
        provider: Arc<dyn CloudProvider>,
        shell: Arc<dyn RemoteShell>,
    ) -> Self {
        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        let fleet = FleetSupervisor::new(
            config.fleet.clone(),
            config.worker.clone(),
            provider,
            shell,
            queue.clone(),
        );
        Self {
            config,
            queue,
            fleet,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn fleet(&self) -> &FleetSupervisor {
        &self.fleet
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// The socket is bound before the fleet starts, so a bad socket path
    /// fails without launching anything. On shutdown the queue is closed and
    /// tasks still waiting in it resolve with a dispatch failure, so serving
    /// can finish. The fleet loops are then awaited. Workers still running
    /// tasks are not awaited.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the server fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let server = GrpcServer::new(
            self.config.socket_path.clone(),
            self.queue.clone(),
            self.fleet.clone(),
        );
        let listener = server.bind()?;

        let loops = self.fleet.start(shutdown.clone());
        tokio::spawn(close_on_shutdown(self.queue.clone(), shutdown.clone()));
        let result = server.serve(listener, shutdown.clone()).await;

        shutdown.cancel();
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Fleet loop ended abnormally");
            }
        }
        let instances = self.fleet.instance_count().await;
        tracing::info!(instances, "Node stopped");
        result
    }
}

/// The queue lock may be held by an idle worker until its dequeue times out,
/// so this runs beside serving instead of after it.
async fn close_on_shutdown(queue: Arc<TaskQueue>, shutdown: CancellationToken) {
    shutdown.cancelled().await;
    let dropped = queue.close().await;
    if dropped > 0 {
        tracing::warn!(dropped, "Dropped queued tasks on shutdown");
    }
}
