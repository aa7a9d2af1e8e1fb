use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::error::{BatchError, QueueError};
use crate::fleet::FleetSupervisor;
use crate::proto::batch_service_server::BatchService;
use crate::proto::{GetFleetStatusRequest, GetFleetStatusResponse, TaskRequest, TaskResponse};
use crate::scheduler::{QueuedTask, Task, TaskQueue, TaskResult};

/// Task dispatch service: every `Run` call enqueues one task and blocks until
/// a worker resolves it.
pub struct BatchServiceImpl {
    queue: Arc<TaskQueue>,
    fleet: FleetSupervisor,
}

impl BatchServiceImpl {
    pub fn new(queue: Arc<TaskQueue>, fleet: FleetSupervisor) -> Self {
        Self { queue, fleet }
    }

    /// Enqueue a validated task and wait for its result.
    pub async fn dispatch(&self, task: Task) -> Result<TaskResult, BatchError> {
        task.validate()?;

        let executable = task.executable.clone();
        let (queued, result_rx) = QueuedTask::new(task);
        self.queue
            .put(queued)
            .map_err(|e| match e {
                QueueError::Full(_) => BatchError::QueueFull,
                QueueError::Closed(_) => BatchError::ShuttingDown,
            })?;
        tracing::info!(executable = %executable, queue_len = self.queue.len(), "Task queued");

        // The slot resolves even if the task is dropped, so this only fails
        // if the sender was leaked.
        let result = result_rx.await.unwrap_or_else(|_| {
            TaskResult::dispatch_failure("task was abandoned without a result")
        });
        tracing::info!(executable = %executable, code = result.code, "Task resolved");
        Ok(result)
    }
}

#[tonic::async_trait]
impl BatchService for BatchServiceImpl {
    async fn run(&self, request: Request<TaskRequest>) -> Result<Response<TaskResponse>, Status> {
        let task = Task::from(request.into_inner());
        match self.dispatch(task).await {
            Ok(result) => Ok(Response::new(result.into())),
            Err(BatchError::InvalidTask(msg)) => Err(Status::invalid_argument(msg)),
            Err(BatchError::QueueFull) => {
                tracing::warn!("Task queue at capacity, submission rejected");
                Err(Status::resource_exhausted("Task queue is at capacity"))
            }
            Err(BatchError::ShuttingDown) => Err(Status::unavailable("Server is shutting down")),
            Err(e) => Err(Status::internal(e.to_string())),
        }
    }

    async fn get_fleet_status(
        &self,
        _request: Request<GetFleetStatusRequest>,
    ) -> Result<Response<GetFleetStatusResponse>, Status> {
        let snapshot = self.fleet.status().await;
        Ok(Response::new(snapshot.into()))
    }
}
