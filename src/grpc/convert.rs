use crate::fleet::{FleetSnapshot, InstanceRecord};
use crate::proto::{GetFleetStatusResponse, InstanceInfo, TaskRequest, TaskResponse};
use crate::scheduler::{Task, TaskResult};

impl From<TaskRequest> for Task {
    fn from(req: TaskRequest) -> Self {
        Task {
            executable: req.executable,
            env: req.env,
            args: req.args,
        }
    }
}

impl From<Task> for TaskRequest {
    fn from(task: Task) -> Self {
        TaskRequest {
            executable: task.executable,
            env: task.env,
            args: task.args,
        }
    }
}

impl From<TaskResult> for TaskResponse {
    fn from(result: TaskResult) -> Self {
        TaskResponse {
            code: result.code,
            output: result.output,
        }
    }
}

impl From<TaskResponse> for TaskResult {
    fn from(resp: TaskResponse) -> Self {
        TaskResult {
            code: resp.code,
            output: resp.output,
        }
    }
}

impl From<InstanceRecord> for InstanceInfo {
    fn from(record: InstanceRecord) -> Self {
        InstanceInfo {
            id: record.id,
            address: record.address,
            registered_at_ms: record.registered_at.timestamp_millis(),
        }
    }
}

impl From<FleetSnapshot> for GetFleetStatusResponse {
    fn from(snapshot: FleetSnapshot) -> Self {
        GetFleetStatusResponse {
            queue_length: snapshot.queue_length as u64,
            launches_in_flight: snapshot.launches_in_flight as u64,
            max_instances: snapshot.max_instances as u64,
            reconciled_at_ms: snapshot.reconciled_at.map(|at| at.timestamp_millis()),
            instances: snapshot.instances.into_iter().map(Into::into).collect(),
        }
    }
}
