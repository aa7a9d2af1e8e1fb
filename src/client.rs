use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures::future::join_all;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::error::Result;
use crate::proto::batch_service_client::BatchServiceClient;
use crate::proto::{GetFleetStatusRequest, GetFleetStatusResponse, TaskRequest};
use crate::remote_fn::encode_invocation;
use crate::scheduler::{Task, TaskResult};

/// Client for a `batchd` server listening on a Unix socket.
///
/// Cloning is cheap and clones share one connection, over which any number of
/// submissions can be in flight at once.
#[derive(Debug, Clone)]
pub struct Client {
    inner: BatchServiceClient<Channel>,
}

impl Client {
    /// Connect to the server socket. Fails if the socket is not reachable.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = socket_path.as_ref().to_path_buf();

        // The URI is required by tonic but never resolved; the connector
        // always dials the socket.
        let channel = Endpoint::try_from("http://[::]:50051")?
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
            }))
            .await?;

        Ok(Self {
            inner: BatchServiceClient::new(channel),
        })
    }

    /// Submit a task and wait for its result.
    ///
    /// A relative executable is resolved against the current directory, since
    /// the server and its workers cannot know it.
    pub async fn run(&self, mut task: Task) -> Result<TaskResult> {
        if let Ok(path) = std::path::absolute(&task.executable) {
            task.executable = path.to_string_lossy().into_owned();
        }

        let mut client = self.inner.clone();
        let response = client.run(TaskRequest::from(task)).await?;
        Ok(response.into_inner().into())
    }

    /// Run all tasks concurrently. Results are in input order; a submission
    /// that fails is reported as a dispatch failure in its position.
    pub async fn map(&self, tasks: Vec<Task>) -> Vec<TaskResult> {
        self.map_with_progress(tasks, |_, _| {}).await
    }

    /// Like [`Client::map`], calling `progress` with the index and result of
    /// each task as it completes.
    pub async fn map_with_progress<F>(&self, tasks: Vec<Task>, progress: F) -> Vec<TaskResult>
    where
        F: Fn(usize, &TaskResult),
    {
        let progress = &progress;
        let submissions = tasks.into_iter().enumerate().map(|(index, task)| async move {
            let result = self.run(task).await.unwrap_or_else(|e| {
                TaskResult::dispatch_failure(format!("Failed to run task: {}", e))
            });
            progress(index, &result);
            result
        });
        join_all(submissions).await
    }

    /// Run a function registered under `name` in this program's
    /// [`FunctionRegistry`](crate::remote_fn::FunctionRegistry) on a worker.
    pub async fn run_func<A: Serialize>(
        &self,
        env: HashMap<String, String>,
        name: &str,
        args: &A,
    ) -> Result<TaskResult> {
        let executable = std::env::current_exe()?;
        let invocation = encode_invocation(name, args)?;
        self.run(Task {
            executable: executable.to_string_lossy().into_owned(),
            env,
            args: invocation,
        })
        .await
    }

    /// Run the registered function once per argument set, concurrently.
    pub async fn map_func<A: Serialize>(
        &self,
        env: HashMap<String, String>,
        name: &str,
        args_list: &[A],
    ) -> Vec<TaskResult> {
        let env = &env;
        let calls = args_list.iter().map(|args| async move {
            self.run_func(env.clone(), name, args)
                .await
                .unwrap_or_else(|e| {
                    TaskResult::dispatch_failure(format!("Failed to run function: {}", e))
                })
        });
        join_all(calls).await
    }

    pub async fn fleet_status(&self) -> Result<GetFleetStatusResponse> {
        let mut client = self.inner.clone();
        let response = client.get_fleet_status(GetFleetStatusRequest {}).await?;
        Ok(response.into_inner())
    }
}
