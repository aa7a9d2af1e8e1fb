use std::path::Path;
use std::sync::Arc;

use tokio::time::Instant;

use crate::config::WorkerConfig;
use crate::fleet::provider::InstanceRetirer;
use crate::fleet::state::InstanceRecord;
use crate::scheduler::{QueuedTask, Task, TaskResult, TaskSource};
use crate::worker::remote::RemoteShell;

/// States of one instance's lifecycle.
///
/// `Start -> GetNextTask -> RunTask -> (GetNextTask | Stop)`; `Start` and
/// `GetNextTask` may also go straight to `Stop`. `Stop` is terminal.
#[derive(Debug)]
pub enum WorkerState {
    /// Waiting for the instance to finish bootstrapping.
    Start,
    /// Idle, waiting for a task from the queue.
    GetNextTask,
    /// Running a claimed task.
    RunTask(QueuedTask),
    /// Retiring the instance.
    Stop,
}

impl WorkerState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerState::Start => "start",
            WorkerState::GetNextTask => "get_next_task",
            WorkerState::RunTask(_) => "run_task",
            WorkerState::Stop => "stop",
        }
    }
}

/// Drives one worker instance from readiness to retirement.
///
/// Runs at most one task at a time. Keeps the last uploaded executable so
/// that consecutive tasks with the same binary skip the upload.
pub struct Worker {
    instance: InstanceRecord,
    config: WorkerConfig,
    shell: Arc<dyn RemoteShell>,
    tasks: Arc<dyn TaskSource>,
    retirer: Arc<dyn InstanceRetirer>,
    uploaded: Option<String>,
}

impl Worker {
    pub fn new(
        instance: InstanceRecord,
        config: WorkerConfig,
        shell: Arc<dyn RemoteShell>,
        tasks: Arc<dyn TaskSource>,
        retirer: Arc<dyn InstanceRetirer>,
    ) -> Self {
        Self {
            instance,
            config,
            shell,
            tasks,
            retirer,
            uploaded: None,
        }
    }

    pub fn instance(&self) -> &InstanceRecord {
        &self.instance
    }

    /// Executable currently uploaded to the instance, if any.
    pub fn uploaded_executable(&self) -> Option<&str> {
        self.uploaded.as_deref()
    }

    /// Run the state machine until the instance is retired.
    pub async fn run(mut self) {
        let mut state = Some(WorkerState::Start);
        while let Some(current) = state {
            tracing::trace!(state = current.name(), "Worker transition");
            state = self.step(current).await;
        }
        tracing::info!("Worker finished");
    }

    /// Execute one state and return the next, or `None` once retired.
    pub async fn step(&mut self, state: WorkerState) -> Option<WorkerState> {
        match state {
            WorkerState::Start => Some(self.wait_ready().await),
            WorkerState::GetNextTask => Some(self.next_task().await),
            WorkerState::RunTask(task) => Some(self.run_task(task).await),
            WorkerState::Stop => {
                self.retire().await;
                None
            }
        }
    }

    async fn wait_ready(&self) -> WorkerState {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            tracing::debug!("Checking if instance is ready");
            match self
                .shell
                .check_path(&self.instance.address, &self.config.ready_marker)
                .await
            {
                Ok(true) => {
                    tracing::info!("Instance ready");
                    return WorkerState::GetNextTask;
                }
                Ok(false) => {}
                Err(e) => tracing::debug!(error = %e, "Readiness check failed"),
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    timeout_secs = self.config.ready_timeout.as_secs(),
                    "Instance never became ready"
                );
                return WorkerState::Stop;
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
    }

    async fn next_task(&self) -> WorkerState {
        tracing::debug!("Waiting for next task");
        match self.tasks.next(self.config.idle_timeout).await {
            Some(task) => WorkerState::RunTask(task),
            None => {
                tracing::info!(
                    idle_secs = self.config.idle_timeout.as_secs(),
                    "No task arrived, retiring idle instance"
                );
                WorkerState::Stop
            }
        }
    }

    async fn run_task(&mut self, queued: QueuedTask) -> WorkerState {
        let QueuedTask { task, slot } = queued;
        match self.execute(&task).await {
            Ok(result) => {
                tracing::info!(
                    executable = %task.executable,
                    code = result.code,
                    "Task finished"
                );
                slot.fill(result);
                WorkerState::GetNextTask
            }
            Err(message) => {
                tracing::warn!(executable = %task.executable, error = %message, "Task dispatch failed");
                slot.fill(TaskResult::dispatch_failure(message));
                WorkerState::Stop
            }
        }
    }

    /// Upload if needed and run the task. `Err` carries a diagnostic for a
    /// failure that makes this instance unusable.
    async fn execute(&mut self, task: &Task) -> Result<TaskResult, String> {
        let addr = self.instance.address.clone();
        let remote_exe = self.config.remote_executable();

        if self.uploaded.as_deref() != Some(task.executable.as_str()) {
            self.uploaded = None;

            tracing::info!("Cleaning up remote dir");
            let dir = shell_quote(&self.config.remote_dir);
            let cleanup = format!("rm -rf {0} && mkdir -p {0}", dir);
            match self.shell.run_command(&addr, &cleanup).await {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    return Err(format!(
                        "Failed to clean up remote task directory: exit code {}: {}",
                        out.exit_code,
                        out.output.trim()
                    ))
                }
                Err(e) => return Err(format!("Failed to clean up remote task directory: {}", e)),
            }

            tracing::info!(executable = %task.executable, "Uploading executable");
            self.shell
                .copy_file(&addr, Path::new(&task.executable), &remote_exe)
                .await
                .map_err(|e| format!("Failed to upload new executable: {}", e))?;
            self.uploaded = Some(task.executable.clone());
        }

        tracing::info!("Executing remote task");
        let script = build_script(task, &remote_exe);
        let out = self
            .shell
            .run_command(&addr, &script)
            .await
            .map_err(|e| format!("Failed to run remote command: {}", e))?;

        Ok(TaskResult::new(out.exit_code, out.output))
    }

    async fn retire(&self) {
        loop {
            tracing::info!("Deleting instance");
            match self.retirer.retire(&self.instance.id).await {
                Ok(()) => {
                    tracing::info!("Instance deleted");
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_secs = self.config.retire_retry_delay.as_secs(),
                        "Failed to delete instance"
                    );
                    tokio::time::sleep(self.config.retire_retry_delay).await;
                }
            }
        }
    }
}

/// Remote shell script for a task: stderr folded into stdout, one export per
/// environment variable, then the uploaded executable and the raw arguments.
pub fn build_script(task: &Task, remote_executable: &str) -> String {
    let mut names: Vec<&String> = task.env.keys().collect();
    names.sort();

    let mut script = String::from("exec 2>&1\n");
    for name in names {
        script.push_str("export ");
        script.push_str(name);
        script.push('=');
        script.push_str(&shell_quote(&task.env[name]));
        script.push('\n');
    }
    script.push_str(&shell_quote(remote_executable));
    if !task.args.is_empty() {
        script.push(' ');
        script.push_str(&task.args);
    }
    script
}

/// Single-quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
