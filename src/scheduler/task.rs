use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{BatchError, Result};

/// Exit code reported when a task never produced a real exit status.
pub const DISPATCH_FAILURE: i32 = -1;

/// One unit of remote work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Path to the executable on the submitting machine.
    pub executable: String,
    /// Environment variables exported before the executable runs.
    pub env: HashMap<String, String>,
    /// Argument string, passed to the remote shell verbatim.
    pub args: String,
}

impl Task {
    pub fn new(executable: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            env: HashMap::new(),
            args: args.into(),
        }
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Check that the task can be dispatched to a remote instance.
    ///
    /// The executable must be absolute because workers know nothing about
    /// the submitter's working directory.
    pub fn validate(&self) -> Result<()> {
        if self.executable.trim().is_empty() {
            return Err(BatchError::InvalidTask("executable cannot be empty".into()));
        }
        if !Path::new(&self.executable).is_absolute() {
            return Err(BatchError::InvalidTask(format!(
                "executable must be an absolute path: {}",
                self.executable
            )));
        }
        if let Some(name) = self.env.keys().find(|name| !is_env_name(name)) {
            return Err(BatchError::InvalidTask(format!(
                "invalid environment variable name: {:?}",
                name
            )));
        }
        Ok(())
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Outcome of running a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub code: i32,
    pub output: String,
}

impl TaskResult {
    pub fn new(code: i32, output: impl Into<String>) -> Self {
        Self {
            code,
            output: output.into(),
        }
    }

    pub fn dispatch_failure(message: impl Into<String>) -> Self {
        Self::new(DISPATCH_FAILURE, message)
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Single-use handle through which exactly one result reaches the submitter.
///
/// Dropping an unfilled slot delivers a dispatch failure, so a task that is
/// discarded anywhere between the queue and a worker still resolves its caller.
#[derive(Debug)]
pub struct ResultSlot {
    tx: Option<oneshot::Sender<TaskResult>>,
}

impl ResultSlot {
    pub fn new() -> (Self, oneshot::Receiver<TaskResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn fill(mut self, result: TaskResult) {
        self.send(result);
    }

    fn send(&mut self, result: TaskResult) {
        if let Some(tx) = self.tx.take() {
            // The submitter may have gone away; nothing else is waiting.
            let _ = tx.send(result);
        }
    }
}

impl Drop for ResultSlot {
    fn drop(&mut self) {
        self.send(TaskResult::dispatch_failure(
            "task dropped before a result was produced",
        ));
    }
}

/// A task waiting in the queue together with the slot for its result.
#[derive(Debug)]
pub struct QueuedTask {
    pub task: Task,
    pub slot: ResultSlot,
}

impl QueuedTask {
    pub fn new(task: Task) -> (Self, oneshot::Receiver<TaskResult>) {
        let (slot, rx) = ResultSlot::new();
        (Self { task, slot }, rx)
    }

    pub fn complete(self, result: TaskResult) {
        self.slot.fill(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_absolute_executable() {
        let task = Task::new("/bin/echo", "$X").with_env("X", "hi");
        assert!(task.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_and_relative() {
        assert!(Task::new("  ", "").validate().is_err());
        assert!(Task::new("bin/echo", "").validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_env_names() {
        for name in ["", "1X", "A-B", "A B", "X=Y"] {
            let task = Task::new("/bin/true", "").with_env(name, "v");
            assert!(task.validate().is_err(), "{:?} should be rejected", name);
        }
        let task = Task::new("/bin/true", "").with_env("_OK_1", "v");
        assert!(task.validate().is_ok());
    }

    #[tokio::test]
    async fn filled_slot_delivers_result_once() {
        let (slot, rx) = ResultSlot::new();
        slot.fill(TaskResult::new(0, "done"));
        assert_eq!(rx.await.unwrap(), TaskResult::new(0, "done"));
    }

    #[tokio::test]
    async fn dropped_slot_delivers_dispatch_failure() {
        let (queued, rx) = QueuedTask::new(Task::new("/bin/true", ""));
        drop(queued);
        let result = rx.await.unwrap();
        assert_eq!(result.code, DISPATCH_FAILURE);
        assert!(result.output.contains("dropped"));
    }
}
