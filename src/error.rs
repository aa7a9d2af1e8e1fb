use thiserror::Error;

use crate::scheduler::QueuedTask;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Task queue is at capacity")]
    QueueFull,

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote function error: {0}")]
    RemoteFn(#[from] RemoteFnError),
}

pub type Result<T> = std::result::Result<T, BatchError>;

/// Returned by [`crate::scheduler::TaskQueue::put`]; hands the rejected task back.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("task queue is full")]
    Full(QueuedTask),

    #[error("task queue is closed")]
    Closed(QueuedTask),
}

/// Failures reported by a cloud provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The instance does not exist (already destroyed or never created).
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("operation {id} ended in state {state}")]
    Operation { id: String, state: String },
}

/// Failures of the remote execution channel itself, as opposed to a remote
/// command that ran and exited non-zero.
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("remote channel to {addr} failed: {message}")]
    Transport { addr: String, message: String },

    #[error("copy to {addr}:{remote} failed: {message}")]
    CopyFailed {
        addr: String,
        remote: String,
        message: String,
    },
}

#[derive(Error, Debug)]
pub enum RemoteFnError {
    #[error("function already registered: {0}")]
    Duplicate(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("malformed invocation: {0}")]
    Malformed(String),

    #[error("failed to encode arguments: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode arguments: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("function {name} failed: {message}")]
    Failed { name: String, message: String },
}
