//! Per-instance worker lifecycle.
//!
//! Each known instance gets one [`Worker`] running on its own tokio task:
//! - **Start**: poll the readiness marker until bootstrap finishes or times out
//! - **GetNextTask**: claim the next queued task, or retire after the idle timeout
//! - **RunTask**: upload the executable if it changed, run the task remotely,
//!   and resolve the submitter's result
//! - **Stop**: destroy the instance, retrying until the provider confirms
//!
//! A non-zero exit code is an ordinary result. A failure of the remote channel
//! resolves the task with a dispatch failure and retires the instance.

pub mod lifecycle;
pub mod remote;
pub mod ssh;

pub use lifecycle::{build_script, Worker, WorkerState};
pub use remote::{CommandOutput, RemoteShell};
pub use ssh::SshShell;
