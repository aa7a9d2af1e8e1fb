//! End-to-end tests over the Unix socket.
//!
//! Workers run task scripts with the local shell, so the full path from
//! submission to remote execution and back is exercised without a cloud.


use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use test_harness::{
    assert_eventually, fast_fleet_config, fill_queue, idle_supervisor, write_script, FakeProvider,
    TestServer,
};
use tonic::{Code, Request};

use batchd::error::BatchError;
use batchd::grpc::BatchServiceImpl;
use batchd::proto::batch_service_server::BatchService;
use batchd::proto::TaskRequest;
use batchd::scheduler::{Task, DISPATCH_FAILURE};

#[tokio::test]
async fn test_run_echo_with_env() {
    let server = TestServer::start(2).await;
    let echo = write_script(server.dir.path(), "echo", r#"echo "$@""#);

    let client = server.client().await;
    let result = client
        .run(Task::new(echo.display().to_string(), "$X").with_env("X", "hi"))
        .await
        .unwrap();

    assert_eq!(result.code, 0);
    assert_eq!(result.output, "hi\n");

    drop(client);
    server.shutdown().await;
}

#[tokio::test]
async fn test_nonzero_exit_and_stderr_are_reported() {
    let server = TestServer::start(1).await;
    let fail = write_script(server.dir.path(), "fail", "echo out; echo err >&2; exit 7");

    let client = server.client().await;
    let result = client
        .run(Task::new(fail.display().to_string(), ""))
        .await
        .unwrap();

    assert_eq!(result.code, 7);
    assert_eq!(result.output, "out\nerr\n");

    drop(client);
    server.shutdown().await;
}

#[tokio::test]
async fn test_map_resolves_every_task_in_order() {
    let server = TestServer::start(3).await;
    let echo = write_script(server.dir.path(), "echo", r#"echo "$@""#);
    let exe = echo.display().to_string();

    let client = server.client().await;
    let tasks: Vec<Task> = (0..20)
        .map(|i| Task::new(exe.clone(), format!("task-{}", i)))
        .collect();

    let completed = AtomicUsize::new(0);
    let results = client
        .map_with_progress(tasks, |_, _| {
            completed.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    assert_eq!(results.len(), 20);
    assert_eq!(completed.load(Ordering::SeqCst), 20);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.code, 0, "task {} failed: {}", i, result.output);
        assert_eq!(result.output, format!("task-{}\n", i));
    }
    assert!(server.provider.deploys() <= 3);

    drop(client);
    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_task_is_rejected_before_enqueue() {
    let server = TestServer::start(1).await;
    let client = server.client().await;

    let missing = client.run(Task::new("", "")).await.unwrap_err();
    assert!(matches!(missing, BatchError::GrpcError(ref s) if s.code() == Code::InvalidArgument));

    let bad_env = client
        .run(Task::new("/bin/true", "").with_env("1BAD", "x"))
        .await
        .unwrap_err();
    assert!(matches!(bad_env, BatchError::GrpcError(ref s) if s.code() == Code::InvalidArgument));

    assert!(server.queue.is_empty());
    assert_eq!(server.provider.deploys(), 0);

    drop(client);
    server.shutdown().await;
}

#[tokio::test]
async fn test_map_reports_rejected_submission_in_place() {
    let server = TestServer::start(1).await;
    let echo = write_script(server.dir.path(), "echo", r#"echo "$@""#);

    let client = server.client().await;
    let results = client
        .map(vec![
            Task::new(echo.display().to_string(), "first"),
            Task::new("", ""),
            Task::new(echo.display().to_string(), "third"),
        ])
        .await;

    assert_eq!(results[0].output, "first\n");
    assert_eq!(results[1].code, DISPATCH_FAILURE);
    assert!(results[1].output.starts_with("Failed to run task"));
    assert_eq!(results[2].output, "third\n");

    drop(client);
    server.shutdown().await;
}

#[tokio::test]
async fn test_fleet_status_reports_instances() {
    let server = TestServer::start(2).await;
    let echo = write_script(server.dir.path(), "echo", r#"echo "$@""#);

    let client = server.client().await;
    client
        .run(Task::new(echo.display().to_string(), "x"))
        .await
        .unwrap();

    let status = client.fleet_status().await.unwrap();
    assert_eq!(status.max_instances, 2);
    assert_eq!(status.queue_length, 0);
    assert!(status.reconciled_at_ms.is_some());
    assert!(!status.instances.is_empty());
    assert!(status.instances.iter().all(|i| i.id.starts_with("i-")));

    drop(client);
    server.shutdown().await;
}

#[tokio::test]
async fn test_connect_fails_without_server() {
    let dir = tempfile::tempdir().unwrap();
    let result = batchd::client::Client::connect(dir.path().join("missing.sock")).await;
    assert!(matches!(result, Err(BatchError::TransportError(_))));
}

#[tokio::test]
async fn test_shutdown_removes_socket() {
    let server = TestServer::start(1).await;
    let client = server.client().await;
    drop(client);

    let socket = server.socket.clone();
    assert!(socket.exists());
    server.shutdown().await;
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_shutdown_resolves_queued_submissions() {
    // No instances may launch, so the task stays queued.
    let server = TestServer::start(0).await;
    let client = server.client().await;
    let pending = tokio::spawn(async move { client.run(Task::new("/bin/true", "")).await });

    assert_eventually(
        || async { server.queue.len() == 1 },
        Duration::from_secs(5),
        "task should be queued",
    )
    .await;
    let queue = server.queue.clone();
    server.shutdown().await;

    let result = pending.await.unwrap().unwrap();
    assert_eq!(result.code, DISPATCH_FAILURE);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_closed_queue_rejects_submissions_as_unavailable() {
    let provider = Arc::new(FakeProvider::new());
    let (supervisor, _) = idle_supervisor(provider, fast_fleet_config(1, 1));
    let queue = Arc::new(batchd::scheduler::TaskQueue::new(4));
    queue.close().await;

    let service = BatchServiceImpl::new(queue, supervisor);
    let request = TaskRequest {
        executable: "/bin/true".to_string(),
        env: HashMap::new(),
        args: String::new(),
    };
    let status = service.run(Request::new(request)).await.unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
}

#[tokio::test]
async fn test_full_queue_is_resource_exhausted() {
    let provider = Arc::new(FakeProvider::new());
    let (supervisor, _) = idle_supervisor(provider, fast_fleet_config(1, 1));
    let queue = Arc::new(batchd::scheduler::TaskQueue::new(1));
    let _results = fill_queue(&queue, 1);

    let service = BatchServiceImpl::new(queue.clone(), supervisor);
    let request = TaskRequest {
        executable: "/bin/true".to_string(),
        env: HashMap::new(),
        args: String::new(),
    };
    let status = service.run(Request::new(request)).await.unwrap_err();

    assert_eq!(status.code(), Code::ResourceExhausted);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_idle_workers_retire_their_instances() {
    let server = TestServer::start(1).await;
    let echo = write_script(server.dir.path(), "echo", r#"echo "$@""#);

    let client = server.client().await;
    client
        .run(Task::new(echo.display().to_string(), "x"))
        .await
        .unwrap();

    // Worker idle timeout is 5s in the harness.
    assert_eventually(
        || async { server.fleet.instance_count().await == 0 },
        Duration::from_secs(10),
        "idle instance should be retired",
    )
    .await;
    assert_eq!(server.provider.destroyed().len(), 1);

    drop(client);
    server.shutdown().await;
}
