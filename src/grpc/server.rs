use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::error::Result;
use crate::fleet::FleetSupervisor;
use crate::grpc::batch_service::BatchServiceImpl;
use crate::proto::batch_service_server::BatchServiceServer;
use crate::scheduler::TaskQueue;

/// Per-connection limit on in-flight `Run` calls.
pub const MAX_CONCURRENT_SUBMISSIONS: u32 = 100_000;

/// Serves the submission protocol on a Unix domain socket.
pub struct GrpcServer {
    socket_path: PathBuf,
    queue: Arc<TaskQueue>,
    fleet: FleetSupervisor,
}

impl GrpcServer {
    pub fn new(socket_path: impl Into<PathBuf>, queue: Arc<TaskQueue>, fleet: FleetSupervisor) -> Self {
        Self {
            socket_path: socket_path.into(),
            queue,
            fleet,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale socket file left by a previous run.
    pub fn bind(&self) -> io::Result<UnixListener> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => tracing::debug!(socket = %self.socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        UnixListener::bind(&self.socket_path)
    }

    /// Bind and serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener. Each connection is
    /// handled concurrently. The socket file is removed on return.
    pub async fn serve(self, listener: UnixListener, shutdown: CancellationToken) -> Result<()> {
        let service = BatchServiceImpl::new(self.queue.clone(), self.fleet.clone());

        tracing::info!(socket = %self.socket_path.display(), "Starting gRPC server");

        // Submissions block for the lifetime of their task, so the stream
        // limit bounds how many tasks one client connection can queue.
        let result = Server::builder()
            .max_concurrent_streams(Some(MAX_CONCURRENT_SUBMISSIONS))
            .add_service(BatchServiceServer::new(service))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                shutdown.cancelled().await;
            })
            .await;

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(socket = %self.socket_path.display(), error = %e, "Failed to remove socket");
            }
        }
        tracing::info!("gRPC server stopped");
        result?;
        Ok(())
    }
}
