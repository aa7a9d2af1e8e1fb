pub mod client;
pub mod config;
pub mod error;
pub mod fleet;
pub mod grpc;
pub mod node;
pub mod remote_fn;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("batch");
}
