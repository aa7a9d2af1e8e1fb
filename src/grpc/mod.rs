pub mod batch_service;
pub mod convert;
pub mod server;

pub use batch_service::BatchServiceImpl;
pub use server::GrpcServer;
