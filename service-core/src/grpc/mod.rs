//! gRPC helpers shared by the services.

pub mod error;

pub use error::{GrpcResult, IntoStatus};

pub use tonic::{Code, Request, Response, Status};
