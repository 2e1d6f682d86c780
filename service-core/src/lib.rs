//! service-core: Shared infrastructure for the settlement services.
pub mod config;
pub mod error;
pub mod grpc;
pub mod middleware;
pub mod observability;

pub use axum;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tonic;
pub use tracing;
pub use validator;
