//! HTTP middleware shared by the service side-port routers.
pub mod tracing;
