//! Payment Request Service - aggregation of logistics partner costs into
//! payment sheets and the payment request batch lifecycle.

pub mod config;
pub mod error;
pub mod grpc;
pub mod models;
pub mod services;
pub mod startup;
