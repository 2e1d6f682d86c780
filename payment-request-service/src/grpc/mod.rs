//! gRPC module for payment-request-service.

mod convert;
mod service;

pub use service::PaymentRequestServiceImpl;

/// Generated protobuf code.
pub mod proto {
    tonic::include_proto!("logistics.payment_request.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("payment_request_descriptor");
}
