//! gRPC interceptors for trace context and request id propagation.

use tonic::{Request, Status};

/// gRPC metadata key for W3C traceparent header.
pub const TRACEPARENT_KEY: &str = "traceparent";

/// gRPC metadata key for request ID.
pub const REQUEST_ID_KEY: &str = "x-request-id";

/// Interceptor that picks up trace context and request id from incoming
/// metadata and records them on the current span.
///
/// # Example
///
/// ```ignore
/// use service_core::grpc::trace_context_interceptor;
///
/// let svc = PaymentRequestServiceServer::with_interceptor(svc, trace_context_interceptor);
/// ```
#[allow(clippy::result_large_err)]
pub fn trace_context_interceptor(request: Request<()>) -> Result<Request<()>, Status> {
    if let Some(traceparent) = extract_traceparent(&request) {
        tracing::debug!(traceparent = %traceparent, "Received trace context");
    }

    if let Some(request_id) = extract_request_id(&request) {
        tracing::Span::current().record("request_id", request_id.as_str());
    }

    Ok(request)
}

/// Extract the traceparent metadata value, if present.
pub fn extract_traceparent<T>(request: &Request<T>) -> Option<String> {
    metadata_value(request, TRACEPARENT_KEY)
}

/// Extract request ID from incoming gRPC request metadata.
pub fn extract_request_id<T>(request: &Request<T>) -> Option<String> {
    metadata_value(request, REQUEST_ID_KEY)
}

fn metadata_value<T>(request: &Request<T>, key: &str) -> Option<String> {
    request
        .metadata()
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_request_id() {
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(REQUEST_ID_KEY, "req-42".parse().unwrap());

        assert_eq!(extract_request_id(&request), Some("req-42".to_string()));
        assert_eq!(extract_traceparent(&request), None);
    }

    #[test]
    fn test_interceptor_passes_through() {
        let request = Request::new(());
        let result = trace_context_interceptor(request);
        assert!(result.is_ok());
    }
}
