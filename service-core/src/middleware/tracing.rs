use crate::grpc::interceptors::REQUEST_ID_KEY;
use axum::http::HeaderValue;
use axum::{extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

/// Same key the gRPC interceptor reads, so one id follows a call across both
/// listeners.
pub const REQUEST_ID_HEADER: &str = REQUEST_ID_KEY;

const MAX_REQUEST_ID_LEN: usize = 128;

/// Propagate the caller's `x-request-id`, or mint one, and echo it on the
/// response.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = accepted_request_id(
        req.headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|h| h.to_str().ok()),
    );

    tracing::Span::current().record("request_id", request_id.as_str());

    let header_value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = header_value.clone() {
        req.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let mut response = next.run(req).await;

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Keep a caller id only when it is short printable ASCII. Anything else is
/// replaced so it never reaches log fields verbatim.
fn accepted_request_id(incoming: Option<&str>) -> String {
    match incoming.map(str::trim) {
        Some(id)
            if !id.is_empty()
                && id.len() <= MAX_REQUEST_ID_LEN
                && id.bytes().all(|b| b.is_ascii_graphic()) =>
        {
            id.to_string()
        }
        Some(rejected) => {
            tracing::debug!(len = rejected.len(), "Replacing unusable request id");
            Uuid::new_v4().to_string()
        }
        None => Uuid::new_v4().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_request_id_is_kept() {
        assert_eq!(accepted_request_id(Some("req-7f3a")), "req-7f3a");
    }

    #[test]
    fn test_missing_request_id_is_minted() {
        let id = accepted_request_id(None);
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_unusable_request_id_is_replaced() {
        let too_long = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        for bad in ["", "has space", too_long.as_str()] {
            let id = accepted_request_id(Some(bad));
            assert!(Uuid::parse_str(&id).is_ok(), "kept {:?}", bad);
        }
    }
}
