//! Request logging and request-id plumbing

use axum::{extract::Request, middleware::Next, response::Response};
use http::HeaderValue;
use std::future::Future;
use std::time::Instant;
use tower_http::request_id::{MakeRequestId, RequestId};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Generates a v4 UUID for every request that arrives without `x-request-id`
#[derive(Clone, Copy, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &http::Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Logs method, path, status and latency for each request inside a span carrying the
/// request id.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let span = tracing::info_span!("http_request", %method, %path, %request_id);

    async move {
        let response = next.run(request).await;
        let status = response.status();
        let latency_ms = started.elapsed().as_millis();

        if status.is_server_error() {
            warn!(status = status.as_u16(), latency_ms, "request failed");
        } else {
            info!(status = status.as_u16(), latency_ms, "request completed");
        }

        response
    }
    .instrument(span)
    .await
}

/// Wraps an outbound call with timing and outcome logging
pub async fn log_external_call<F, T, E>(service: &str, operation: &str, call: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let result = call.await;
    let elapsed_ms = started.elapsed().as_millis();

    match &result {
        Ok(_) => info!(service, operation, elapsed_ms, "external call succeeded"),
        Err(e) => warn!(service, operation, elapsed_ms, error = %e, "external call failed"),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_request_id_is_generated() {
        let mut maker = UuidRequestId;
        let request = http::Request::builder().body(()).unwrap();
        let id = maker.make_request_id(&request).unwrap();
        let value = id.header_value().to_str().unwrap();
        assert!(Uuid::parse_str(value).is_ok());
    }

    #[tokio::test]
    async fn log_external_call_passes_result_through() {
        let ok: Result<u8, String> = log_external_call("daraja", "token", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<u8, String> =
            log_external_call("daraja", "token", async { Err("boom".to_string()) }).await;
        assert!(err.is_err());
    }
}
