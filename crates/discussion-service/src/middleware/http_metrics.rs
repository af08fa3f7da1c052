//! HTTP metrics middleware.
//!
//! Records every response, including the ones axum produces before a
//! handler runs (404, 405, 415, JSON rejections).

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::observability::metrics::record_http_request;

/// Record method, normalized endpoint, status and duration of a request.
///
/// Applied as the outermost layer.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_http_request(&method, &path, response.status().as_u16(), start.elapsed());

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::{get, post},
        Json, Router,
    };
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "OK"
    }

    async fn failing_handler() -> (StatusCode, &'static str) {
        (StatusCode::INTERNAL_SERVER_ERROR, "Error")
    }

    async fn json_handler(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
        Json(body)
    }

    fn test_app() -> Router {
        Router::new()
            .route("/health", get(ok_handler))
            .route("/broken", get(failing_handler))
            .route("/echo", post(json_handler))
            .layer(middleware::from_fn(http_metrics_middleware))
    }

    async fn status_of(request: HttpRequest<Body>) -> StatusCode {
        test_app()
            .oneshot(request)
            .await
            .expect("request should succeed")
            .status()
    }

    #[tokio::test]
    async fn test_middleware_passes_success_through() {
        let request = HttpRequest::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("request builder should succeed");

        assert_eq!(status_of(request).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_middleware_passes_handler_error_through() {
        let request = HttpRequest::builder()
            .uri("/broken")
            .body(Body::empty())
            .expect("request builder should succeed");

        assert_eq!(status_of(request).await, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_middleware_sees_framework_rejections() {
        let not_found = HttpRequest::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .expect("request builder should succeed");
        assert_eq!(status_of(not_found).await, StatusCode::NOT_FOUND);

        let wrong_method = HttpRequest::builder()
            .method("DELETE")
            .uri("/health")
            .body(Body::empty())
            .expect("request builder should succeed");
        assert_eq!(status_of(wrong_method).await, StatusCode::METHOD_NOT_ALLOWED);

        let no_content_type = HttpRequest::builder()
            .method("POST")
            .uri("/echo")
            .body(Body::from("{}"))
            .expect("request builder should succeed");
        assert_eq!(
            status_of(no_content_type).await,
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }
}
