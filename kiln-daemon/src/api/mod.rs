//! API Module
//!
//! The daemon's single command endpoint.

pub mod command;
pub mod envelope;
pub mod error;

use axum::{Router, extract::DefaultBodyLimit, routing::post};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::commands::Dispatcher;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,

    /// Treat every request as arriving over TLS
    pub assume_secure: bool,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(command::handle_command))
        .with_state(state)
        .layer(DefaultBodyLimit::max(envelope::MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::harness;
    use crate::sandbox::testing::FakeSandbox;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header::LOCATION};
    use kiln_core::domain::gpu::WorkloadKind;
    use tower::ServiceExt;

    fn app(sandbox: FakeSandbox, assume_secure: bool) -> (Router, crate::commands::testing::Harness) {
        let h = harness(sandbox);
        let router = create_router(AppState {
            dispatcher: h.dispatcher.clone(),
            assume_secure,
        });
        (router, h)
    }

    fn json_request(body: serde_json::Value, secure: bool) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/")
            .header("host", "198.51.100.4:46443")
            .header("content-type", "application/json");
        if secure {
            builder = builder.header("x-forwarded-proto", "https");
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_wrong_identity_is_forbidden_before_redirect() {
        let (app, _h) = app(FakeSandbox::default(), false);
        let response = app
            .oneshot(json_request(
                serde_json::json!({"cmd": "status", "rentaflopId": "intruder"}),
                false,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_plain_http_is_redirected() {
        let (app, _h) = app(FakeSandbox::default(), false);
        let response = app
            .oneshot(json_request(
                serde_json::json!({"cmd": "status", "rentaflop_id": "host-1"}),
                false,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://198.51.100.4:46443/"
        );
    }

    #[tokio::test]
    async fn test_status_over_forwarded_tls() {
        let (app, _h) = app(FakeSandbox::with_running(&[(0, WorkloadKind::Crypto, &[])]), false);
        let response = app
            .oneshot(json_request(
                serde_json::json!({"cmd": "status", "rentaflop_id": "host-1"}),
                true,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"]["gpus"][0]["state"], "crypto");
    }

    #[tokio::test]
    async fn test_multipart_render_submission() {
        let (app, h) = app(FakeSandbox::default(), true);
        let boundary = "kilnboundary";
        let envelope = serde_json::json!({
            "cmd": "mine",
            "rentaflop_id": "host-1",
            "params": {"action": "start", "gpu": 1, "task_id": "T1", "start_frame": 1, "n_frames": 5}
        });
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"json\"\r\n\r\n{env}\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"render_file\"; filename=\"scene.blend\"\r\n\
             Content-Type: application/octet-stream\r\n\r\nscene\r\n--{b}--\r\n",
            b = boundary,
            env = envelope
        );
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.sandbox.kinds_on(1), vec![WorkloadKind::Render]);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (app, _h) = app(FakeSandbox::default(), true);
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
