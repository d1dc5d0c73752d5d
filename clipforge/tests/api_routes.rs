mod common;

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use clipforge::api::ApiServer;
use clipforge::domain::JobStatus;
use common::{FakeBackend, TestEngine};
use serde_json::{Value, json};
use tower::ServiceExt;

const API_KEY: &str = "test-key";

async fn engine_and_router(
    backend: std::sync::Arc<FakeBackend>,
    max_jobs: usize,
) -> (TestEngine, Router) {
    let engine = TestEngine::start_with(backend, |config| {
        config.api_secret = Some(API_KEY.to_string());
        config.store.max_jobs = max_jobs;
        config.scheduler.concurrency = 1;
    })
    .await;
    let router = ApiServer::new(
        engine.services.config.server.clone(),
        engine.services.app_state(),
    )
    .build_router();
    (engine, router)
}

fn render_body() -> Value {
    json!({
        "template": "promo",
        "clips": ["https://cdn.example.com/a.mp4"],
        "duration_frames": 150,
        "fps": 30,
        "width": 1080,
        "height": 1920
    })
}

fn authed(method: Method, uri: &str, body: Option<&Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-api-key", API_KEY);
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}

async fn poll_until_terminal(router: &Router, job_id: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, body) = send(
            router,
            authed(Method::GET, &format!("/render/{job_id}"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if matches!(
            body["status"].as_str(),
            Some("COMPLETED" | "FAILED" | "CANCELLED")
        ) {
            return body;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn submit_then_poll_until_completed() {
    let (engine, router) = engine_and_router(FakeBackend::new(), 10).await;

    let (status, body) = send(
        &router,
        authed(Method::POST, "/render", Some(&render_body())),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "PENDING");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let job = poll_until_terminal(&router, &job_id).await;
    assert_eq!(job["status"], "COMPLETED");
    assert_eq!(job["progress"], 1.0);
    assert_eq!(
        job["output_url"],
        format!("http://renders.test/outputs/{job_id}.mp4").as_str()
    );
    assert!(job.get("error").is_none());
    assert!(job["created_at"].is_string());
    assert!(job["updated_at"].is_string());

    // The output is served without an API key.
    let request = Request::builder()
        .uri(format!("/outputs/{job_id}.mp4"))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"fake video");

    engine.shutdown().await;
}

#[tokio::test]
async fn missing_or_wrong_api_key_is_unauthorized() {
    let (engine, router) = engine_and_router(FakeBackend::new(), 10).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/render")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(render_body().to_string()))
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let request = Request::builder()
        .uri("/render/whatever")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/render/whatever")
        .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert!(engine.services.store.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_with_400() {
    let (engine, router) = engine_and_router(FakeBackend::new(), 10).await;

    let mut both = render_body();
    both["composition_source"] = json!("export default () => null;");
    let mut unknown_template = render_body();
    unknown_template["template"] = json!("missing");
    let mut bad_callback = render_body();
    bad_callback["callback_url"] = json!("http://169.254.169.254/latest");

    for (body, code) in [
        (both, "VALIDATION_ERROR"),
        (unknown_template, "VALIDATION_ERROR"),
        (json!({"template": "promo"}), "VALIDATION_ERROR"),
        (bad_callback, "CALLBACK_REJECTED"),
    ] {
        let (status, response) =
            send(&router, authed(Method::POST, "/render", Some(&body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(response["code"], code, "{body}");
    }

    let request = Request::builder()
        .method(Method::POST)
        .uri("/render")
        .header("x-api-key", API_KEY)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(engine.services.store.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn capacity_is_reported_as_429() {
    let backend = FakeBackend::new().with_render_delay(Duration::from_secs(30));
    let (engine, router) = engine_and_router(backend, 1).await;

    let (status, _) = send(
        &router,
        authed(Method::POST, "/render", Some(&render_body())),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(
        &router,
        authed(Method::POST, "/render", Some(&render_body())),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "CAPACITY_EXCEEDED");
    assert_eq!(body["details"]["max_jobs"], 1);

    let (status, _) = send(
        &router,
        Request::builder()
            .uri("/health/ready")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    engine.shutdown().await;
}

#[tokio::test]
async fn cancel_running_job_then_conflict() {
    let backend = FakeBackend::new().with_render_delay(Duration::from_secs(30));
    let (engine, router) = engine_and_router(backend, 10).await;

    let (_, body) = send(
        &router,
        authed(Method::POST, "/render", Some(&render_body())),
    )
    .await;
    let job_id = body["job_id"].as_str().unwrap().to_string();
    engine
        .wait_status(&job_id, JobStatus::Running, Duration::from_secs(5))
        .await;

    let (status, body) = send(
        &router,
        authed(Method::DELETE, &format!("/render/{job_id}"), None),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["job_id"], job_id.as_str());

    let job = poll_until_terminal(&router, &job_id).await;
    assert_eq!(job["status"], "CANCELLED");
    assert!(job.get("output_url").is_none());

    let (status, body) = send(
        &router,
        authed(Method::DELETE, &format!("/render/{job_id}"), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (status, _) = send(
        &router,
        authed(Method::DELETE, "/render/does-not-exist", None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    engine.shutdown().await;
}

#[tokio::test]
async fn health_endpoints_are_public() {
    let (engine, router) = engine_and_router(FakeBackend::new(), 10).await;

    let (status, body) = send(
        &router,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["ready"], true);
    assert_eq!(body["scheduler"]["concurrency"], 1);
    assert_eq!(body["scheduler"]["max_jobs"], 10);
    assert_eq!(body["cache"]["entries"], 0);
    assert_eq!(body["pool"]["status"], "empty");
    assert!(body["version"].is_string());
    assert!(body["components"]["scheduler"].is_object());

    let (status, body) = send(
        &router,
        Request::builder()
            .uri("/health/live")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");

    let (status, _) = send(
        &router,
        Request::builder()
            .uri("/health/ready")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    engine.shutdown().await;
}
