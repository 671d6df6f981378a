use std::{num::NonZeroUsize, sync::Arc};

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode, header::CONTENT_TYPE},
};
use frostline::{
    application::{
        dev::DevPool,
        jobs::{JobResolver, ResolverConfig},
        render::{FnRuntime, RenderContext, RenderInput, Runtime, render_or_error},
        worker::WorkerSpec,
    },
    domain::request::{RenderRequest, RequestBody, query_param},
    infra::http::{DevState, build_router},
    protocol::{
        ApiResponse, ApiResponseKind, BuildError, COMPATIBILITY_KEY, FromRuntime, RenderMode,
        RenderOutcome,
    },
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

const INVALID_REQUEST: &str =
    "Invalid request, expected either a JSON body or a 'first=' query param.";
const BOUNDARY: &str = "frostline-test-boundary";

fn text_response(status_code: u16, body: impl Into<String>) -> ApiResponse {
    ApiResponse {
        subkind: ApiResponseKind::ServerResponse,
        status_code,
        headers: vec![("content-type".into(), "text/plain".into())],
        body: body.into(),
        is_base64: false,
    }
}

fn first_name(request: &RenderRequest) -> Option<String> {
    let from_body = match &request.body {
        RequestBody::Multipart(fields) => fields
            .iter()
            .find(|(name, _)| name == "first")
            .map(|(_, value)| value.clone()),
        RequestBody::Text(text) => serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|value| value.get("first")?.as_str().map(str::to_string)),
        RequestBody::None => None,
    };
    from_body.or_else(|| query_param(&request.raw_url, "first"))
}

fn greeting_runtime() -> impl Runtime + 'static {
    FnRuntime::new(COMPATIBILITY_KEY, |init, out, _| async move {
        let response = match first_name(&init.request) {
            Some(first) => text_response(200, format!("Hello {first}")),
            None => text_response(400, INVALID_REQUEST),
        };
        let _ = out.send(Ok(FromRuntime::ApiResponse { response }));
    })
}

fn multipart_request(uri: &str, fields: &[(&str, &str)]) -> RenderRequest {
    let mut request = RenderRequest::get(uri);
    request.method = "POST".into();
    request.body = RequestBody::Multipart(
        fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
    );
    request
}

async fn render_greeting(request: RenderRequest) -> RenderOutcome {
    let dir = TempDir::new().expect("temp dir");
    let jobs = JobResolver::new(ResolverConfig::new(RenderMode::Dev, dir.path()).quiet(true))
        .expect("resolver");
    let runtime = greeting_runtime();
    let ctx = RenderContext {
        jobs: &jobs,
        runtime: &runtime,
        base_path: "/",
        session_timeout: None,
    };
    render_or_error(ctx, RenderInput::new(request)).await
}

#[tokio::test]
async fn multipart_first_field_is_greeted() {
    let outcome = render_greeting(multipart_request("/greet", &[("first", "Dillon")])).await;
    let RenderOutcome::ApiResponse(response) = outcome else {
        panic!("expected api response, got {outcome:?}");
    };
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "Hello Dillon");
    assert_eq!(
        response.headers,
        vec![("content-type".to_string(), "text/plain".to_string())]
    );
}

#[tokio::test]
async fn missing_first_field_is_rejected() {
    let outcome = render_greeting(multipart_request("/greet", &[])).await;
    let surfaced = outcome.surface();
    assert_eq!(surfaced.status_code, 400);
    assert_eq!(surfaced.body.as_deref(), Some(INVALID_REQUEST));
}

#[tokio::test]
async fn query_param_is_accepted_as_fallback() {
    let outcome = render_greeting(RenderRequest::get("/greet?first=Ada")).await;
    assert_eq!(outcome.status_code(), 200);
    assert_eq!(outcome.surface().body.as_deref(), Some("Hello Ada"));
}

fn dev_state(dir: &TempDir) -> DevState {
    dev_state_with(dir, greeting_runtime())
}

fn dev_state_with(dir: &TempDir, runtime: impl Runtime + 'static) -> DevState {
    let spec = WorkerSpec {
        resolver: ResolverConfig::new(RenderMode::Dev, dir.path()).quiet(true),
        runtime: Arc::new(runtime),
        base_path: "/".into(),
        session_timeout: None,
    };
    let pool = DevPool::start(spec, NonZeroUsize::new(2).expect("non-zero")).expect("pool");
    DevState::new(pool)
}

fn multipart_body(fields: &[(&str, &str)]) -> String {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    body
}

async fn post_form(state: DevState, fields: &[(&str, &str)]) -> (StatusCode, String) {
    let request = Request::builder()
        .method("POST")
        .uri("/greet")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(fields)))
        .expect("request");

    send(state, request).await
}

async fn send(state: DevState, request: Request<Body>) -> (StatusCode, String) {
    let response = build_router(state).oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

#[tokio::test]
async fn dev_server_greets_multipart_form() {
    let dir = TempDir::new().expect("temp dir");
    let (status, body) = post_form(dev_state(&dir), &[("first", "Dillon")]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Hello Dillon");
}

#[tokio::test]
async fn dev_server_rejects_form_without_first() {
    let dir = TempDir::new().expect("temp dir");
    let (status, body) = post_form(dev_state(&dir), &[("last", "Kurt")]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, INVALID_REQUEST);
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

#[tokio::test]
async fn dev_server_answers_runtime_errors_with_diagnostics() {
    let dir = TempDir::new().expect("temp dir");
    let runtime = FnRuntime::new(COMPATIBILITY_KEY, |init, out, _| async move {
        let _ = out.send(Ok(FromRuntime::Errors {
            errors: vec![BuildError::new(
                "Missing Data",
                init.pathname.as_str(),
                "post has no title",
            )],
        }));
    });

    let (status, body) = send(dev_state_with(&dir, runtime), get("/x")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let diagnostics: Value = serde_json::from_str(&body).expect("json diagnostics");
    let message = diagnostics["message"].as_str().expect("message");
    assert!(message.contains("post has no title"), "{message}");
    assert_eq!(diagnostics["errors"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn dev_server_reports_incompatible_runtime() {
    let dir = TempDir::new().expect("temp dir");
    let runtime = FnRuntime::new(COMPATIBILITY_KEY + 1, |_, out, _| async move {
        let _ = out.send(Ok(FromRuntime::ApiResponse {
            response: text_response(200, "unreachable"),
        }));
    });

    let (status, body) = send(dev_state_with(&dir, runtime), get("/")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("does not match host key"), "{body}");
    assert!(!body.contains("unreachable"));
}
