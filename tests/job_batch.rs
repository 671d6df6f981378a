use std::collections::BTreeMap;

use frostline::{
    application::{
        jobs::{JobResolver, ResolverConfig},
        render::{FnRuntime, RenderContext, RenderInput, render},
    },
    protocol::{
        ApiResponse, ApiResponseKind, COMPATIBILITY_KEY, FromRuntime, InternalJob, JobErrorTag,
        JobResponse, PendingJob, RenderMode, RenderOutcome, RequestPayload, ToRuntime,
    },
};
use httpmock::prelude::*;
use serde_json::{Value, json};
use tempfile::TempDir;

#[tokio::test]
async fn batch_returns_one_result_per_distinct_hash() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/posts");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!([{"title": "First"}]));
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let jobs = JobResolver::new(ResolverConfig::new(RenderMode::Dev, dir.path()).quiet(true))
        .expect("resolver");
    let session = jobs.session();

    let posts = json!({"url": server.url("/posts")});
    let results = session
        .resolve_batch(vec![
            PendingJob::http("posts", posts.clone()),
            PendingJob::http("posts", posts),
            PendingJob::internal("clock", InternalJob::Now, Value::Null),
            PendingJob::http("down", json!({"url": "http://127.0.0.1:9/unreachable"})),
        ])
        .await;

    assert_eq!(
        results.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["clock", "down", "posts"]
    );
    let JobResponse::Ok(posts) = &results["posts"] else {
        panic!("expected posts to resolve: {:?}", results["posts"]);
    };
    assert_eq!(posts["status"], 200);
    assert_eq!(posts["body"], json!([{"title": "First"}]));
    assert!(results["clock"].is_ok());
    assert_eq!(results["down"].error_tag(), Some(JobErrorTag::NetworkError));
    mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn build_mode_serves_repeat_requests_from_disk_cache() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/settings");
            then.status(200).body("{\"title\":\"Site\"}");
        })
        .await;

    let dir = TempDir::new().expect("temp dir");
    let config = ResolverConfig::new(RenderMode::Build, dir.path())
        .with_http_cache_dir(dir.path().join("http-cache"))
        .quiet(true);
    let payload = json!({"url": server.url("/settings")});

    for _ in 0..2 {
        let jobs = JobResolver::new(config.clone()).expect("resolver");
        let results = jobs
            .session()
            .resolve_batch(vec![PendingJob::http("settings", payload.clone())])
            .await;
        assert!(results["settings"].is_ok());
    }
    mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn session_delivers_batch_results_to_runtime() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/greeting");
            then.status(200).body("\"hi\"");
        })
        .await;
    let url = server.url("/greeting");

    let runtime = FnRuntime::new(COMPATIBILITY_KEY, move |_, out, mut replies| {
        let url = url.clone();
        async move {
            let jobs = vec![PendingJob::http("greeting", json!({"url": url}))];
            let _ = out.send(Ok(FromRuntime::JobRequests { jobs }));
            let Some(ToRuntime::JobBatch { results }) = replies.recv().await else {
                return;
            };
            let results: BTreeMap<String, JobResponse> = results;
            let body = match &results["greeting"] {
                JobResponse::Ok(value) => value["body"].as_str().unwrap_or("").to_string(),
                JobResponse::Error(err) => err.message.clone(),
            };
            let _ = out.send(Ok(FromRuntime::ApiResponse {
                response: ApiResponse {
                    subkind: ApiResponseKind::ServerResponse,
                    status_code: 200,
                    headers: Vec::new(),
                    body,
                    is_base64: false,
                },
            }));
        }
    });

    let dir = TempDir::new().expect("temp dir");
    let jobs = JobResolver::new(ResolverConfig::new(RenderMode::Dev, dir.path()).quiet(true))
        .expect("resolver");
    let ctx = RenderContext {
        jobs: &jobs,
        runtime: &runtime,
        base_path: "/",
        session_timeout: None,
    };
    let outcome = render(ctx, RenderInput::new(RequestPayload::get("/")))
        .await
        .expect("rendered");
    let RenderOutcome::ApiResponse(response) = outcome else {
        panic!("expected api response");
    };
    assert_eq!(response.body, "hi");
}
