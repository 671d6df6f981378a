use std::{collections::BTreeMap, fs, num::NonZeroUsize, sync::Arc};

use frostline::{
    application::{
        build::{BuildOptions, ROUTE_PATTERNS_FILE, run_build},
        frozen,
        jobs::{ResolverConfig, WatchedPatterns},
        render::{FnRuntime, Runtime},
        worker::WorkerSpec,
    },
    protocol::{
        ApiResponse, ApiResponseKind, BuildError, COMPATIBILITY_KEY, FromRuntime, HtmlPage,
        PageProgress, RenderMode, frame,
    },
};
use serde_json::{Value, json};
use tempfile::TempDir;

const PAGE_COUNT: usize = 24;

fn page_paths() -> Vec<String> {
    (0..PAGE_COUNT).map(|n| format!("/posts/{n}")).collect()
}

fn site_runtime() -> impl Runtime + 'static {
    FnRuntime::new(COMPATIBILITY_KEY, |init, out, _| async move {
        let message = match init.pathname.as_str() {
            "/all-paths.json" => FromRuntime::ApiResponse {
                response: ApiResponse {
                    subkind: ApiResponseKind::ServerResponse,
                    status_code: 200,
                    headers: vec![("content-type".into(), "application/json".into())],
                    body: json!({
                        "paths": page_paths().into_iter().chain(["/".to_string(), "/posts/3".to_string()]).collect::<Vec<_>>(),
                        "routes": ["/", "/posts/:id"],
                    })
                    .to_string(),
                    is_base64: false,
                },
            },
            "/posts/13" => FromRuntime::Errors {
                errors: vec![BuildError::new(
                    "Missing Data",
                    "/posts/13",
                    "post 13 has no title",
                )],
            },
            pathname => FromRuntime::PageProgress {
                page: PageProgress::Html(HtmlPage {
                    is_404: false,
                    title: format!("Page {pathname}"),
                    body_html: format!(
                        r#"<header data-static="__SHARED__"><nav><a href="/">Home</a></nav></header><article data-static="__ROUTE__"><div><div>{pathname}</div></div></article><img data-static="hero" src="/hero.png">"#
                    ),
                    head_tags: String::new(),
                    root_attrs: BTreeMap::new(),
                    page_data: pathname.as_bytes().to_vec(),
                }),
            },
        };
        let _ = out.send(Ok(message));
    })
}

fn spec(dir: &TempDir) -> WorkerSpec {
    WorkerSpec {
        resolver: ResolverConfig::new(RenderMode::Build, dir.path())
            .with_watched(WatchedPatterns::new())
            .quiet(true),
        runtime: Arc::new(site_runtime()),
        base_path: "/".into(),
        session_timeout: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn every_page_is_rendered_or_reported() {
    let dir = TempDir::new().expect("temp dir");
    let output_dir = dir.path().join("dist");
    let options = BuildOptions {
        output_dir: output_dir.clone(),
        workers: NonZeroUsize::new(3).expect("non-zero"),
    };
    let spec = spec(&dir);

    let report = tokio::task::spawn_blocking(move || run_build(spec, options))
        .await
        .expect("build thread")
        .expect("build report");

    assert_eq!(report.rendered.len(), PAGE_COUNT);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].pathname, "/posts/13");
    assert!(report.failed());
    assert!(report.render_failures().contains("post 13 has no title"));

    let patterns: Value = serde_json::from_str(
        &fs::read_to_string(output_dir.join(ROUTE_PATTERNS_FILE)).expect("route patterns"),
    )
    .expect("json");
    assert_eq!(patterns.as_array().map(Vec::len), Some(2));

    let frame_bytes = fs::read(output_dir.join("posts/7/content.dat")).expect("frame");
    let decoded = frame::decode(&frame_bytes).expect("decoded");
    assert_eq!(decoded.page_data, b"/posts/7");
    assert_eq!(
        decoded.regions.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["0", "hero", "shared:0"]
    );
    assert!(decoded.regions["0"].ends_with("</div></div></article>"));

    let index = fs::read_to_string(output_dir.join("posts/7/index.html")).expect("index");
    assert!(index.contains("<title>Page /posts/7</title>"));
    assert!(!index.contains("__SHARED__"));
    assert!(!output_dir.join("posts/13").exists());
}

#[test]
fn extraction_is_deterministic_for_identical_markup() {
    let html = r#"<main><section data-static="__ROUTE__"><section><p>nested</p></section></section><aside data-static="__SHARED__"><br></aside></main>"#;
    let first = frozen::extract(html).expect("first pass");
    let second = frozen::extract(html).expect("second pass");
    assert_eq!(first, second);
    assert_eq!(
        first.region_map()["0"],
        "<section data-static=\"0\"><section><p>nested</p></section></section>"
    );
    assert!(first.region_map().contains_key("shared:0"));
}
