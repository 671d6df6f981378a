use std::time::Instant;

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{FromRequest, Multipart, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header::CONTENT_TYPE,
    },
    middleware,
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use frostline_protocol::{ApiResponseKind, RegionMap, RenderMode, RenderOutcome, frame};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    application::{
        build::{CONTENT_FILE, assemble_document},
        dev::{DevPool, DevPoolError},
        error::HttpError,
        frozen,
        render::RenderInput,
    },
    domain::request::{RenderRequest, RequestBody},
};

use super::middleware::{log_responses, set_request_context};

const SOURCE: &str = "infra::http::pages";
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const FRAME_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone)]
pub struct DevState {
    pub pool: DevPool,
}

impl DevState {
    pub fn new(pool: DevPool) -> Self {
        Self { pool }
    }
}

/// Every path is a page; routing happens inside the runtime.
pub fn build_router(state: DevState) -> Router {
    Router::new()
        .fallback(render_page)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn render_page(State(state): State<DevState>, request: Request<Body>) -> Response {
    let path = request.uri().path().to_string();
    let wants_frame = path.ends_with(CONTENT_FILE);
    let started = Instant::now();

    let payload = match to_render_request(&state, request).await {
        Ok(payload) => payload,
        Err(err) => return err.into_response(),
    };
    let raw_url = payload.raw_url.clone();

    let mut input = RenderInput::new(payload);
    input.has_fs_access = true;

    let outcome = match state.pool.render(input).await {
        Ok(outcome) => outcome,
        Err(DevPoolError::Session(err)) => {
            warn!(
                target = "frostline::http::pages",
                url = %raw_url,
                error = %err,
                "Render session failed"
            );
            err.into_outcome(RenderMode::Dev, &path)
        }
        Err(err) => return HttpError::from(err).into_response(),
    };
    debug!(
        target = "frostline::http::pages",
        url = %raw_url,
        status = outcome.status_code(),
        elapsed_ms = started.elapsed().as_millis(),
        "Rendered page"
    );

    let response = if wants_frame {
        frame_response(&outcome, &path)
    } else {
        page_response(&outcome, &path)
    };
    response.unwrap_or_else(IntoResponse::into_response)
}

async fn to_render_request(
    state: &DevState,
    request: Request<Body>,
) -> Result<RenderRequest, HttpError> {
    let method = request.method().to_string();
    let raw_url = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), ToString::to_string);
    let headers = header_pairs(request.headers());
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));

    let body = if is_multipart {
        read_multipart(state, request).await?
    } else {
        let bytes = to_bytes(request.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|err| {
                HttpError::from_error(SOURCE, StatusCode::BAD_REQUEST, "Invalid request body", &err)
            })?;
        if bytes.is_empty() {
            RequestBody::None
        } else {
            RequestBody::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
    };

    Ok(RenderRequest {
        method,
        raw_url,
        headers,
        body,
        request_time: (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
    })
}

async fn read_multipart(
    state: &DevState,
    request: Request<Body>,
) -> Result<RequestBody, HttpError> {
    let invalid = |detail: String| {
        HttpError::new(SOURCE, StatusCode::BAD_REQUEST, "Invalid multipart body", detail)
    };

    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|err| invalid(err.body_text()))?;

    let mut fields = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| invalid(err.body_text()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if field.file_name().is_some() {
            debug!(
                target = "frostline::http::pages",
                field = %name,
                "Skipping uploaded file in multipart body"
            );
            continue;
        }
        let value = field.text().await.map_err(|err| invalid(err.body_text()))?;
        fields.push((name, value));
    }
    Ok(RequestBody::Multipart(fields))
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

fn page_response(outcome: &RenderOutcome, path: &str) -> Result<Response, HttpError> {
    match outcome {
        RenderOutcome::Html(page) => {
            let extraction = frozen::extract(&page.body_html).map_err(|err| {
                HttpError::from_error(
                    SOURCE,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    &err,
                )
            })?;
            let document = assemble_document(page, &extraction.html);
            let headers = [("content-type".to_string(), "text/html; charset=utf-8".to_string())];
            build_response(outcome.status_code(), &headers, document.into_bytes())
        }
        RenderOutcome::Bytes(page) => {
            build_response(page.status_code, &page.headers, page.page_data.clone())
        }
        RenderOutcome::ApiResponse(response) => {
            let body = if response.is_base64 {
                BASE64.decode(&response.body).map_err(|err| {
                    HttpError::from_error(
                        SOURCE,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal Server Error",
                        &err,
                    )
                })?
            } else {
                response.body.clone().into_bytes()
            };
            let mut headers = response.headers.clone();
            let has_content_type = headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
            if response.subkind == ApiResponseKind::StaticFile && !has_content_type {
                let guessed = mime_guess::from_path(path).first_or_octet_stream();
                headers.push(("content-type".to_string(), guessed.essence_str().to_string()));
            }
            build_response(response.status_code, &headers, body)
        }
    }
}

/// Content frame for client-side navigation. Server responses pass through
/// unchanged.
fn frame_response(outcome: &RenderOutcome, path: &str) -> Result<Response, HttpError> {
    let internal = |err: &dyn std::error::Error| {
        HttpError::from_error(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            err,
        )
    };
    let (regions, page_data) = match outcome {
        RenderOutcome::Html(page) => {
            let extraction = frozen::extract(&page.body_html).map_err(|err| internal(&err))?;
            (extraction.region_map(), &page.page_data)
        }
        RenderOutcome::Bytes(page) => (RegionMap::new(), &page.page_data),
        RenderOutcome::ApiResponse(_) => return page_response(outcome, path),
    };
    let encoded = frame::encode(&regions, page_data).map_err(|err| internal(&err))?;
    let headers = [("content-type".to_string(), FRAME_CONTENT_TYPE.to_string())];
    build_response(outcome.status_code(), &headers, encoded)
}

fn build_response(
    status: u16,
    headers: &[(String, String)],
    body: Vec<u8>,
) -> Result<Response, HttpError> {
    let status = StatusCode::from_u16(status).map_err(|err| {
        HttpError::from_error(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            &err,
        )
    })?;
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            return Err(HttpError::new(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                format!("runtime returned an invalid header `{name}`"),
            ));
        };
        response.headers_mut().append(name, value);
    }
    Ok(response)
}
