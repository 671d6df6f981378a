use std::{collections::BTreeMap, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use frostline_protocol::{JobError, JobErrorTag};
use metrics::counter;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::cache::{CachedResponse, HttpResponseCache, fingerprint};

/// Payload of an `http` job.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpJob {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: HttpBody,
    #[serde(default)]
    pub expect: Expectation,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HttpBody {
    #[default]
    Empty,
    String {
        #[serde(rename = "contentType", default)]
        content_type: Option<String>,
        content: String,
    },
    Json {
        content: Value,
    },
    Bytes {
        #[serde(rename = "contentType", default)]
        content_type: Option<String>,
        /// Base64-encoded request body.
        content: String,
    },
}

impl HttpBody {
    fn encode(&self) -> Result<(Option<&str>, Vec<u8>), JobError> {
        match self {
            HttpBody::Empty => Ok((None, Vec::new())),
            HttpBody::String {
                content_type,
                content,
            } => Ok((
                Some(content_type.as_deref().unwrap_or("text/plain")),
                content.clone().into_bytes(),
            )),
            HttpBody::Json { content } => {
                let bytes = serde_json::to_vec(content).map_err(|err| {
                    JobError::new(JobErrorTag::BadPayload, format!("invalid JSON body: {err}"))
                })?;
                Ok((Some("application/json"), bytes))
            }
            HttpBody::Bytes {
                content_type,
                content,
            } => {
                let bytes = BASE64.decode(content).map_err(|err| {
                    JobError::new(
                        JobErrorTag::BadPayload,
                        format!("bytes body is not valid base64: {err}"),
                    )
                })?;
                Ok((
                    Some(content_type.as_deref().unwrap_or("application/octet-stream")),
                    bytes,
                ))
            }
        }
    }
}

/// How the response body is handed back to the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expectation {
    #[default]
    Json,
    Bytes,
    String,
    Whatever,
}

/// Perform an HTTP job, consulting `cache` when present.
///
/// Only transport failures become errors; any status code is delivered as
/// data. Only 2xx responses are written to the cache.
pub async fn resolve(
    client: &Client,
    cache: Option<&HttpResponseCache>,
    job: HttpJob,
) -> Result<Value, JobError> {
    let method = Method::from_bytes(job.method.to_ascii_uppercase().as_bytes()).map_err(|_| {
        JobError::new(
            JobErrorTag::BadPayload,
            format!("unsupported HTTP method `{}`", job.method),
        )
    })?;
    let (content_type, body) = job.body.encode()?;
    let key = fingerprint(method.as_str(), &job.url, &job.headers, &body);

    if let Some(cache) = cache
        && let Some(entry) = cache.get(&key).await
    {
        counter!("frostline_http_cache_hit_total").increment(1);
        debug!(
            target = "application::jobs::http",
            op = "http::resolve",
            result = "cache_hit",
            url = %job.url,
            "HTTP job served from cache"
        );
        return to_value(&entry, job.expect);
    }
    if cache.is_some() {
        counter!("frostline_http_cache_miss_total").increment(1);
    }

    let attempts = job.retries.unwrap_or(0).saturating_add(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match fetch(client, &method, &job, content_type, &body).await {
            Ok(entry) => {
                if let Some(cache) = cache
                    && (200..300).contains(&entry.status)
                    && let Err(err) = cache.put(&key, &entry).await
                {
                    warn!(
                        target = "application::jobs::http",
                        op = "http::resolve",
                        result = "cache_write_error",
                        url = %job.url,
                        error = %err,
                        "Failed to persist HTTP response to cache"
                    );
                }
                return to_value(&entry, job.expect);
            }
            Err(err) => {
                warn!(
                    target = "application::jobs::http",
                    op = "http::resolve",
                    result = "transport_error",
                    url = %job.url,
                    attempt,
                    attempts,
                    error = %err,
                    "HTTP job attempt failed"
                );
                last_error = Some(err);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| JobError::new(JobErrorTag::NetworkError, "request was never attempted")))
}

async fn fetch(
    client: &Client,
    method: &Method,
    job: &HttpJob,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<CachedResponse, JobError> {
    let mut request = client.request(method.clone(), &job.url);
    let has_content_type = job
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
    for (name, value) in &job.headers {
        request = request.header(name, value);
    }
    if let Some(content_type) = content_type
        && !has_content_type
    {
        request = request.header("content-type", content_type);
    }
    if !body.is_empty() {
        request = request.body(body.to_vec());
    }
    if let Some(ms) = job.timeout_ms {
        request = request.timeout(Duration::from_millis(ms));
    }

    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    let url = response.url().to_string();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let bytes = response.bytes().await.map_err(transport_error)?;

    Ok(CachedResponse::new(
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        url,
        headers,
        &bytes,
    ))
}

fn transport_error(err: reqwest::Error) -> JobError {
    if err.is_timeout() {
        JobError::new(JobErrorTag::Timeout, err.to_string())
    } else {
        JobError::new(JobErrorTag::NetworkError, err.to_string())
    }
}

fn to_value(entry: &CachedResponse, expect: Expectation) -> Result<Value, JobError> {
    let bytes = entry.body().map_err(|err| {
        JobError::new(
            JobErrorTag::Io,
            format!("cached response body is corrupt: {err}"),
        )
    })?;

    let (body_kind, body) = match expect {
        Expectation::Whatever => ("none", Value::Null),
        Expectation::Bytes => ("bytes", Value::String(BASE64.encode(&bytes))),
        Expectation::String => (
            "string",
            Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        ),
        Expectation::Json => match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => ("json", value),
            Err(_) => (
                "string",
                Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            ),
        },
    };

    Ok(json!({
        "status": entry.status,
        "statusText": entry.status_text,
        "url": entry.url,
        "headers": entry.headers,
        "bodyKind": body_kind,
        "body": body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &[u8]) -> CachedResponse {
        CachedResponse::new(200, "OK", "https://example.com", BTreeMap::new(), body)
    }

    #[test]
    fn json_expectation_falls_back_to_text() {
        let value = to_value(&entry(b"not json"), Expectation::Json).expect("value");
        assert_eq!(value["bodyKind"], "string");
        assert_eq!(value["body"], "not json");

        let value = to_value(&entry(br#"{"a":1}"#), Expectation::Json).expect("value");
        assert_eq!(value["bodyKind"], "json");
        assert_eq!(value["body"]["a"], 1);
    }

    #[test]
    fn bytes_expectation_is_base64() {
        let value = to_value(&entry(&[0, 1, 2]), Expectation::Bytes).expect("value");
        assert_eq!(value["body"], "AAEC");
    }

    #[test]
    fn whatever_expectation_drops_body() {
        let value = to_value(&entry(b"ignored"), Expectation::Whatever).expect("value");
        assert!(value["body"].is_null());
        assert_eq!(value["status"], 200);
    }

    #[test]
    fn payload_defaults() {
        let job: HttpJob =
            serde_json::from_value(json!({"url": "https://example.com"})).expect("payload");
        assert_eq!(job.method, "GET");
        assert_eq!(job.expect, Expectation::Json);
        assert!(matches!(job.body, HttpBody::Empty));
    }
}
