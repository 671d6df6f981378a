use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Incoming request as handed to a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub method: String,
    pub raw_url: String,
    /// Header pairs in arrival order; names are lower-cased.
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    /// Milliseconds since the Unix epoch.
    pub request_time: i64,
}

impl RequestPayload {
    pub fn get(raw_url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            raw_url: raw_url.into(),
            headers: Vec::new(),
            body: RequestBody::None,
            request_time: 0,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum RequestBody {
    None,
    Text(String),
    /// Decoded `multipart/form-data` text fields in submission order.
    Multipart(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HtmlPage {
    #[serde(default)]
    pub is_404: bool,
    pub title: String,
    pub body_html: String,
    #[serde(default)]
    pub head_tags: String,
    #[serde(default)]
    pub root_attrs: BTreeMap<String, String>,
    #[serde(with = "crate::serde_base64", default)]
    pub page_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BytesPage {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(with = "crate::serde_base64", default)]
    pub page_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiResponseKind {
    ServerResponse,
    StaticFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub subkind: ApiResponseKind,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub is_base64: bool,
}

/// Terminal page progress reported by a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PageProgress {
    Html(HtmlPage),
    Bytes(BytesPage),
}

/// Result of one render session. Exactly one variant is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RenderOutcome {
    Html(HtmlPage),
    Bytes(BytesPage),
    ApiResponse(ApiResponse),
}

impl From<PageProgress> for RenderOutcome {
    fn from(progress: PageProgress) -> Self {
        match progress {
            PageProgress::Html(page) => RenderOutcome::Html(page),
            PageProgress::Bytes(page) => RenderOutcome::Bytes(page),
        }
    }
}

impl From<ApiResponse> for RenderOutcome {
    fn from(response: ApiResponse) -> Self {
        RenderOutcome::ApiResponse(response)
    }
}

impl RenderOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            RenderOutcome::Html(page) if page.is_404 => 404,
            RenderOutcome::Html(_) => 200,
            RenderOutcome::Bytes(page) => page.status_code,
            RenderOutcome::ApiResponse(response) => response.status_code,
        }
    }

    /// Flatten into the shape consumed by adapters and the dev server.
    pub fn surface(&self) -> SurfacedOutcome {
        match self {
            RenderOutcome::Html(page) => SurfacedOutcome {
                is_404: page.is_404,
                status_code: self.status_code(),
                headers: vec![(
                    "content-type".to_string(),
                    "text/html; charset=utf-8".to_string(),
                )],
                kind: "html",
                body: None,
                html_string: Some(page.body_html.clone()),
                page_data: Some(page.page_data.clone()),
            },
            RenderOutcome::Bytes(page) => SurfacedOutcome {
                is_404: page.status_code == 404,
                status_code: page.status_code,
                headers: page.headers.clone(),
                kind: "bytes",
                body: None,
                html_string: None,
                page_data: Some(page.page_data.clone()),
            },
            RenderOutcome::ApiResponse(response) => SurfacedOutcome {
                is_404: response.status_code == 404,
                status_code: response.status_code,
                headers: response.headers.clone(),
                kind: match response.subkind {
                    ApiResponseKind::ServerResponse => "api-response",
                    ApiResponseKind::StaticFile => "static-file",
                },
                body: Some(response.body.clone()),
                html_string: None,
                page_data: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfacedOutcome {
    pub is_404: bool,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_string: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_optional_bytes"
    )]
    pub page_data: Option<Vec<u8>>,
}

fn serialize_optional_bytes<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match bytes {
        Some(bytes) => crate::serde_base64::serialize(bytes, serializer),
        None => serializer.serialize_none(),
    }
}
