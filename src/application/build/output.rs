//! Writes rendered pages into the output directory.

use std::{
    fmt::Write as _,
    fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use frostline_protocol::{
    ApiResponseKind, HtmlPage, RegionMap, RenderOutcome,
    frame::{self, FrameError},
};
use serde::Serialize;
use thiserror::Error;

use crate::application::frozen::{self, ExtractError};

pub const CONTENT_FILE: &str = "content.dat";
pub const INDEX_FILE: &str = "index.html";

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to write `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("static file body is not valid base64: {0}")]
    Body(#[from] base64::DecodeError),
    #[error("route `{0}` escapes the output directory")]
    UnsafePath(String),
    #[error("server responses cannot be prerendered (status {status})")]
    ServerResponse { status: u16 },
}

/// Files produced for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageArtifacts {
    pub files: Vec<PathBuf>,
    pub regions: usize,
}

#[derive(Debug, Clone)]
pub struct OutputStage {
    root: PathBuf,
}

impl OutputStage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write(&self, pathname: &str, outcome: &RenderOutcome) -> Result<PageArtifacts, OutputError> {
        match outcome {
            RenderOutcome::Html(page) => {
                let extraction = frozen::extract(&page.body_html)?;
                let dir = self.route_path(pathname)?;
                let index = dir.join(INDEX_FILE);
                write_atomic(&index, assemble_document(page, &extraction.html).as_bytes())?;

                let regions = extraction.region_map();
                let content = dir.join(CONTENT_FILE);
                write_atomic(&content, &frame::encode(&regions, &page.page_data)?)?;
                Ok(PageArtifacts {
                    files: vec![index, content],
                    regions: regions.len(),
                })
            }
            RenderOutcome::Bytes(page) => {
                let content = self.route_path(pathname)?.join(CONTENT_FILE);
                write_atomic(&content, &frame::encode(&RegionMap::new(), &page.page_data)?)?;
                Ok(PageArtifacts {
                    files: vec![content],
                    regions: 0,
                })
            }
            RenderOutcome::ApiResponse(response) => match response.subkind {
                ApiResponseKind::StaticFile => {
                    let body = if response.is_base64 {
                        BASE64.decode(&response.body)?
                    } else {
                        response.body.clone().into_bytes()
                    };
                    let file = self.route_path(pathname)?;
                    write_atomic(&file, &body)?;
                    Ok(PageArtifacts {
                        files: vec![file],
                        regions: 0,
                    })
                }
                ApiResponseKind::ServerResponse => Err(OutputError::ServerResponse {
                    status: response.status_code,
                }),
            },
        }
    }

    /// Serialize `value` as pretty JSON to `name` under the output root.
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf, OutputError> {
        let encoded = serde_json::to_vec_pretty(value)
            .map_err(|err| OutputError::Io {
                path: self.root.join(name),
                source: io::Error::other(err),
            })?;
        let path = self.root.join(name);
        write_atomic(&path, &encoded)?;
        Ok(path)
    }

    /// Join a canonical pathname under the output root, rejecting `..`.
    fn route_path(&self, pathname: &str) -> Result<PathBuf, OutputError> {
        let relative = Path::new(pathname.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(OutputError::UnsafePath(pathname.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), OutputError> {
    let io_error = |source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(io_error)?;

    let mut file = tempfile::Builder::new()
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(io_error)?;
    file.write_all(contents).map_err(io_error)?;
    file.flush().map_err(io_error)?;
    file.persist(path).map_err(|err| io_error(err.error))?;
    Ok(())
}

/// Full HTML document around the extracted body markup.
pub fn assemble_document(page: &HtmlPage, body: &str) -> String {
    let mut attrs = String::new();
    for (name, value) in &page.root_attrs {
        let _ = write!(attrs, " {name}=\"{}\"", escape_attr(value));
    }
    format!(
        "<!DOCTYPE html>\n<html{attrs}>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n{head}\n</head>\n<body>{body}</body>\n</html>\n",
        title = escape_text(&page.title),
        head = page.head_tags,
    )
}

fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}
