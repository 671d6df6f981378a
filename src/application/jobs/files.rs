use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use frostline_protocol::{JobError, JobErrorTag};
use globset::Glob;
use serde::Deserialize;
use serde_json::{Value, json};
use walkdir::WalkDir;

#[derive(Debug, Deserialize)]
pub struct ReadFile {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct GlobPattern {
    pub pattern: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteFile {
    pub path: String,
    pub body: String,
}

pub async fn read_file(root: &Path, job: &ReadFile) -> Result<Value, JobError> {
    let path = root.join(&job.path);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|err| io_error(&job.path, err))?;

    let (frontmatter, body) = split_frontmatter(&raw)?;
    Ok(json!({
        "raw": raw,
        "body": body,
        "frontmatter": frontmatter,
    }))
}

pub async fn write_file(root: &Path, job: &WriteFile) -> Result<Value, JobError> {
    let path = root.join(&job.path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| io_error(&job.path, err))?;
    }
    tokio::fs::write(&path, job.body.as_bytes())
        .await
        .map_err(|err| io_error(&job.path, err))?;
    Ok(Value::Null)
}

/// Files under `root` matching `pattern`, as sorted `/`-separated relative paths.
pub async fn glob(root: &Path, job: &GlobPattern) -> Result<Value, JobError> {
    let root = root.to_path_buf();
    let pattern = job.pattern.clone();
    tokio::task::spawn_blocking(move || glob_blocking(&root, &pattern))
        .await
        .map_err(|err| JobError::new(JobErrorTag::Io, format!("glob task failed: {err}")))?
}

fn glob_blocking(root: &Path, pattern: &str) -> Result<Value, JobError> {
    let normalized = pattern.trim_start_matches("./");
    let matcher = Glob::new(normalized)
        .map_err(|err| JobError::new(JobErrorTag::GlobError, err.to_string()))?
        .compile_matcher();

    let start = root.join(literal_prefix(normalized));
    if !start.exists() {
        return Ok(Value::Array(Vec::new()));
    }

    let mut matches = Vec::new();
    for entry in WalkDir::new(&start).follow_links(true) {
        let entry = entry.map_err(|err| JobError::new(JobErrorTag::GlobError, err.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if matcher.is_match(relative) {
            matches.push(to_slash(relative));
        }
    }
    matches.sort();

    Ok(Value::Array(matches.into_iter().map(Value::String).collect()))
}

/// Leading directories of a glob that contain no metacharacters.
fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    let segments: Vec<&str> = pattern.split('/').collect();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if segment.contains(['*', '?', '[', '{']) {
            break;
        }
        prefix.push(segment);
    }
    prefix
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Split `+++` (TOML) or `---` (YAML) fenced frontmatter from the body.
pub fn split_frontmatter(raw: &str) -> Result<(Value, String), JobError> {
    for (fence, parse) in [
        ("+++", parse_toml as fn(&str) -> Result<Value, String>),
        ("---", parse_yaml),
    ] {
        let Some(rest) = raw.strip_prefix(fence) else {
            continue;
        };
        let Some(rest) = rest
            .strip_prefix("\r\n")
            .or_else(|| rest.strip_prefix('\n'))
        else {
            continue;
        };

        let closing = format!("\n{fence}");
        let (block, after) = if let Some(after) = rest.strip_prefix(fence) {
            ("", after)
        } else if let Some(end) = rest.find(&closing) {
            (&rest[..end], &rest[end + closing.len()..])
        } else {
            return Err(JobError::new(
                JobErrorTag::FrontmatterError,
                format!("frontmatter opened with `{fence}` is never closed"),
            ));
        };
        let body = after
            .strip_prefix("\r\n")
            .or_else(|| after.strip_prefix('\n'))
            .unwrap_or(after);

        let frontmatter = parse(block)
            .map_err(|message| JobError::new(JobErrorTag::FrontmatterError, message))?;
        return Ok((frontmatter, body.to_string()));
    }

    Ok((Value::Null, raw.to_string()))
}

fn parse_toml(block: &str) -> Result<Value, String> {
    toml::from_str::<Value>(block).map_err(|err| err.to_string())
}

fn parse_yaml(block: &str) -> Result<Value, String> {
    if block.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_yaml::from_str::<Value>(block).map_err(|err| err.to_string())
}

fn io_error(path: &str, err: std::io::Error) -> JobError {
    let tag = if err.kind() == ErrorKind::NotFound {
        JobErrorTag::FileNotFound
    } else {
        JobErrorTag::Io
    };
    JobError::new(tag, format!("{path}: {err}")).with_detail(json!({ "path": path }))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn toml_and_yaml_frontmatter() {
        let (front, body) =
            split_frontmatter("+++\ntitle = \"Hi\"\n+++\nBody text\n").expect("toml");
        assert_eq!(front["title"], "Hi");
        assert_eq!(body, "Body text\n");

        let (front, body) = split_frontmatter("---\ntags:\n  - a\n---\n# Heading").expect("yaml");
        assert_eq!(front["tags"][0], "a");
        assert_eq!(body, "# Heading");
    }

    #[test]
    fn empty_frontmatter_block_is_an_empty_object() {
        let (front, body) = split_frontmatter("---\n---\nBody\n").expect("empty yaml");
        assert_eq!(front, json!({}));
        assert_eq!(body, "Body\n");

        let (front, body) = split_frontmatter("+++\r\n+++\r\nBody").expect("empty toml");
        assert_eq!(front, json!({}));
        assert_eq!(body, "Body");
    }

    #[test]
    fn missing_frontmatter_is_null() {
        let (front, body) = split_frontmatter("just text").expect("plain");
        assert!(front.is_null());
        assert_eq!(body, "just text");
    }

    #[test]
    fn broken_frontmatter_is_tagged() {
        let err = split_frontmatter("---\ntitle: [\n---\nbody").expect_err("invalid yaml");
        assert_eq!(err.tag, JobErrorTag::FrontmatterError);

        let err = split_frontmatter("+++\ntitle = 1\nno close").expect_err("unclosed");
        assert_eq!(err.tag, JobErrorTag::FrontmatterError);
    }

    #[tokio::test]
    async fn read_missing_file_is_file_not_found() {
        let dir = TempDir::new().expect("temp dir");
        let err = read_file(
            dir.path(),
            &ReadFile {
                path: "nope.md".into(),
            },
        )
        .await
        .expect_err("missing");
        assert_eq!(err.tag, JobErrorTag::FileNotFound);
    }

    #[tokio::test]
    async fn write_then_glob() {
        let dir = TempDir::new().expect("temp dir");
        for path in ["content/b.md", "content/nested/a.md", "content/c.txt"] {
            write_file(
                dir.path(),
                &WriteFile {
                    path: path.into(),
                    body: "x".into(),
                },
            )
            .await
            .expect("write");
        }
        assert!(dir.path().join("content/nested/a.md").exists());

        let found = glob(
            dir.path(),
            &GlobPattern {
                pattern: "content/**/*.md".into(),
            },
        )
        .await
        .expect("glob");
        assert_eq!(found, json!(["content/b.md", "content/nested/a.md"]));
    }

    #[tokio::test]
    async fn invalid_glob_is_tagged() {
        let dir = TempDir::new().expect("temp dir");
        fs::create_dir_all(dir.path().join("a")).expect("mkdir");
        let err = glob(
            dir.path(),
            &GlobPattern {
                pattern: "a/[".into(),
            },
        )
        .await
        .expect_err("bad glob");
        assert_eq!(err.tag, JobErrorTag::GlobError);
    }

    #[test]
    fn literal_prefix_stops_at_metacharacters() {
        assert_eq!(literal_prefix("content/**/*.md"), PathBuf::from("content"));
        assert_eq!(literal_prefix("*.md"), PathBuf::new());
        assert_eq!(literal_prefix("a/b/c.md"), PathBuf::from("a/b"));
    }
}
