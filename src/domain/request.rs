//! Request normalization shared by the build orchestrator and the dev server.

use percent_encoding::percent_decode_str;
use url::Url;

use super::error::DomainError;

pub use frostline_protocol::{RequestBody, RequestPayload as RenderRequest};

/// Pseudo-route resolved first in a build to learn the complete page list.
pub const ALL_PATHS_ROUTE: &str = "/all-paths.json";

/// Trailing file names that address the same page as their directory.
const PAGE_SUFFIXES: [&str; 2] = ["index.html", "content.dat"];

/// Derive the one canonical pathname for a request URL.
///
/// Accepts absolute URLs or bare paths. The result is percent-decoded, has the
/// base path removed, never carries `index.html` / `content.dat`, collapses
/// duplicate slashes, always starts with `/`, and ends with `/` only for root.
pub fn canonical_pathname(raw_url: &str, base_path: &str) -> Result<String, DomainError> {
    let path = if raw_url.starts_with('/') {
        let parsed = Url::parse("http://localhost")
            .and_then(|base| base.join(raw_url))
            .map_err(|err| DomainError::validation(format!("invalid request path `{raw_url}`: {err}")))?;
        parsed.path().to_string()
    } else {
        Url::parse(raw_url)
            .map_err(|err| DomainError::validation(format!("invalid request url `{raw_url}`: {err}")))?
            .path()
            .to_string()
    };

    let decoded = percent_decode(&path)?;
    let base = base_path.trim_matches('/');

    let mut segments: Vec<&str> = decoded.split('/').filter(|s| !s.is_empty()).collect();
    if !base.is_empty() {
        let base_segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
        if segments.starts_with(&base_segments) {
            segments.drain(..base_segments.len());
        }
    }
    if segments
        .last()
        .is_some_and(|last| PAGE_SUFFIXES.contains(last))
    {
        segments.pop();
    }

    Ok(format!("/{}", segments.join("/")))
}

/// Whether the query string carries `name`, returning its decoded value.
pub fn query_param(raw_url: &str, name: &str) -> Option<String> {
    let parsed = if raw_url.starts_with('/') {
        Url::parse("http://localhost").ok()?.join(raw_url).ok()?
    } else {
        Url::parse(raw_url).ok()?
    };
    parsed
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn percent_decode(path: &str) -> Result<String, DomainError> {
    percent_decode_str(path)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| DomainError::validation(format!("request path `{path}` is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_common_shapes() {
        assert_eq!(canonical_pathname("/", "/").expect("path"), "/");
        assert_eq!(canonical_pathname("/blog/", "/").expect("path"), "/blog");
        assert_eq!(
            canonical_pathname("/blog/hello/index.html", "/").expect("path"),
            "/blog/hello"
        );
        assert_eq!(
            canonical_pathname("/blog//hello/content.dat", "/").expect("path"),
            "/blog/hello"
        );
        assert_eq!(
            canonical_pathname("https://example.com/a/b?x=1#frag", "/").expect("path"),
            "/a/b"
        );
    }

    #[test]
    fn strips_base_path() {
        assert_eq!(
            canonical_pathname("/docs/v2/guide", "/docs/v2/").expect("path"),
            "/guide"
        );
        assert_eq!(canonical_pathname("/docs/v2", "/docs/v2/").expect("path"), "/");
        assert_eq!(
            canonical_pathname("/other/guide", "/docs/").expect("path"),
            "/other/guide"
        );
    }

    #[test]
    fn decodes_percent_escapes() {
        assert_eq!(
            canonical_pathname("/caf%C3%A9/a%20b", "/").expect("path"),
            "/café/a b"
        );
        assert_eq!(canonical_pathname("/a%41", "/").expect("path"), "/aA");
        assert!(canonical_pathname("/bad%FF", "/").is_err());
    }

    #[test]
    fn reads_query_params() {
        assert_eq!(
            query_param("/greet?first=Dillon", "first").as_deref(),
            Some("Dillon")
        );
        assert_eq!(query_param("/greet", "first"), None);
    }
}
