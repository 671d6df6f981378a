//! On-disk HTTP response cache shared by every build worker.
//!
//! Entries are keyed by request fingerprint and written through a temp file
//! that is persisted into place off the async threads. Concurrent writers of the same fingerprint
//! race benignly: responses are assumed deterministic, the last rename wins.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body_base64: String,
}

impl CachedResponse {
    pub fn new(
        status: u16,
        status_text: impl Into<String>,
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
        body: &[u8],
    ) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            url: url.into(),
            headers,
            body_base64: BASE64.encode(body),
        }
    }

    pub fn body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.body_base64)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponseCache {
    dir: PathBuf,
}

impl HttpResponseCache {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// Unreadable or corrupt entries count as misses.
    pub async fn get(&self, fingerprint: &str) -> Option<CachedResponse> {
        let path = self.entry_path(fingerprint);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(
                    target = "application::jobs::cache",
                    op = "http_cache::get",
                    result = "read_error",
                    cache_path = %path.display(),
                    error = %err,
                    "Failed to read cached HTTP response; refetching"
                );
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(
                    target = "application::jobs::cache",
                    op = "http_cache::get",
                    result = "corrupt",
                    cache_path = %path.display(),
                    error = %err,
                    "Ignoring corrupt cached HTTP response"
                );
                None
            }
        }
    }

    pub async fn put(&self, fingerprint: &str, entry: &CachedResponse) -> io::Result<()> {
        let encoded = serde_json::to_vec(entry).map_err(io::Error::other)?;
        let dir = self.dir.clone();
        let target = self.entry_path(fingerprint);
        task::spawn_blocking(move || persist(&dir, &target, &encoded))
            .await
            .map_err(io::Error::other)?
    }
}

fn persist(dir: &Path, target: &Path, encoded: &[u8]) -> io::Result<()> {
    let mut file = tempfile::Builder::new().suffix(".tmp").tempfile_in(dir)?;
    file.write_all(encoded)?;
    file.flush()?;

    match file.persist(target) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.error),
    }
}

/// Stable fingerprint over method, url, header set (order-insensitive) and body.
pub fn fingerprint(method: &str, url: &str, headers: &[(String, String)], body: &[u8]) -> String {
    let mut sorted: Vec<(String, &str)> = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
        .collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update([0]);
    hasher.update(url.as_bytes());
    hasher.update([0]);
    for (name, value) in sorted {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    hasher.update(body);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn fingerprint_ignores_header_order_and_case() {
        let a = fingerprint(
            "get",
            "https://example.com",
            &[
                ("Accept".into(), "application/json".into()),
                ("X-Token".into(), "1".into()),
            ],
            b"",
        );
        let b = fingerprint(
            "GET",
            "https://example.com",
            &[
                ("x-token".into(), "1".into()),
                ("accept".into(), "application/json".into()),
            ],
            b"",
        );
        assert_eq!(a, b);
        assert_ne!(a, fingerprint("POST", "https://example.com", &[], b""));
        assert_ne!(a, fingerprint("GET", "https://example.com", &[], b"body"));
    }

    #[tokio::test]
    async fn stores_and_reads_entries() {
        let dir = TempDir::new().expect("temp dir");
        let cache = HttpResponseCache::new(dir.path().join("http")).expect("cache");
        let entry = CachedResponse::new(200, "OK", "https://example.com", BTreeMap::new(), b"hi");

        assert!(cache.get("abc").await.is_none());
        cache.put("abc", &entry).await.expect("put");
        cache.put("abc", &entry).await.expect("overwrite");

        let loaded = cache.get("abc").await.expect("hit");
        assert_eq!(loaded, entry);
        assert_eq!(loaded.body().expect("decode"), b"hi");
    }

    #[tokio::test]
    async fn corrupt_entries_are_misses() {
        let dir = TempDir::new().expect("temp dir");
        let cache = HttpResponseCache::new(dir.path()).expect("cache");
        fs::write(dir.path().join("bad.json"), b"{not json").expect("write");
        assert!(cache.get("bad").await.is_none());
    }
}
