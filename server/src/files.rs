//! Per-subdomain HTTP response file tree.
//!
//! The tree maps a path ("" is the root entry, otherwise
//! `folder/sub/name.ext`) to a response: base64 body, status code, and an
//! ordered header list. Stored whole as `files:<subdomain>`; the HTTP
//! resolver reads it on every capture.

use std::collections::BTreeMap;

use hyper::header::HeaderName;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::storage::SharedStore;
use trapline_shared::interaction::decode_body;
use trapline_shared::{Error, Result};

const MAX_PATH_LEN: usize = 255;
const MAX_ENTRIES: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Response body, base64.
    pub raw: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<HeaderSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderSpec {
    pub header: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileTree {
    pub files: BTreeMap<String, FileEntry>,
}

impl FileEntry {
    /// Default root entry seeded on session creation.
    pub fn default_root() -> Self {
        Self {
            raw: trapline_shared::interaction::encode_body(b"trapline is ready\n"),
            status_code: 200,
            headers: vec![HeaderSpec {
                header: "Content-Type".to_string(),
                value: "text/plain".to_string(),
            }],
        }
    }
}

#[derive(Clone)]
pub struct FileStore {
    store: SharedStore,
    retention: std::time::Duration,
    body_cap: usize,
}

fn files_key(sub: &str) -> String {
    format!("files:{sub}")
}

impl FileStore {
    pub fn new(store: SharedStore, cfg: &Config) -> Self {
        Self {
            store,
            retention: cfg.retention(),
            body_cap: cfg.body_cap_bytes,
        }
    }

    pub async fn get(&self, sub: &str) -> Result<FileTree> {
        match self.store.kv_get(&files_key(sub)).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw).unwrap_or_default()),
            None => Ok(FileTree::default()),
        }
    }

    /// Replace the whole tree. Every entry is validated first; a single
    /// bad entry rejects the write.
    pub async fn put(&self, sub: &str, tree: &FileTree) -> Result<()> {
        if tree.files.len() > MAX_ENTRIES {
            return Err(Error::validation("files", "too many entries"));
        }
        for (path, entry) in &tree.files {
            validate_path(path)?;
            validate_entry(entry, self.body_cap)?;
        }
        self.store
            .kv_set(&files_key(sub), &serde_json::to_vec(tree)?, self.retention)
            .await
    }

    pub async fn delete_path(&self, sub: &str, path: &str) -> Result<()> {
        let mut tree = self.get(sub).await?;
        if tree.files.remove(path).is_none() {
            return Err(Error::NotFound);
        }
        self.store
            .kv_set(&files_key(sub), &serde_json::to_vec(&tree)?, self.retention)
            .await
    }

    /// Seed the default root entry for a fresh session.
    pub async fn seed_default(&self, sub: &str) -> Result<()> {
        let mut tree = FileTree::default();
        tree.files.insert(String::new(), FileEntry::default_root());
        self.put(sub, &tree).await
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.len() > MAX_PATH_LEN {
        return Err(Error::validation("path", "longer than 255 bytes"));
    }
    if path.starts_with('/') {
        return Err(Error::validation("path", "leading slash"));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(Error::validation("path", "parent traversal"));
    }
    Ok(())
}

fn validate_entry(entry: &FileEntry, body_cap: usize) -> Result<()> {
    if !(100..=599).contains(&entry.status_code) {
        return Err(Error::validation("status_code", "outside 100..=599"));
    }
    match decode_body(&entry.raw) {
        Some(body) if body.len() <= body_cap => {}
        Some(_) => return Err(Error::validation("raw", "body exceeds the storage cap")),
        None => return Err(Error::validation("raw", "not valid base64")),
    }
    for h in &entry.headers {
        validate_header(&h.header, &h.value)?;
    }
    Ok(())
}

/// Header names must be token characters; values are 8-bit clean except
/// CR and LF.
pub fn validate_header(name: &str, value: &str) -> Result<()> {
    if name.is_empty() || HeaderName::from_bytes(name.as_bytes()).is_err() {
        return Err(Error::validation("header", format!("bad name '{name}'")));
    }
    if value.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(Error::validation("header", "value contains CR or LF"));
    }
    Ok(())
}

/// Normalise a request path for tree lookup: drop the query string and
/// the leading slash. Paths with `..` segments never match.
pub fn normalise_request_path(raw_path: &str) -> Option<String> {
    let path = raw_path.split(['?', '#']).next().unwrap_or("");
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.split('/').any(|seg| seg == "..") {
        return None;
    }
    Some(path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Arc;
    use trapline_shared::interaction::encode_body;

    fn store() -> FileStore {
        FileStore::new(Arc::new(MemoryStore::new(16)), &Config::default())
    }

    fn entry(body: &[u8]) -> FileEntry {
        FileEntry {
            raw: encode_body(body),
            status_code: 200,
            headers: vec![HeaderSpec {
                header: "Content-Type".into(),
                value: "text/plain".into(),
            }],
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let fs = store();
        let mut tree = FileTree::default();
        tree.files.insert(String::new(), entry(b"root"));
        tree.files.insert("api/data.json".into(), entry(b"{}"));
        fs.put("abc123", &tree).await.unwrap();
        assert_eq!(fs.get("abc123").await.unwrap(), tree);
    }

    #[tokio::test]
    async fn test_delete_path() {
        let fs = store();
        let mut tree = FileTree::default();
        tree.files.insert("a.txt".into(), entry(b"a"));
        fs.put("abc123", &tree).await.unwrap();

        fs.delete_path("abc123", "a.txt").await.unwrap();
        assert!(fs.get("abc123").await.unwrap().files.is_empty());
        assert!(matches!(
            fs.delete_path("abc123", "a.txt").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_entries() {
        let fs = store();

        let mut tree = FileTree::default();
        tree.files.insert("/abs".into(), entry(b""));
        assert!(fs.put("s", &tree).await.is_err());

        let mut tree = FileTree::default();
        tree.files.insert("a/../b".into(), entry(b""));
        assert!(fs.put("s", &tree).await.is_err());

        let mut tree = FileTree::default();
        let mut e = entry(b"");
        e.status_code = 99;
        tree.files.insert("x".into(), e);
        assert!(fs.put("s", &tree).await.is_err());

        let mut tree = FileTree::default();
        let mut e = entry(b"");
        e.raw = "!!not base64!!".into();
        tree.files.insert("x".into(), e);
        assert!(fs.put("s", &tree).await.is_err());

        let mut tree = FileTree::default();
        let mut e = entry(b"");
        e.headers[0].value = "evil\r\nSet-Cookie: x".into();
        tree.files.insert("x".into(), e);
        assert!(fs.put("s", &tree).await.is_err());

        let mut tree = FileTree::default();
        let mut e = entry(b"");
        e.headers[0].header = "Bad Name".into();
        tree.files.insert("x".into(), e);
        assert!(fs.put("s", &tree).await.is_err());
    }

    #[tokio::test]
    async fn test_body_cap_enforced() {
        let mut cfg = Config::default();
        cfg.body_cap_bytes = 4;
        let fs = FileStore::new(Arc::new(MemoryStore::new(16)), &cfg);
        let mut tree = FileTree::default();
        tree.files.insert("x".into(), entry(b"12345"));
        assert!(fs.put("s", &tree).await.is_err());
    }

    #[test]
    fn test_normalise_request_path() {
        assert_eq!(normalise_request_path("/a/b?x=1").as_deref(), Some("a/b"));
        assert_eq!(normalise_request_path("/").as_deref(), Some(""));
        assert_eq!(normalise_request_path("/x#frag").as_deref(), Some("x"));
        assert_eq!(normalise_request_path("/a/../b"), None);
    }

    #[tokio::test]
    async fn test_seed_default() {
        let fs = store();
        fs.seed_default("abc123").await.unwrap();
        let tree = fs.get("abc123").await.unwrap();
        assert!(tree.files.contains_key(""));
        assert_eq!(tree.files[""].status_code, 200);
    }
}
