//! Directory-backed object store.
//!
//! Keys map onto relative paths below the root. Writes land in a `.partial-`
//! temp file beside the target and are renamed into place, so a concurrent
//! reader sees either the previous object or the complete new one.

use std::{
    cmp::Ordering,
    io::{self, Write},
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::{
    cache::{ListPage, ObjectStore, StoreError},
    domain::card::CachedArtifact,
};

const PARTIAL_PREFIX: &str = ".partial-";

pub struct FsObjectStore {
    root: PathBuf,
    page_size: usize,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            root: root.into(),
            page_size: page_size.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StoreError::invalid_key(key));
        }

        let mut path = self.root.clone();
        for segment in key.split('/') {
            let valid = !segment.is_empty()
                && !segment.starts_with(PARTIAL_PREFIX)
                && matches!(Path::new(segment).components().next(), Some(Component::Normal(_)))
                && Path::new(segment).components().count() == 1;
            if !valid {
                return Err(StoreError::invalid_key(key));
            }
            path.push(segment);
        }
        Ok(path)
    }

    /// Deepest directory that can hold keys starting with `prefix`.
    fn listing_base(&self, prefix: &str) -> PathBuf {
        match prefix.rfind('/') {
            Some(index) => match self.resolve(&prefix[..index]) {
                Ok(path) => path,
                Err(_) => self.root.clone(),
            },
            None => self.root.clone(),
        }
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => segments.push(part.to_str()?.to_string()),
            _ => return None,
        }
    }
    Some(segments.join("/"))
}

/// Sort key for siblings that makes a depth-first walk yield keys in byte
/// order: a directory sorts as its name followed by the separator.
fn walk_name(entry: &DirEntry) -> Vec<u8> {
    let mut name = entry.file_name().as_encoded_bytes().to_vec();
    if entry.file_type().is_dir() {
        name.push(b'/');
    }
    name
}

fn walk_order(a: &DirEntry, b: &DirEntry) -> Ordering {
    walk_name(a).cmp(&walk_name(b))
}

/// Collect up to `limit` keys under `base` that start with `prefix` and sort
/// after `after`, in key order.
fn collect_keys(
    root: &Path,
    base: &Path,
    prefix: &str,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<String>, StoreError> {
    if !base.exists() {
        return Ok(Vec::new());
    }

    // Directories whose whole subtree sorts before the token are not entered.
    let before_token = |entry: &DirEntry| {
        let Some(after) = after else {
            return false;
        };
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }
        match relative_key(root, entry.path()) {
            Some(dir) => {
                let dir = format!("{dir}/");
                dir.as_str() < after && !after.starts_with(&dir)
            }
            None => false,
        }
    };

    let walker = WalkDir::new(base)
        .follow_links(false)
        .sort_by(walk_order)
        .into_iter()
        .filter_entry(|entry| !before_token(entry));

    let mut keys = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|err| StoreError::backend(format!("walk failed: {err}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(PARTIAL_PREFIX))
        {
            continue;
        }
        let Some(key) = relative_key(root, entry.path()) else {
            continue;
        };
        if !key.starts_with(prefix) || after.is_some_and(|after| key.as_str() <= after) {
            continue;
        }
        keys.push(key);
        if keys.len() >= limit {
            break;
        }
    }
    Ok(keys)
}

fn write_atomically(path: &Path, body: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "object path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .tempfile_in(parent)?;
    temp.write_all(body)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

async fn blocking<T, F>(work: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StoreError::backend(format!("blocking task failed: {err}")))?
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedArtifact>, StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => {
                let content_type = mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .to_string();
                Ok(Some(CachedArtifact::new(Bytes::from(body), content_type)))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, artifact: &CachedArtifact) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        let body = artifact.body.clone();
        blocking(move || write_atomically(&path, &body).map_err(StoreError::from)).await?;
        debug!(
            target = "infra::storage::fs",
            op = "put",
            key,
            bytes = artifact.len(),
            "Object written"
        );
        Ok(())
    }

    async fn list(&self, prefix: &str, token: Option<&str>) -> Result<ListPage, StoreError> {
        let root = self.root.clone();
        let base = self.listing_base(prefix);
        let owned_prefix = prefix.to_string();
        let after = token.map(str::to_string);
        let limit = self.page_size + 1;
        let mut keys = blocking(move || {
            collect_keys(&root, &base, &owned_prefix, after.as_deref(), limit)
        })
        .await?;

        let next = if keys.len() > self.page_size {
            keys.truncate(self.page_size);
            keys.last().cloned()
        } else {
            None
        };

        Ok(ListPage { keys, next })
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in keys {
            let path = self.resolve(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => removed += 1,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn artifact(body: &'static [u8]) -> CachedArtifact {
        CachedArtifact::png(Bytes::from_static(body))
    }

    #[tokio::test]
    async fn put_then_get_round_trips_with_png_type() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsObjectStore::new(dir.path(), 10);

        store
            .put("card/Hello%20world.png", &artifact(b"png-bytes"))
            .await
            .expect("put");

        let fetched = store
            .get("card/Hello%20world.png")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.body.as_ref(), b"png-bytes");
        assert_eq!(fetched.content_type, "image/png");
        assert!(store.get("card/missing.png").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsObjectStore::new(dir.path(), 10);

        for key in ["../escape.png", "/abs.png", "card//x.png", "card/./x.png", ""] {
            assert!(
                matches!(store.get(key).await, Err(StoreError::InvalidKey { .. })),
                "{key} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn listing_pages_and_hides_partial_files() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsObjectStore::new(dir.path(), 2);
        for key in ["card/a.png", "card/b.png", "card/c.png", "other/d.png"] {
            store.put(key, &artifact(b"x")).await.expect("put");
        }
        std::fs::write(dir.path().join("card").join(".partial-abc"), b"half").expect("partial");

        let first = store.list("card/", None).await.expect("list");
        assert_eq!(first.keys, vec!["card/a.png", "card/b.png"]);
        let token = first.next.expect("more pages");

        let second = store.list("card/", Some(&token)).await.expect("list");
        assert_eq!(second.keys, vec!["card/c.png"]);
        assert!(second.next.is_none());

        let everything = store.list("", None).await.expect("list");
        assert_eq!(everything.keys.len(), 2);
        assert!(store.list("missing/", None).await.expect("list").keys.is_empty());
    }

    #[tokio::test]
    async fn delete_counts_missing_keys() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsObjectStore::new(dir.path(), 10);
        store.put("card/a.png", &artifact(b"x")).await.expect("put");

        let removed = store
            .delete(&["card/a.png".to_string(), "card/gone.png".to_string()])
            .await
            .expect("delete");

        assert_eq!(removed, 2);
        assert!(store.get("card/a.png").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn overwrite_replaces_whole_object() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsObjectStore::new(dir.path(), 10);
        store.put("card/a.png", &artifact(b"first")).await.expect("put");
        store.put("card/a.png", &artifact(b"second")).await.expect("put");

        let fetched = store.get("card/a.png").await.expect("get").expect("present");
        assert_eq!(fetched.body.as_ref(), b"second");
        let entries = std::fs::read_dir(dir.path().join("card"))
            .expect("read_dir")
            .count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn listing_follows_key_order_across_directories() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsObjectStore::new(dir.path(), 2);
        // `-` sorts before `/`, so `card-x.png` precedes every `card/...` key.
        let keys = ["card/a/z.png", "card/b.png", "card-x.png", "card0.png", "a.png"];
        for key in keys {
            store.put(key, &artifact(b"x")).await.expect("put");
        }

        let mut listed = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = store.list("", token.as_deref()).await.expect("list");
            listed.extend(page.keys);
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let mut expected: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
        expected.sort();
        assert_eq!(listed, expected);
    }
}
