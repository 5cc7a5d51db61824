//! In-process object store.
//!
//! Used by tests and by `store.backend = "memory"` for local runs. Listing pages
//! are keyed by the last key returned, so deletes between pages never shift the
//! cursor.

use std::{collections::BTreeMap, ops::Bound, sync::RwLock};

use async_trait::async_trait;

use crate::{
    domain::card::CachedArtifact,
    util::lock::{rw_read, rw_write},
};

use super::store::{DEFAULT_DELETE_BATCH, ListPage, ObjectStore, StoreError};

pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, CachedArtifact>>,
    page_size: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::with_page_size(DEFAULT_DELETE_BATCH)
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.objects, "cache::memory", "objects").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        rw_read(&self.objects, "cache::memory", "objects").contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedArtifact>, StoreError> {
        Ok(rw_read(&self.objects, "cache::memory", "objects")
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, artifact: &CachedArtifact) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::invalid_key(key));
        }
        rw_write(&self.objects, "cache::memory", "objects")
            .insert(key.to_string(), artifact.clone());
        Ok(())
    }

    async fn list(&self, prefix: &str, token: Option<&str>) -> Result<ListPage, StoreError> {
        let objects = rw_read(&self.objects, "cache::memory", "objects");
        let lower = match token {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut keys: Vec<String> = objects
            .range((lower, Bound::Unbounded))
            .map(|(key, _)| key)
            .skip_while(|key| key.as_str() < prefix)
            .take_while(|key| key.starts_with(prefix))
            .take(self.page_size + 1)
            .cloned()
            .collect();

        let next = if keys.len() > self.page_size {
            keys.truncate(self.page_size);
            keys.last().cloned()
        } else {
            None
        };

        Ok(ListPage { keys, next })
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut objects = rw_write(&self.objects, "cache::memory", "objects");
        for key in keys {
            objects.remove(key);
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn artifact(body: &'static [u8]) -> CachedArtifact {
        CachedArtifact::png(Bytes::from_static(body))
    }

    #[tokio::test]
    async fn list_respects_prefix_boundaries() {
        let store = MemoryObjectStore::new();
        for key in ["blog/a.png", "card/a.png", "card/b.png", "cards/a.png"] {
            store.put(key, &artifact(b"x")).await.expect("put");
        }

        let page = store.list("card/", None).await.expect("list");
        assert_eq!(page.keys, vec!["card/a.png", "card/b.png"]);
        assert_eq!(page.next, None);
    }

    #[tokio::test]
    async fn list_pages_with_start_after_token() {
        let store = MemoryObjectStore::with_page_size(2);
        for key in ["card/1.png", "card/2.png", "card/3.png"] {
            store.put(key, &artifact(b"x")).await.expect("put");
        }

        let first = store.list("card/", None).await.expect("first page");
        assert_eq!(first.keys, vec!["card/1.png", "card/2.png"]);
        let token = first.next.expect("more pages");

        let second = store.list("card/", Some(&token)).await.expect("second page");
        assert_eq!(second.keys, vec!["card/3.png"]);
        assert_eq!(second.next, None);
    }

    #[tokio::test]
    async fn exact_page_boundary_reports_no_next_page() {
        let store = MemoryObjectStore::with_page_size(2);
        for key in ["card/1.png", "card/2.png"] {
            store.put(key, &artifact(b"x")).await.expect("put");
        }
        let page = store.list("card/", None).await.expect("list");
        assert_eq!(page.keys.len(), 2);
        assert_eq!(page.next, None);
    }

    #[tokio::test]
    async fn overwrite_replaces_bytes() {
        let store = MemoryObjectStore::new();
        store.put("card/a.png", &artifact(b"old")).await.expect("put");
        store.put("card/a.png", &artifact(b"new")).await.expect("put");
        let stored = store.get("card/a.png").await.expect("get").expect("present");
        assert_eq!(stored.body, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn deleting_missing_keys_is_not_an_error() {
        let store = MemoryObjectStore::new();
        let removed = store
            .delete(&["card/ghost.png".to_string()])
            .await
            .expect("delete");
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }
}
