//! S3-compatible object store.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, meta::region::RegionProviderChain};
use aws_sdk_s3::{
    Client,
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier},
};
use tracing::{debug, warn};

use crate::{
    cache::{DEFAULT_DELETE_BATCH, ListPage, ObjectStore, StoreError},
    config::StoreSettings,
    domain::card::{CachedArtifact, PNG_CONTENT_TYPE},
};

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    key_prefix: Option<String>,
    page_size: usize,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>, key_prefix: &str, page_size: usize) -> Self {
        let normalized = key_prefix.trim_matches('/');
        Self {
            client,
            bucket: bucket.into(),
            key_prefix: (!normalized.is_empty()).then(|| normalized.to_string()),
            page_size: page_size.clamp(1, DEFAULT_DELETE_BATCH),
        }
    }

    /// Build a client from the ambient AWS environment plus store overrides.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        let bucket = settings
            .bucket
            .clone()
            .ok_or_else(|| StoreError::backend("store.bucket is required for the s3 backend"))?;

        let region = RegionProviderChain::first_try(settings.region.clone().map(Region::new))
            .or_default_provider()
            .or_else("us-east-1");
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(region)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        Ok(Self::new(
            client,
            bucket,
            &settings.key_prefix,
            settings.page_size.get(),
        ))
    }

    fn full_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> Option<&'a str> {
        match &self.key_prefix {
            Some(prefix) => key.strip_prefix(prefix.as_str())?.strip_prefix('/'),
            None => Some(key),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedArtifact>, StoreError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Ok(None);
            }
            Err(err) => {
                return Err(StoreError::backend(format!("get_object failed: {err}")));
            }
        };

        let content_type = response
            .content_type()
            .unwrap_or(PNG_CONTENT_TYPE)
            .to_string();
        let body = response
            .body
            .collect()
            .await
            .map_err(|err| StoreError::backend(format!("read body failed: {err}")))?
            .into_bytes();

        Ok(Some(CachedArtifact::new(body, content_type)))
    }

    async fn put(&self, key: &str, artifact: &CachedArtifact) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::invalid_key(key));
        }
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .content_type(&artifact.content_type)
            .body(ByteStream::from(artifact.body.clone()))
            .send()
            .await
            .map_err(|err| StoreError::backend(format!("put_object failed: {err}")))?;
        debug!(
            target = "infra::storage::s3",
            op = "put",
            key,
            bytes = artifact.len(),
            "Object written"
        );
        Ok(())
    }

    async fn list(&self, prefix: &str, token: Option<&str>) -> Result<ListPage, StoreError> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.full_key(prefix))
            .set_continuation_token(token.map(str::to_string))
            .max_keys(i32::try_from(self.page_size).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(|err| StoreError::backend(format!("list_objects_v2 failed: {err}")))?;

        let keys = response
            .contents()
            .iter()
            .filter_map(|object| object.key())
            .filter_map(|key| self.strip_prefix(key))
            .map(str::to_string)
            .collect();

        let next = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage { keys, next })
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(self.full_key(key)).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::backend(format!("invalid delete identifier: {err}")))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|err| StoreError::backend(format!("invalid delete request: {err}")))?;

        let response = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|err| StoreError::backend(format!("delete_objects failed: {err}")))?;

        let failures = response.errors();
        if !failures.is_empty() {
            warn!(
                target = "infra::storage::s3",
                op = "delete",
                result = "partial",
                requested = keys.len(),
                failed = failures.len(),
                first_error = failures.first().and_then(|e| e.message()).unwrap_or_default(),
                "Some objects could not be deleted"
            );
        }
        Ok(keys.len().saturating_sub(failures.len()))
    }

    fn delete_batch_limit(&self) -> usize {
        DEFAULT_DELETE_BATCH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(prefix: &str) -> S3ObjectStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        S3ObjectStore::new(Client::from_conf(config), "cards", prefix, 5000)
    }

    #[test]
    fn prefix_is_normalized_and_reversible() {
        let store = store("/tenant/cards/");
        assert_eq!(store.full_key("card/a.png"), "tenant/cards/card/a.png");
        assert_eq!(store.strip_prefix("tenant/cards/card/a.png"), Some("card/a.png"));
        assert_eq!(store.strip_prefix("elsewhere/card/a.png"), None);
        assert_eq!(store.page_size, DEFAULT_DELETE_BATCH);
    }

    #[test]
    fn empty_prefix_leaves_keys_untouched() {
        let store = store("");
        assert_eq!(store.full_key("card/a.png"), "card/a.png");
        assert_eq!(store.strip_prefix("card/a.png"), Some("card/a.png"));
    }
}
