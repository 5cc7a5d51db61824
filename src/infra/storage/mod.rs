//! Object store backends selected by `store.backend`.

mod fs;
#[cfg(feature = "s3")]
mod s3;

use std::sync::Arc;

use tracing::info;

use crate::{
    cache::{MemoryObjectStore, ObjectStore},
    config::{StoreBackend, StoreSettings},
};

use super::error::InfraError;

pub use fs::FsObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

/// Build the configured backend.
pub async fn build(settings: &StoreSettings) -> Result<Arc<dyn ObjectStore>, InfraError> {
    let store: Arc<dyn ObjectStore> = match settings.backend {
        StoreBackend::Fs => {
            tokio::fs::create_dir_all(&settings.directory).await?;
            Arc::new(FsObjectStore::new(
                settings.directory.clone(),
                settings.page_size.get(),
            ))
        }
        StoreBackend::Memory => Arc::new(MemoryObjectStore::with_page_size(
            settings.page_size.get(),
        )),
        #[cfg(feature = "s3")]
        StoreBackend::S3 => Arc::new(
            S3ObjectStore::connect(settings)
                .await
                .map_err(|err| InfraError::storage(err.to_string()))?,
        ),
        #[cfg(not(feature = "s3"))]
        StoreBackend::S3 => {
            return Err(InfraError::configuration(
                "store.backend = \"s3\" requires the `s3` feature",
            ));
        }
    };

    info!(
        target = "infra::storage",
        op = "build",
        result = "ready",
        backend = store.name(),
        "Object store initialised"
    );
    Ok(store)
}
