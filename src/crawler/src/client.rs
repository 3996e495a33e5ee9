//! The object store boundary: listing and the mutations effects perform.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use common::config::{RunConfig, StorageClass};
use common::storage::create_object_store_from_dsn;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, GetOptions, ObjectMeta, ObjectStore, PutOptions, PutPayload,
};

use crate::units::ObjectAttributes;

/// Metadata key carrying the storage class on stores without native support
pub const STORAGE_CLASS_ATTRIBUTE: &str = "storage-class";

/// Class reported for objects that never had one set
const DEFAULT_STORAGE_CLASS: StorageClass = StorageClass::Standard;

/// Concurrent attribute lookups per listing
const STORAGE_CLASS_LOOKUPS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No store registered for bucket {0}")]
    UnknownBucket(String),

    #[error("Failed to open store for bucket {bucket}: {message}")]
    Open { bucket: String, message: String },

    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
}

/// One level of a listing: child prefixes and the objects directly under it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    pub prefixes: Vec<String>,
    pub objects: Vec<ObjectAttributes>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BucketClient: Send + Sync {
    /// List one level below `prefix`, `/` delimited.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Listing, StoreError>;

    /// Server-side copy where possible, download and upload otherwise.
    async fn copy(
        &self,
        source: &ObjectAttributes,
        destination_bucket: &str,
        destination_name: &str,
    ) -> Result<(), StoreError>;

    async fn delete(&self, source: &ObjectAttributes) -> Result<(), StoreError>;

    /// Rewrite the object in place with a new storage class.
    async fn change_storage_class(
        &self,
        source: &ObjectAttributes,
        storage_class: StorageClass,
    ) -> Result<(), StoreError>;
}

/// Bucket name to object store.
#[derive(Debug, Clone, Default)]
pub struct BucketRegistry {
    stores: HashMap<String, Arc<dyn ObjectStore>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store for every bucket in `buckets` using the configured DSNs.
    pub fn from_config<'a>(
        config: &RunConfig,
        buckets: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, StoreError> {
        let mut registry = Self::new();
        for bucket in buckets {
            if registry.stores.contains_key(bucket) {
                continue;
            }
            let store = create_object_store_from_dsn(&config.store_dsn(bucket)).map_err(|e| {
                StoreError::Open {
                    bucket: bucket.to_string(),
                    message: e.to_string(),
                }
            })?;
            registry.register(bucket, store);
        }
        Ok(registry)
    }

    pub fn register(&mut self, bucket: &str, store: Arc<dyn ObjectStore>) {
        self.stores.insert(bucket.to_string(), store);
    }

    pub fn store(&self, bucket: &str) -> Result<&Arc<dyn ObjectStore>, StoreError> {
        self.stores
            .get(bucket)
            .ok_or_else(|| StoreError::UnknownBucket(bucket.to_string()))
    }
}

/// Object names keep the store's encoded form; parse them back verbatim
/// instead of encoding a second time.
fn object_path(name: &str) -> Result<ObjectPath, StoreError> {
    Ok(ObjectPath::parse(name).map_err(object_store::Error::from)?)
}

/// Storage class recorded on the object, read with a metadata-only request.
async fn storage_class_of(store: &dyn ObjectStore, path: &ObjectPath) -> Result<String, StoreError> {
    let options = GetOptions {
        head: true,
        ..Default::default()
    };
    let result = store.get_opts(path, options).await?;
    let class = result
        .attributes
        .get(&Attribute::Metadata(Cow::Borrowed(STORAGE_CLASS_ATTRIBUTE)))
        .map(|value| -> &str { value.as_ref() })
        .unwrap_or(DEFAULT_STORAGE_CLASS.as_str());
    Ok(class.to_string())
}

/// [`BucketClient`] backed by `object_store`.
#[derive(Debug, Clone)]
pub struct ObjectStoreClient {
    registry: BucketRegistry,
    storage_class_lookup: bool,
}

impl ObjectStoreClient {
    pub fn new(registry: BucketRegistry) -> Self {
        Self {
            registry,
            storage_class_lookup: false,
        }
    }

    /// Fill `storage_class` of listed objects, at one extra request per object.
    ///
    /// Listings carry no attributes, so without this every object reports
    /// no storage class.
    pub fn with_storage_class_lookup(mut self, enabled: bool) -> Self {
        self.storage_class_lookup = enabled;
        self
    }

    fn to_attributes(bucket: &str, meta: ObjectMeta) -> ObjectAttributes {
        ObjectAttributes {
            bucket: bucket.to_string(),
            name: meta.location.to_string(),
            size: meta.size,
            created: meta.last_modified,
            storage_class: None,
            e_tag: meta.e_tag,
            version: meta.version,
        }
    }
}

#[async_trait]
impl BucketClient for ObjectStoreClient {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Listing, StoreError> {
        let store = self.registry.store(bucket)?;
        let prefix = object_path(prefix)?;
        let prefix = (!prefix.as_ref().is_empty()).then_some(prefix);

        let result = store.list_with_delimiter(prefix.as_ref()).await?;

        let mut objects: Vec<ObjectAttributes> = result
            .objects
            .into_iter()
            .map(|meta| Self::to_attributes(bucket, meta))
            .collect();
        if self.storage_class_lookup {
            objects = futures::stream::iter(objects)
                .map(|object| async move {
                    let path = object_path(&object.name)?;
                    let class = storage_class_of(store.as_ref(), &path).await?;
                    Ok::<_, StoreError>(ObjectAttributes {
                        storage_class: Some(class),
                        ..object
                    })
                })
                .buffered(STORAGE_CLASS_LOOKUPS)
                .try_collect()
                .await?;
        }

        Ok(Listing {
            prefixes: result
                .common_prefixes
                .iter()
                .map(|p| p.to_string())
                .collect(),
            objects,
        })
    }

    async fn copy(
        &self,
        source: &ObjectAttributes,
        destination_bucket: &str,
        destination_name: &str,
    ) -> Result<(), StoreError> {
        let from = object_path(&source.name)?;
        let to = object_path(destination_name)?;
        let source_store = self.registry.store(&source.bucket)?;
        let destination_store = self.registry.store(destination_bucket)?;

        if source.bucket == destination_bucket {
            source_store.copy(&from, &to).await?;
            return Ok(());
        }

        let result = source_store.get(&from).await?;
        let attributes = result.attributes.clone();
        let payload = result.bytes().await?;
        let options = PutOptions {
            attributes,
            ..Default::default()
        };
        destination_store
            .put_opts(&to, PutPayload::from(payload), options)
            .await?;
        Ok(())
    }

    async fn delete(&self, source: &ObjectAttributes) -> Result<(), StoreError> {
        let store = self.registry.store(&source.bucket)?;
        store.delete(&object_path(&source.name)?).await?;
        Ok(())
    }

    async fn change_storage_class(
        &self,
        source: &ObjectAttributes,
        storage_class: StorageClass,
    ) -> Result<(), StoreError> {
        let store = self.registry.store(&source.bucket)?;
        let path = object_path(&source.name)?;

        let result = store.get(&path).await?;
        let mut attributes = result.attributes.clone();
        let payload = result.bytes().await?;
        attributes.insert(
            Attribute::Metadata(Cow::Borrowed(STORAGE_CLASS_ATTRIBUTE)),
            AttributeValue::from(storage_class.as_str()),
        );

        let options = PutOptions {
            attributes,
            ..Default::default()
        };
        store
            .put_opts(&path, PutPayload::from(payload), options)
            .await?;
        Ok(())
    }
}
