use anyhow::Result;
use object_store::path::Path as ObjectPath;
use object_store::{
    ObjectStore, aws::AmazonS3Builder, gcp::GoogleCloudStorageBuilder, local::LocalFileSystem,
    memory::InMemory,
};
use std::sync::Arc;
use url::Url;

/// An object store together with the key prefix a DSN points at inside it
#[derive(Debug, Clone)]
pub struct StoreLocation {
    pub store: Arc<dyn ObjectStore>,
    pub prefix: ObjectPath,
}

/// Create an object store from a DSN string, ignoring any key prefix in it
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    Ok(resolve_location(dsn)?.store)
}

/// Resolve a DSN into a store and the prefix inside that store.
///
/// Supported forms:
/// - `memory://` (fresh in-memory store, empty prefix)
/// - `file:///path/to/dir` (directory is created if missing, empty prefix)
/// - `s3://[access_key:secret_key@]host[:port]/bucket[/prefix]`
/// - `gs://bucket[/prefix]`
pub fn resolve_location(dsn: &str) -> Result<StoreLocation> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(anyhow::anyhow!(
                    "File DSN must specify a path: file:///path/to/storage"
                ));
            }
            std::fs::create_dir_all(path)
                .map_err(|e| anyhow::anyhow!("Directory {} is uncreatable: {}", path, e))?;
            Ok(StoreLocation {
                store: Arc::new(LocalFileSystem::new_with_prefix(path)?),
                prefix: ObjectPath::default(),
            })
        }
        "memory" => Ok(StoreLocation {
            store: Arc::new(InMemory::new()),
            prefix: ObjectPath::default(),
        }),
        "s3" => {
            let (bucket, prefix) = split_bucket_and_prefix(url.path());
            let builder = create_s3_builder_from_dsn(&url, bucket)?;
            Ok(StoreLocation {
                store: Arc::new(builder.build()?),
                prefix: ObjectPath::from(prefix),
            })
        }
        "gs" => {
            let bucket = url
                .host_str()
                .ok_or_else(|| anyhow::anyhow!("GCS DSN must specify a bucket: gs://bucket"))?;
            let store = GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(bucket)
                .build()?;
            Ok(StoreLocation {
                store: Arc::new(store),
                prefix: ObjectPath::from(url.path().trim_matches('/')),
            })
        }
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3, gs",
            scheme
        )),
    }
}

fn split_bucket_and_prefix(path: &str) -> (&str, &str) {
    let trimmed = path.trim_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix),
        None => (trimmed, ""),
    }
}

/// Create an S3 builder from a DSN
/// DSN format: s3://[access_key:secret_key@]host[:port]/bucket
pub fn create_s3_builder_from_dsn(dsn: &Url, bucket: &str) -> Result<AmazonS3Builder> {
    let host = dsn
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing S3 host in DSN"))?;
    let port = dsn.port();

    if bucket.is_empty() {
        return Err(anyhow::anyhow!(
            "S3 DSN must specify a bucket: s3://host/bucket"
        ));
    }

    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region("us-east-1"); // Default region

    let access_key = dsn.username();
    let secret_key = dsn.password().unwrap_or("");

    if !access_key.is_empty() {
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);
    }

    // Real S3 needs no endpoint, anything else (MinIO etc) does
    let endpoint = if host.contains("amazonaws.com") {
        None
    } else {
        let scheme = if port == Some(443) { "https" } else { "http" };
        Some(match port {
            Some(p) => format!("{scheme}://{host}:{p}"),
            None => format!("{scheme}://{host}"),
        })
    };

    if let Some(endpoint) = endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false); // MinIO requires path-style URLs
    }

    if access_key.is_empty() {
        if let Ok(env_key) = std::env::var("AWS_ACCESS_KEY_ID") {
            builder = builder.with_access_key_id(env_key);
        }
        if let Ok(env_secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            builder = builder.with_secret_access_key(env_secret);
        }
        if let Ok(env_region) = std::env::var("AWS_DEFAULT_REGION") {
            builder = builder.with_region(env_region);
        }
    }

    Ok(builder)
}
