// S3-compatible object storage client
// No unwrap(), use #[tracing::instrument], proper error handling

use crate::config::S3Config;
use crate::errors::StorageError;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Listing entry for one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    /// RFC 3339 timestamp as reported by the server
    pub last_modified: String,
    pub size: u64,
}

/// S3 client wrapper bound to one bucket
#[derive(Clone, Debug)]
pub struct S3Client {
    bucket: Arc<Bucket>,
    bucket_name: String,
}

impl S3Client {
    /// Create a client for the configured bucket
    pub async fn new(config: &S3Config) -> Result<Self, StorageError> {
        Self::for_bucket(config, &config.bucket).await
    }

    /// Create a client for another bucket reachable with the same credentials
    #[instrument(skip(config), fields(endpoint = %config.endpoint))]
    pub async fn for_bucket(config: &S3Config, bucket_name: &str) -> Result<Self, StorageError> {
        info!("Initializing S3 client");

        // rust-s3 Region::Custom doesn't expect the scheme
        let endpoint = config
            .endpoint
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .to_string();

        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| {
            error!(error = %e, "Failed to create S3 credentials");
            StorageError::S3Error(format!("Failed to create credentials: {}", e))
        })?;

        let region = Region::Custom {
            region: config.region.clone(),
            endpoint,
        };

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| {
                error!(error = %e, "Failed to create S3 bucket handle");
                StorageError::S3Error(format!("Failed to create bucket: {}", e))
            })?
            .with_path_style();

        info!(
            bucket = %bucket_name,
            endpoint = %config.endpoint,
            "S3 client initialized successfully"
        );

        Ok(Self {
            bucket: Arc::from(bucket),
            bucket_name: bucket_name.to_string(),
        })
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    /// Health check: list the bucket root
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StorageError> {
        debug!("Performing S3 health check");

        match self
            .bucket
            .list("".to_string(), Some("/".to_string()))
            .await
        {
            Ok(_) => {
                debug!("S3 health check passed");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "S3 health check failed");
                Err(StorageError::S3Error(format!("Health check failed: {}", e)))
            }
        }
    }

    /// Retrieve an object's bytes
    #[instrument(skip(self), fields(bucket = %self.bucket_name, path = %path))]
    pub async fn get_object(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        debug!("Retrieving object from S3");

        let response = self.bucket.get_object(path).await.map_err(|e| {
            error!(error = %e, path = %path, "Failed to retrieve object from S3");
            StorageError::S3Error(format!("Failed to get object '{}': {}", path, e))
        })?;

        if response.status_code() >= 300 {
            return Err(StorageError::S3Error(format!(
                "Failed to get object '{}': HTTP {}",
                path,
                response.status_code()
            )));
        }

        let data = response.bytes().to_vec();
        debug!(path = %path, size = data.len(), "Object retrieved successfully");
        Ok(data)
    }

    /// List every object under a prefix, recursing through "directories"
    #[instrument(skip(self), fields(bucket = %self.bucket_name, prefix = %prefix))]
    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>, StorageError> {
        debug!("Listing objects in S3");

        let results = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| {
                error!(error = %e, prefix = %prefix, "Failed to list objects in S3");
                StorageError::S3Error(format!(
                    "Failed to list objects with prefix '{}': {}",
                    prefix, e
                ))
            })?;

        let objects: Vec<ObjectSummary> = results
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| ObjectSummary {
                key: object.key,
                last_modified: object.last_modified,
                size: object.size,
            })
            .collect();

        debug!(prefix = %prefix, count = objects.len(), "Objects listed successfully");
        Ok(objects)
    }
}
