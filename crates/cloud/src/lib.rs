//! Amazon S3 (and S3-compatible) object store.
//!
//! Conditional writes map onto S3's `If-None-Match: *` (create-only) and
//! `If-Match: <etag>` (compare-and-swap) headers; the object ETag is the
//! version token.

use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use async_trait::async_trait;
use blindeval_core::storage::{
    validate_key, ObjectStore, ObjectVersion, PutMode, StorageError, StoredObject,
};

/// HTTP status S3 returns when a conditional write loses.
const STATUS_PRECONDITION_FAILED: u16 = 412;

/// Returned when a concurrent conditional write is still in flight.
const STATUS_CONFLICT: u16 = 409;

/// Object store backed by one S3 bucket.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the ambient AWS configuration (environment,
    /// profile, instance metadata). `endpoint_url` targets an
    /// S3-compatible service and switches to path-style addressing.
    pub async fn connect(bucket: impl Into<String>, endpoint_url: Option<&str>) -> Self {
        let shared = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url).force_path_style(true);
        }
        let store = Self::new(Client::from_conf(builder.build()), bucket);
        tracing::info!(bucket = %store.bucket, endpoint = ?endpoint_url, "S3 object store configured");
        store
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn backend_error<E>(key: &str, err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::Backend(format!("{key}: {}", DisplayErrorContext(&err)))
}

/// Whether a failed write was rejected by its precondition.
fn is_precondition_failure<E>(err: &SdkError<E>) -> bool
where
    E: ProvideErrorMetadata,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    if matches!(status, Some(STATUS_PRECONDITION_FAILED | STATUS_CONFLICT)) {
        return true;
    }
    matches!(
        err.as_service_error().and_then(|e| e.code()),
        Some("PreconditionFailed" | "ConditionalRequestConflict")
    )
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, StorageError> {
        validate_key(key)?;
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(backend_error(key, err));
            }
        };

        let version = ObjectVersion(output.e_tag().unwrap_or_default().to_string());
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(format!("{key}: failed to read body: {e}")))?
            .into_bytes()
            .to_vec();
        Ok(Some(StoredObject { body, version }))
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        mode: PutMode,
    ) -> Result<ObjectVersion, StorageError> {
        validate_key(key)?;
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body));
        let request = match mode {
            PutMode::Overwrite => request,
            PutMode::Create => request.if_none_match("*"),
            PutMode::IfMatch(version) => request.if_match(version.0),
        };

        match request.send().await {
            Ok(output) => Ok(ObjectVersion(
                output.e_tag().unwrap_or_default().to_string(),
            )),
            Err(err) if is_precondition_failure(&err) => Err(StorageError::PreconditionFailed {
                key: key.to_string(),
            }),
            Err(err) => Err(backend_error(key, err)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| backend_error(prefix, e))?;
            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));
        }
        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use aws_sdk_s3::config::Region;

    fn offline_store() -> S3Store {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        S3Store::new(Client::from_conf(config), "eval-bucket")
    }

    #[test]
    fn describes_bucket() {
        assert_eq!(offline_store().describe(), "s3://eval-bucket");
    }

    #[tokio::test]
    async fn invalid_keys_rejected_before_any_request() {
        let store = offline_store();
        assert_matches!(store.get("/abs").await, Err(StorageError::InvalidKey(_)));
        assert_matches!(
            store.put("a/../b", Vec::new(), PutMode::Create).await,
            Err(StorageError::InvalidKey(_))
        );
    }
}
