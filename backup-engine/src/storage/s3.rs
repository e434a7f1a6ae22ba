//! S3-compatible object store using presigned requests.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Body, Client};
use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use super::retry::{retry_call, RetryConfig};
use super::{ObjectInfo, ObjectStore};
use crate::utils::errors::{EngineError, Result};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

pub struct S3ObjectStore {
    bucket: Bucket,
    credentials: Credentials,
    client: Client,
    retry: RetryConfig,
}

impl S3ObjectStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Result<Self> {
        let base_url = endpoint
            .parse()
            .map_err(|e| EngineError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}")))?;

        // Endpoints are always explicit (on-premise S3 too); use path-style addressing.
        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| EngineError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            bucket,
            credentials: Credentials::new(access_key, secret_key),
            client,
            retry,
        })
    }
}

impl ObjectStore for S3ObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", prefix);
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let body = retry_call(&self.retry, &format!("S3 LIST {prefix}"), || {
                let resp = self.client.get(url.as_str()).send()?.error_for_status()?;
                Ok(resp.bytes()?)
            })?;
            let parsed = ListObjectsV2::parse_response(&body).map_err(|e| {
                EngineError::Storage(format!("S3 LIST {prefix}: failed to parse response: {e}"))
            })?;

            for obj in parsed.contents {
                // Skip directory markers
                if obj.key.ends_with('/') {
                    continue;
                }
                objects.push(ObjectInfo {
                    key: obj.key,
                    size: obj.size,
                });
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn get_to_file(&self, key: &str, dest: &Path) -> Result<()> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        retry_call(&self.retry, &format!("S3 GET {key}"), || {
            let mut resp = self.client.get(url.as_str()).send()?.error_for_status()?;
            let mut file = File::create(dest)?;
            resp.copy_to(&mut file)?;
            file.flush()?;
            Ok(())
        })
    }

    fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        retry_call(&self.retry, &format!("S3 GET {key}"), || {
            let resp = self.client.get(url.as_str()).send()?.error_for_status()?;
            Ok(resp.bytes()?.to_vec())
        })
    }

    fn put_file(&self, key: &str, src: &Path) -> Result<()> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        retry_call(&self.retry, &format!("S3 PUT {key}"), || {
            let file = File::open(src)?;
            let len = file.metadata()?.len();
            self.client
                .put(url.as_str())
                .body(Body::sized(file, len))
                .send()?
                .error_for_status()?;
            Ok(())
        })
    }

    fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        retry_call(&self.retry, &format!("S3 PUT {key}"), || {
            self.client
                .put(url.as_str())
                .body(data.to_vec())
                .send()?
                .error_for_status()?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        retry_call(&self.retry, &format!("S3 DELETE {key}"), || {
            let resp = self.client.delete(url.as_str()).send()?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(());
            }
            resp.error_for_status()?;
            Ok(())
        })
    }
}
