//! Batch payload storage
//!
//! Sealed batch payloads are written under a content-addressed key derived
//! from the merkle root, so re-uploading the same batch is a no-op by
//! construction. Operators fetch the payload through the public download
//! endpoint recorded on-chain as the batch data pointer.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

use crate::crypto::Hash256;
use crate::errors::{BatcherError, Result};
use crate::retry::{self, RetryConfig};

/// Storage key for a batch payload.
pub fn batch_key(merkle_root: &Hash256) -> String {
    format!("batches/{}.cbor", hex::encode(merkle_root))
}

/// Where sealed batch payloads go.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` under `key` and return the public URL. Writes are
    /// idempotent per key.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String>;
}

/// S3-backed store.
pub struct S3Store {
    client: S3Client,
    bucket: String,
    download_endpoint: String,
}

impl S3Store {
    /// Build the client from ambient AWS credentials; `upload_endpoint`
    /// overrides the S3 endpoint for local development stacks.
    pub async fn connect(
        bucket: String,
        download_endpoint: String,
        upload_endpoint: Option<String>,
    ) -> Self {
        let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = match upload_endpoint {
            Some(endpoint) => {
                let conf = aws_sdk_s3::config::Builder::from(&shared)
                    .endpoint_url(endpoint)
                    .force_path_style(true)
                    .build();
                S3Client::from_conf(conf)
            }
            None => S3Client::new(&shared),
        };

        Self {
            client,
            bucket,
            download_endpoint: download_endpoint.trim_end_matches('/').to_string(),
        }
    }

    async fn put_once(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/cbor")
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| BatcherError::StorageUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        retry::retry(&RetryConfig::storage(), "s3_put", || {
            self.put_once(key, bytes.clone())
        })
        .await?;
        Ok(format!("{}/{}", self.download_endpoint, key))
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        self.objects
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), bytes);
        Ok(format!("mem://{key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_key_is_hex_of_root() {
        let root = [0xabu8; 32];
        let key = batch_key(&root);
        assert!(key.starts_with("batches/"));
        assert!(key.ends_with(".cbor"));
        assert!(key.contains(&"ab".repeat(32)));
    }

    #[tokio::test]
    async fn memory_store_puts_are_idempotent_per_key() {
        let store = MemoryStore::new();
        let url_a = store.put("batches/x.cbor", vec![1, 2, 3]).await.unwrap();
        let url_b = store.put("batches/x.cbor", vec![1, 2, 3]).await.unwrap();

        assert_eq!(url_a, url_b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("batches/x.cbor"), Some(vec![1, 2, 3]));
    }
}
