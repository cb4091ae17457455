use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, TryStreamExt};
use hmac::{Hmac, Mac};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, DATE, HOST};
use sha1::Sha1;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::config::StoreConfig;

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Seam to the remote, durable, guid-keyed blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn put(&self, guid: &str, file: &Path) -> anyhow::Result<()>;
    async fn get(&self, guid: &str) -> anyhow::Result<ByteStream>;
    async fn delete(&self, guid: &str) -> anyhow::Result<()>;
}

const OCTET_STREAM: &str = "application/octet-stream";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
// Bodies can be large; the whole request gets a generous deadline.
const REQUEST_DEADLINE: Duration = Duration::from_secs(240);

/// Signed HTTP client for one bucket of the blob store. Requests carry an
/// HMAC-SHA1 signature over `method\nmd5\ncontent-type\ndate\nresource`.
pub struct BlobStoreClient {
    cfg: StoreConfig,
    bucket: String,
    client: reqwest::Client,
}

impl BlobStoreClient {
    pub fn new(cfg: &StoreConfig, bucket: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_DEADLINE)
            .build()
            .context("building blob store client")?;
        Ok(Self {
            cfg: cfg.clone(),
            bucket: bucket.to_string(),
            client,
        })
    }

    fn resource(&self, guid: &str) -> String {
        format!("/{}/{}", self.bucket, guid)
    }

    fn url(&self, resource: &str) -> String {
        format!("{}{}", self.cfg.domain, resource)
    }

    fn date_header() -> String {
        Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    fn authorization(&self, method: &str, date: &str, resource: &str) -> anyhow::Result<String> {
        let canonical = [method, "", OCTET_STREAM, date, resource].join("\n");
        let mut mac = Hmac::<Sha1>::new_from_slice(self.cfg.secret_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("hmac key: {e}"))?;
        mac.update(canonical.as_bytes());
        let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!(
            "{} {}:{}",
            self.cfg.auth_scheme, self.cfg.access_key, signature
        ))
    }

    fn signed(&self, method: reqwest::Method, guid: &str) -> anyhow::Result<reqwest::RequestBuilder> {
        let resource = self.resource(guid);
        let date = Self::date_header();
        let authorization = self.authorization(method.as_str(), &date, &resource)?;
        let mut request = self
            .client
            .request(method, self.url(&resource))
            .header(AUTHORIZATION, authorization)
            .header(DATE, date)
            .header(CONTENT_TYPE, OCTET_STREAM)
            .header(ACCEPT, "application/json");
        if !self.cfg.host.is_empty() {
            request = request.header(HOST, &self.cfg.host);
        }
        Ok(request)
    }
}

#[async_trait]
impl ObjectStore for BlobStoreClient {
    async fn put(&self, guid: &str, file: &Path) -> anyhow::Result<()> {
        if guid.is_empty() {
            bail!("upload to {}: empty guid", self.bucket);
        }
        let handle = tokio::fs::File::open(file)
            .await
            .with_context(|| format!("opening {}", file.display()))?;
        let length = handle.metadata().await?.len();
        info!(bucket = %self.bucket, guid = %guid, bytes = length, "uploading to blob store");

        let response = self
            .signed(reqwest::Method::PUT, guid)?
            .header(CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(handle)))
            .send()
            .await
            .with_context(|| format!("PUT {}", self.resource(guid)))?;

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("PUT {} returned {status}: {body}", self.resource(guid));
        }
        Ok(())
    }

    async fn get(&self, guid: &str) -> anyhow::Result<ByteStream> {
        if guid.is_empty() {
            bail!("download from {}: empty guid", self.bucket);
        }
        info!(bucket = %self.bucket, guid = %guid, "downloading from blob store");

        let response = self
            .signed(reqwest::Method::GET, guid)?
            .send()
            .await
            .with_context(|| format!("GET {}", self.resource(guid)))?;

        if response.status() != reqwest::StatusCode::OK {
            bail!(
                "GET {} returned {}",
                self.resource(guid),
                response.status()
            );
        }
        let stream = response
            .bytes_stream()
            .map_err(std::io::Error::other);
        Ok(Box::pin(stream))
    }

    async fn delete(&self, guid: &str) -> anyhow::Result<()> {
        if guid.is_empty() {
            bail!("delete from {}: empty guid", self.bucket);
        }
        info!(bucket = %self.bucket, guid = %guid, "deleting from blob store");

        let response = self
            .signed(reqwest::Method::DELETE, guid)?
            .send()
            .await
            .with_context(|| format!("DELETE {}", self.resource(guid)))?;

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(bucket = %self.bucket, guid = %guid, status = %status, "blob store delete failed");
            bail!("DELETE {} returned {status}: {body}", self.resource(guid));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory stand-in for the blob store used across handler tests.
    #[derive(Default)]
    pub struct MemoryStore {
        pub objects: Mutex<HashMap<String, Vec<u8>>>,
        pub deletes: Mutex<Vec<String>>,
        pub fail_puts: AtomicBool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_puts() -> Self {
            let store = Self::default();
            store.fail_puts.store(true, Ordering::Relaxed);
            store
        }

        pub fn object(&self, guid: &str) -> Option<Vec<u8>> {
            self.objects.lock().unwrap().get(guid).cloned()
        }

        pub fn insert(&self, guid: &str, bytes: Vec<u8>) {
            self.objects.lock().unwrap().insert(guid.to_string(), bytes);
        }

        pub fn deleted(&self) -> Vec<String> {
            self.deletes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(&self, guid: &str, file: &Path) -> anyhow::Result<()> {
            if self.fail_puts.load(Ordering::Relaxed) {
                bail!("simulated remote failure");
            }
            let bytes = tokio::fs::read(file).await?;
            self.insert(guid, bytes);
            Ok(())
        }

        async fn get(&self, guid: &str) -> anyhow::Result<ByteStream> {
            let Some(bytes) = self.object(guid) else {
                bail!("no such object: {guid}");
            };
            let stream = futures::stream::iter(
                bytes
                    .chunks(4096)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect::<Vec<std::io::Result<Bytes>>>(),
            );
            Ok(Box::pin(stream))
        }

        async fn delete(&self, guid: &str) -> anyhow::Result<()> {
            self.objects.lock().unwrap().remove(guid);
            self.deletes.lock().unwrap().push(guid.to_string());
            Ok(())
        }
    }
}
