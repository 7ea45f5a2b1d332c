//! A simplified S3 client that supports ranged downloads of objects, and the
//! [crate::byte_range_fetcher::ByteRangeFetcher] built on it for `s3://bucket/key` sources.

use std::fmt::Display;

use crate::byte_range_fetcher::ByteRangeFetcher;
use crate::error::DmrppError;

use aws_credential_types::Credentials;
use aws_sdk_s3::config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use bytes::Bytes;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::Instrument;
use url::Url;

#[derive(Clone, Eq, Hash, PartialEq)]
pub enum S3Credentials {
    AccessKey {
        access_key: String,
        secret_key: String,
    },
    None,
}

impl S3Credentials {
    /// Create an access key credential.
    pub fn access_key(access_key: &str, secret_key: &str) -> Self {
        S3Credentials::AccessKey {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        }
    }
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            S3Credentials::AccessKey { access_key, .. } => f
                .debug_struct("AccessKey")
                .field("access_key", access_key)
                .finish_non_exhaustive(),
            S3Credentials::None => write!(f, "None"),
        }
    }
}

/// A map containing initialised S3Client objects.
///
/// The [aws_sdk_s3::Client] object is relatively expensive to create, so we reuse them where
/// possible. The map's key is a 2-tuple of the S3 URL and credentials.
#[derive(Debug, Default)]
pub struct S3ClientMap {
    /// A [hashbrown::HashMap] for storing the S3 clients. A read-write lock synchronises access to
    /// the map, optimised for reads.
    map: RwLock<HashMap<(Url, S3Credentials), S3Client>>,
}

impl S3ClientMap {
    /// Create and return an [crate::s3_client::S3ClientMap].
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create an [crate::s3_client::S3Client] object from the map.
    ///
    /// # Arguments
    ///
    /// * `url`: Object storage API URL
    /// * `credentials`: Object storage account credentials
    pub async fn get(&self, url: &Url, credentials: S3Credentials) -> S3Client {
        let key = (url.clone(), credentials.clone());
        // Common case: return an existing client from the map.
        {
            let map = self.map.read().await;
            if let Some(client) = map.get(&key) {
                return client.clone();
            }
        }
        // Less common case: create a new client, insert it into the map and return it.
        let mut map = self.map.write().await;
        // Another task may have inserted it after we dropped the read lock.
        if let Some(client) = map.get(&key) {
            client.clone()
        } else {
            tracing::info!("Creating new S3 client for {}", url);
            let client = S3Client::new(url, credentials).await;
            let (_, client) = map.insert_unique_unchecked(key, client);
            client.clone()
        }
    }
}

/// S3 client object.
#[derive(Clone, Debug)]
pub struct S3Client {
    /// Underlying AWS SDK S3 client object.
    client: Client,
    /// A unique identifier for the client
    id: String,
}

impl Display for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl S3Client {
    /// Creates an S3Client object
    ///
    /// # Arguments
    ///
    /// * `url`: Object storage API URL
    /// * `credentials`: Object storage account credentials
    pub async fn new(url: &Url, credentials: S3Credentials) -> Self {
        let region = Region::new("us-east-1");
        let builder = aws_sdk_s3::Config::builder().behavior_version(BehaviorVersion::latest());
        let builder = match credentials {
            S3Credentials::AccessKey {
                access_key,
                secret_key,
            } => {
                let credentials = Credentials::from_keys(access_key, secret_key, None);
                builder.credentials_provider(credentials)
            }
            S3Credentials::None => builder,
        };
        let s3_config = builder
            .region(Some(region))
            .endpoint_url(url.to_string())
            .force_path_style(true)
            .build();
        let client = Client::from_conf(s3_config);
        Self {
            client,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Downloads a byte range of an object and returns the data as Bytes.
    ///
    /// The data is copied into an 8-byte aligned buffer so that decoded chunks may later be
    /// viewed as wider numeric types without a further copy.
    ///
    /// # Arguments
    ///
    /// * `bucket`: Name of the bucket
    /// * `key`: Name of the object in the bucket
    /// * `offset`: Offset of the first byte
    /// * `length`: Number of bytes
    pub async fn download_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, DmrppError> {
        let mut response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_range(get_range(offset, length))
            .send()
            .instrument(tracing::Span::current())
            .await?;
        // Fail if the content length header is missing.
        let content_length: usize = response
            .content_length()
            .ok_or(DmrppError::S3ContentLengthMissing)?
            .try_into()?;

        let mut buf = maligned::align_first::<u8, maligned::A8>(content_length);
        while let Some(bytes) = response
            .body
            .try_next()
            .instrument(tracing::Span::current())
            .await?
        {
            buf.extend_from_slice(&bytes)
        }
        Ok(buf.into())
    }
}

/// Return a byte range string based on the offset and length, or `None` for an empty range.
///
/// The returned string is compatible with the HTTP Range header, whose end is inclusive.
///
/// # Arguments
///
/// * `offset`: Offset of data in bytes
/// * `length`: Length of data in bytes
pub fn get_range(offset: u64, length: u64) -> Option<String> {
    (length > 0).then(|| format!("bytes={}-{}", offset, offset + length - 1))
}

/// Splits an `s3://bucket/key` identifier into bucket and key.
fn parse_source(source_id: &str) -> Option<(String, String)> {
    let url = Url::parse(source_id).ok()?;
    if url.scheme() != "s3" {
        return None;
    }
    let bucket = url.host_str()?.to_string();
    let key = url.path().trim_start_matches('/').to_string();
    (!key.is_empty()).then_some((bucket, key))
}

/// Fetches byte ranges of `s3://bucket/key` sources from a configured S3 endpoint.
#[derive(Debug)]
pub struct S3Fetcher {
    /// Object storage API URL.
    endpoint: Url,
    /// Object storage account credentials.
    credentials: S3Credentials,
    /// Map of S3 client objects.
    client_map: S3ClientMap,
}

impl S3Fetcher {
    /// Create a new S3 fetcher.
    ///
    /// # Arguments
    ///
    /// * `endpoint`: Object storage API URL
    /// * `credentials`: Object storage account credentials
    pub fn new(endpoint: Url, credentials: S3Credentials) -> Self {
        Self {
            endpoint,
            credentials,
            client_map: S3ClientMap::new(),
        }
    }
}

impl ByteRangeFetcher for S3Fetcher {
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn fetch(&self, source_id: &str, offset: u64, length: u64) -> Result<Bytes, DmrppError> {
        let (bucket, key) =
            parse_source(source_id).ok_or_else(|| DmrppError::UnsupportedSourceScheme {
                source_id: source_id.to_string(),
            })?;
        if length == 0 {
            return Ok(Bytes::new());
        }
        let client = self
            .client_map
            .get(&self.endpoint, self.credentials.clone())
            .instrument(tracing::Span::current())
            .await;
        client.download_range(&bucket, &key, offset, length).await
    }
}
