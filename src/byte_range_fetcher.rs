//! Byte range fetchers.
//!
//! The reader never interprets a manifest's source identifier. It hands the identifier and a byte
//! range to a [ByteRangeFetcher], which returns the bytes or fails.

use crate::error::DmrppError;
use crate::http_client::HttpFetcher;
use crate::s3_client::S3Fetcher;

use bytes::Bytes;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use url::Url;

/// Byte range fetcher trait.
///
/// Implementations must return exactly `length` bytes starting at `offset`, or an error.
pub trait ByteRangeFetcher: Send + Sync {
    /// Fetch a byte range of a data source.
    ///
    /// # Arguments
    ///
    /// * `source_id`: Source identifier recorded in the manifest
    /// * `offset`: Offset of the first byte
    /// * `length`: Number of bytes
    fn fetch(
        &self,
        source_id: &str,
        offset: u64,
        length: u64,
    ) -> impl Future<Output = Result<Bytes, DmrppError>> + Send;
}

/// Fetches byte ranges of local files under a root directory.
///
/// Sources are plain paths or `file://` URLs. Relative paths are resolved against the root, and
/// any path that does not lead to a file under the root is refused, whether it escapes through
/// `..`, an absolute path or a symbolic link.
#[derive(Debug)]
pub struct LocalFileFetcher {
    /// Canonical root directory.
    root: PathBuf,
}

impl LocalFileFetcher {
    /// Create a new local file fetcher.
    ///
    /// # Arguments
    ///
    /// * `root`: Directory holding every file this fetcher may read
    pub fn new(root: &Path) -> Result<Self, DmrppError> {
        let root = std::fs::canonicalize(root).map_err(|err| DmrppError::SourceOpenFailure {
            source_id: root.display().to_string(),
            reason: format!("local root is not accessible: {}", err),
        })?;
        Ok(Self { root })
    }

    /// Returns the canonical path of a local source identifier under the root.
    ///
    /// # Arguments
    ///
    /// * `source_id`: Plain path or `file://` URL
    pub async fn resolve(&self, source_id: &str) -> Result<PathBuf, DmrppError> {
        let denied = || DmrppError::SourceAccessDenied {
            source_id: source_id.to_string(),
        };
        let path = if source_id.starts_with("file://") {
            Url::parse(source_id)
                .ok()
                .and_then(|url| url.to_file_path().ok())
                .ok_or_else(|| DmrppError::UnsupportedSourceScheme {
                    source_id: source_id.to_string(),
                })?
        } else {
            PathBuf::from(source_id)
        };
        let path = self.root.join(path);
        match tokio::fs::canonicalize(&path).await {
            Ok(canonical) if canonical.starts_with(&self.root) => Ok(canonical),
            Ok(_) => Err(denied()),
            // Only report a missing file when the path could not have left the root.
            Err(err)
                if path.starts_with(&self.root)
                    && !path
                        .components()
                        .any(|component| component == Component::ParentDir) =>
            {
                Err(err.into())
            }
            Err(_) => Err(denied()),
        }
    }
}

impl ByteRangeFetcher for LocalFileFetcher {
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn fetch(&self, source_id: &str, offset: u64, length: u64) -> Result<Bytes, DmrppError> {
        let path = self.resolve(source_id).await?;
        let mut file = tokio::fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = maligned::align_first::<u8, maligned::A8>(length.try_into()?);
        buf.resize(length.try_into()?, 0);
        file.read_exact(&mut buf).await?;
        Ok(buf.into())
    }
}

/// The fetcher chosen for a source identifier.
enum Route<'a> {
    Local(&'a LocalFileFetcher),
    S3(&'a S3Fetcher),
    Http(&'a HttpFetcher),
}

/// Dispatches fetches on the scheme of the source identifier.
///
/// `s3://` identifiers go to S3, `http://` and `https://` identifiers to HTTP, and plain paths
/// and `file://` URLs to the local file fetcher, each only when configured. Anything else is
/// rejected.
#[derive(Debug, Default)]
pub struct FetcherRouter {
    local: Option<LocalFileFetcher>,
    s3: Option<S3Fetcher>,
    http: Option<HttpFetcher>,
}

impl FetcherRouter {
    /// Create a new fetcher router.
    ///
    /// # Arguments
    ///
    /// * `local`: Optional fetcher for local files
    /// * `s3`: Optional fetcher for `s3://` identifiers
    /// * `http`: Optional fetcher for `http://` and `https://` identifiers
    pub fn new(
        local: Option<LocalFileFetcher>,
        s3: Option<S3Fetcher>,
        http: Option<HttpFetcher>,
    ) -> Self {
        Self { local, s3, http }
    }

    fn route(&self, source_id: &str) -> Result<Route<'_>, DmrppError> {
        let route = match scheme_of(source_id) {
            None | Some("file") => self.local.as_ref().map(Route::Local),
            Some("s3") => self.s3.as_ref().map(Route::S3),
            Some("http") | Some("https") => self.http.as_ref().map(Route::Http),
            Some(_) => None,
        };
        route.ok_or_else(|| DmrppError::UnsupportedSourceScheme {
            source_id: source_id.to_string(),
        })
    }

    /// Check that a source identifier could be fetched from.
    ///
    /// Local sources must exist under the local root. Remote sources only need a configured
    /// fetcher.
    ///
    /// # Arguments
    ///
    /// * `source_id`: Source identifier recorded in a manifest
    pub async fn admit(&self, source_id: &str) -> Result<(), DmrppError> {
        match self.route(source_id)? {
            Route::Local(local) => local.resolve(source_id).await.map(|_| ()),
            Route::S3(_) | Route::Http(_) => Ok(()),
        }
    }
}

/// Returns the scheme of a source identifier, if it has one.
fn scheme_of(source_id: &str) -> Option<&str> {
    source_id
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .filter(|scheme| !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric()))
}

impl ByteRangeFetcher for FetcherRouter {
    async fn fetch(&self, source_id: &str, offset: u64, length: u64) -> Result<Bytes, DmrppError> {
        match self.route(source_id)? {
            Route::Local(local) => local.fetch(source_id, offset, length).await,
            Route::S3(s3) => s3.fetch(source_id, offset, length).await,
            Route::Http(http) => http.fetch(source_id, offset, length).await,
        }
    }
}
