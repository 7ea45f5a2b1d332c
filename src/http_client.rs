//! Fetches byte ranges over HTTP.

use crate::byte_range_fetcher::ByteRangeFetcher;
use crate::error::DmrppError;

use bytes::Bytes;

/// Basic authentication credentials sent with every request.
#[derive(Clone)]
struct BasicAuth {
    username: String,
    password: String,
}

/// Fetches byte ranges of `http://` and `https://` sources with range requests.
#[derive(Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
    auth: Option<BasicAuth>,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("auth", &self.auth.as_ref().map(|auth| &auth.username))
            .finish()
    }
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send basic authentication credentials with every request.
    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = Some(BasicAuth {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }
}

impl ByteRangeFetcher for HttpFetcher {
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn fetch(&self, source_id: &str, offset: u64, length: u64) -> Result<Bytes, DmrppError> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let request = self
            .client
            .get(source_id)
            .header(reqwest::header::RANGE, format!("bytes={}-{}", offset, offset + length - 1));
        let request = match &self.auth {
            Some(auth) => request.basic_auth(&auth.username, Some(&auth.password)),
            None => request,
        };
        let response = request.send().await?;
        let body = match response.status() {
            reqwest::StatusCode::PARTIAL_CONTENT => response.bytes().await?,
            // The server ignored the range and sent the whole object.
            reqwest::StatusCode::OK => {
                let whole = response.bytes().await?;
                let start = usize::try_from(offset)?.min(whole.len());
                let end = start.saturating_add(length.try_into()?).min(whole.len());
                whole.slice(start..end)
            }
            status => {
                return Err(DmrppError::HttpStatus {
                    source_id: source_id.to_string(),
                    status: status.as_u16(),
                })
            }
        };
        // Chunk data is reinterpreted as wider numbers, so hand it back 8-byte aligned.
        let mut buf = maligned::align_first::<u8, maligned::A8>(body.len());
        buf.extend_from_slice(&body);
        Ok(buf.into())
    }
}
