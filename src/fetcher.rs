//! Toxic-list feed: conditional HTTP download into a plain list file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, StatusCode, Url};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::ChainbanError;
use crate::lists::parse_ip_list;
use crate::utils::format_count;

const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 2000;

/// Maximum size of a feed download (10 MB).
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024;

/// A producer of the toxic list file.
#[async_trait]
pub trait FeedSource: Send {
    /// Fetch the feed. `Ok(true)` means the list file changed.
    async fn fetch(&mut self) -> Result<bool>;

    /// The list file this feed writes.
    fn path(&self) -> &Path;
}

/// HTTP feed using `If-None-Match` / `If-Modified-Since` so an unchanged
/// list costs one `304`.
pub struct HttpFeed {
    client: Client,
    url: Url,
    path: PathBuf,
    etag: Option<String>,
    last_modified: Option<String>,
    retry_delay: Duration,
}

/// Format a timestamp as an HTTP date.
fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

impl HttpFeed {
    pub fn new(url: Url, path: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .user_agent(format!("chainban/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url,
            path: path.into(),
            etag: None,
            last_modified: None,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Base delay between retries (doubled on each attempt).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `If-Modified-Since` value: the last server date seen, else the local
    /// file's modification time.
    fn modified_since(&self) -> Option<String> {
        if let Some(value) = &self.last_modified {
            return Some(value.clone());
        }
        let mtime = std::fs::metadata(&self.path).ok()?.modified().ok()?;
        Some(http_date(DateTime::<Utc>::from(mtime)))
    }

    /// One conditional GET. `None` means `304 Not Modified`.
    async fn request(&mut self) -> Result<Option<Vec<u8>>> {
        let mut request = self.client.get(self.url.clone());
        if let Some(etag) = &self.etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(since) = self.modified_since() {
            request = request.header(IF_MODIFIED_SINCE, since);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ChainbanError::Feed(format!("{} returned HTTP {}", self.url, status)).into());
        }

        if let Some(length) = response.content_length() {
            if length as usize > MAX_FEED_SIZE {
                return Err(ChainbanError::Feed(format!(
                    "Response too large: {} bytes (max: {} bytes)",
                    length, MAX_FEED_SIZE
                ))
                .into());
            }
        }

        let headers = response.headers();
        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .context("Failed to read response body")?;
        if body.len() > MAX_FEED_SIZE {
            return Err(ChainbanError::Feed(format!(
                "Downloaded content too large: {} bytes (max: {} bytes)",
                body.len(),
                MAX_FEED_SIZE
            ))
            .into());
        }

        self.etag = etag;
        self.last_modified = last_modified;
        Ok(Some(body.to_vec()))
    }

    async fn request_with_retry(&mut self) -> Result<Option<Vec<u8>>> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1));
                debug!("Retry {} after {:?} for {}", attempt, delay, self.url);
                tokio::time::sleep(delay).await;
            }

            match self.request().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!("Fetching {} failed: {:#}", self.url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Unknown error")))
    }

    fn write_atomically(&self, content: &[u8]) -> Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;

        let mut temp = NamedTempFile::new_in(parent)
            .context("Failed to create temporary file for toxic list")?;
        temp.write_all(content)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .with_context(|| format!("Failed to persist toxic list {:?}", self.path))?;
        Ok(())
    }
}

#[async_trait]
impl FeedSource for HttpFeed {
    async fn fetch(&mut self) -> Result<bool> {
        info!("Fetching toxic list from {}", self.url);

        let Some(body) = self
            .request_with_retry()
            .await
            .with_context(|| format!("Failed to fetch {}", self.url))?
        else {
            info!("Toxic list unchanged");
            return Ok(false);
        };

        let text = String::from_utf8_lossy(&body);
        let entries = parse_ip_list(&text, "toxic").len();
        self.write_atomically(&body)?;
        info!(
            "Fetched toxic list - {} entries written to {}",
            format_count(entries),
            self.path.display()
        );
        Ok(true)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
